//! Directory snapshots and the diff between two of them.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Normalized, case-preserved, root-relative path.
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub last_write_time: SystemTime,
    /// Empty for directories.
    pub content_digest: Vec<u8>,
}

/// A logical set of `(path, metadata)` pairs, keyed case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: HashMap<String, FileMetadata>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileMetadata> {
        self.entries.get(&path::ascii_lower_key(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileMetadata> {
        self.entries.values()
    }

    /// Inserts `meta`. If its path case-insensitively collides with one
    /// already present, the existing entry is left in place and the
    /// colliding path is returned so the caller can report it rather than
    /// silently dropping one of the two entries.
    fn insert(&mut self, meta: FileMetadata) -> Option<String> {
        let key = path::ascii_lower_key(&meta.path);
        if let Some(existing) = self.entries.get(&key) {
            return Some(existing.path.clone());
        }
        self.entries.insert(key, meta);
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub change: ChangeKind,
    pub entry_kind: EntryKind,
}

/// Walks `root` and produces a [`Snapshot`]. Entries that cannot be read
/// (permission denied, disappeared mid-walk) are silently omitted rather
/// than failing the whole walk. Symlinks and non-regular files are skipped.
/// If `root` does not exist, returns an empty snapshot.
pub async fn create_snapshot(root: &Path, cancel: &CancellationToken) -> Result<Snapshot> {
    if tokio::fs::metadata(root).await.is_err() {
        return Ok(Snapshot::empty());
    }
    let root = root.to_path_buf();
    let cancel = cancel.clone();
    let result = tokio::task::spawn_blocking(move || create_snapshot_blocking(&root, &cancel))
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?;
    result
}

fn create_snapshot_blocking(root: &Path, cancel: &CancellationToken) -> Result<Snapshot> {
    let mut snapshot = Snapshot::empty();
    let walker = WalkDir::new(root).min_depth(1).into_iter();
    for entry in walker.filter_map(|e| e.ok()) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let normalized = match path::normalize(&relative.to_string_lossy()) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if normalized.is_empty() {
            continue;
        }
        if file_type.is_dir() {
            let path_for_error = normalized.clone();
            if let Some(existing) = snapshot.insert(FileMetadata {
                path: normalized,
                kind: EntryKind::Directory,
                size: 0,
                last_write_time: SystemTime::UNIX_EPOCH,
                content_digest: Vec::new(),
            }) {
                return Err(Error::DuplicatePath(existing, path_for_error));
            }
        } else if file_type.is_file() {
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let size = meta.len();
            let last_write_time = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let content_digest = digest_file(entry.path(), size, last_write_time);
            let path_for_error = normalized.clone();
            if let Some(existing) = snapshot.insert(FileMetadata {
                path: normalized,
                kind: EntryKind::File,
                size,
                last_write_time,
                content_digest,
            }) {
                return Err(Error::DuplicatePath(existing, path_for_error));
            }
        }
        // Other entry types (fifo, device, socket) are skipped.
    }
    trace!(entries = snapshot.len(), root = %root.display(), "captured snapshot");
    Ok(snapshot)
}

/// Digests a file's contents by streaming it through SHA-256. If the file
/// cannot be opened, falls back to digesting `"{size}:{last_write_time}"` so
/// the walk stays total and the resulting digest is still deterministic.
fn digest_file(path: &Path, size: u64, last_write_time: SystemTime) -> Vec<u8> {
    match File::open(path) {
        Ok(mut file) => {
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 64 * 1024];
            loop {
                match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => hasher.update(&buf[..n]),
                    Err(_) => {
                        debug!(path = %path.display(), "failed reading file mid-digest, falling back");
                        return fallback_digest(size, last_write_time);
                    }
                }
            }
            hasher.finalize().to_vec()
        }
        Err(_) => fallback_digest(size, last_write_time),
    }
}

fn fallback_digest(size: u64, last_write_time: SystemTime) -> Vec<u8> {
    let nanos = last_write_time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(format!("{size}:{nanos}").as_bytes());
    hasher.finalize().to_vec()
}

fn is_modified(before: &FileMetadata, after: &FileMetadata) -> bool {
    if before.kind != after.kind {
        return true;
    }
    match after.kind {
        // A directory is "modified" only if its presence/kind changes.
        EntryKind::Directory => false,
        EntryKind::File => {
            before.size != after.size
                || before.last_write_time != after.last_write_time
                || before.content_digest != after.content_digest
        }
    }
}

fn path_sort_key(path: &str) -> (usize, &str) {
    (path.matches('/').count(), path)
}

/// Computes the ordered list of changes between two snapshots. Emits
/// `added`, then `modified`, then `deleted`; within a category, entries are
/// ordered shallowest-path-first so a parent directory's entry always
/// precedes its children's.
pub fn detect_changes(before: &Snapshot, after: &Snapshot) -> Vec<FileChange> {
    let mut added = Vec::new();
    let mut modified = Vec::new();
    for meta in after.iter() {
        match before.get(&meta.path) {
            None => added.push(FileChange {
                path: meta.path.clone(),
                change: ChangeKind::Added,
                entry_kind: meta.kind,
            }),
            Some(prev) => {
                if is_modified(prev, meta) {
                    modified.push(FileChange {
                        path: meta.path.clone(),
                        change: ChangeKind::Modified,
                        entry_kind: meta.kind,
                    });
                }
            }
        }
    }
    let mut deleted = Vec::new();
    for meta in before.iter() {
        if after.get(&meta.path).is_none() {
            deleted.push(FileChange {
                path: meta.path.clone(),
                change: ChangeKind::Deleted,
                entry_kind: meta.kind,
            });
        }
    }
    added.sort_by(|a, b| path_sort_key(&a.path).cmp(&path_sort_key(&b.path)));
    modified.sort_by(|a, b| path_sort_key(&a.path).cmp(&path_sort_key(&b.path)));
    deleted.sort_by(|a, b| path_sort_key(&a.path).cmp(&path_sort_key(&b.path)));

    added.into_iter().chain(modified).chain(deleted).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn nonexistent_root_yields_empty_snapshot() {
        let snapshot = create_snapshot(Path::new("/does/not/exist"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn walks_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main"), b"hi").unwrap();
        fs::write(dir.path().join("config.json"), b"{}").unwrap();

        let snapshot = create_snapshot(dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get("src").unwrap().kind, EntryKind::Directory);
        assert_eq!(snapshot.get("src/main").unwrap().kind, EntryKind::File);
        assert_eq!(snapshot.get("SRC/MAIN").unwrap().size, 2);
    }

    #[tokio::test]
    async fn skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real"), b"data").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();
        let snapshot = create_snapshot(dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        #[cfg(unix)]
        assert!(snapshot.get("link").is_none());
        assert!(snapshot.get("real").is_some());
    }

    #[test]
    fn detects_added_modified_deleted() {
        let mut before = Snapshot::empty();
        before.insert(FileMetadata {
            path: "a.txt".into(),
            kind: EntryKind::File,
            size: 1,
            last_write_time: SystemTime::UNIX_EPOCH,
            content_digest: vec![1],
        });
        before.insert(FileMetadata {
            path: "gone.txt".into(),
            kind: EntryKind::File,
            size: 1,
            last_write_time: SystemTime::UNIX_EPOCH,
            content_digest: vec![1],
        });

        let mut after = Snapshot::empty();
        after.insert(FileMetadata {
            path: "a.txt".into(),
            kind: EntryKind::File,
            size: 2,
            last_write_time: SystemTime::UNIX_EPOCH,
            content_digest: vec![2],
        });
        after.insert(FileMetadata {
            path: "new.txt".into(),
            kind: EntryKind::File,
            size: 1,
            last_write_time: SystemTime::UNIX_EPOCH,
            content_digest: vec![1],
        });

        let changes = detect_changes(&before, &after);
        assert_eq!(changes.len(), 3);
        assert!(
            changes
                .iter()
                .any(|c| c.path == "new.txt" && c.change == ChangeKind::Added)
        );
        assert!(
            changes
                .iter()
                .any(|c| c.path == "a.txt" && c.change == ChangeKind::Modified)
        );
        assert!(
            changes
                .iter()
                .any(|c| c.path == "gone.txt" && c.change == ChangeKind::Deleted)
        );
    }

    #[test]
    fn directory_mtime_alone_is_not_a_modification() {
        let mut before = Snapshot::empty();
        before.insert(FileMetadata {
            path: "d".into(),
            kind: EntryKind::Directory,
            size: 0,
            last_write_time: SystemTime::UNIX_EPOCH,
            content_digest: Vec::new(),
        });
        let mut after = Snapshot::empty();
        after.insert(FileMetadata {
            path: "d".into(),
            kind: EntryKind::Directory,
            size: 0,
            last_write_time: SystemTime::now(),
            content_digest: Vec::new(),
        });
        assert!(detect_changes(&before, &after).is_empty());
    }

    #[test]
    fn parent_directory_precedes_children_within_a_category() {
        let before = Snapshot::empty();
        let mut after = Snapshot::empty();
        after.insert(FileMetadata {
            path: "d/x.txt".into(),
            kind: EntryKind::File,
            size: 1,
            last_write_time: SystemTime::UNIX_EPOCH,
            content_digest: vec![1],
        });
        after.insert(FileMetadata {
            path: "d".into(),
            kind: EntryKind::Directory,
            size: 0,
            last_write_time: SystemTime::UNIX_EPOCH,
            content_digest: Vec::new(),
        });
        let changes = detect_changes(&before, &after);
        let d_index = changes.iter().position(|c| c.path == "d").unwrap();
        let x_index = changes.iter().position(|c| c.path == "d/x.txt").unwrap();
        assert!(d_index < x_index);
    }
}
