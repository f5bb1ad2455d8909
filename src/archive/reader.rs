use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tar::EntryType;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{is_opaque_whiteout_leaf, is_whiteout_leaf, split_path};
use crate::error::{Error, Result};
use crate::path;

/// Streams a tar archive from `source` over `target_dir`, creating files
/// and directories and honoring whiteout entries, on a dedicated blocking
/// thread.
pub async fn apply_archive<R>(source: R, target_dir: PathBuf, cancel: CancellationToken) -> Result<()>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || apply_archive_sync(source, &target_dir, &cancel))
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
}

/// Synchronous core: same contract as [`apply_archive`].
pub fn apply_archive_sync<R: Read>(
    source: R,
    target_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut archive = tar::Archive::new(source);
    let entries = archive
        .entries()
        .map_err(|e| Error::CorruptArchive(e.to_string()))?;

    for entry in entries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut entry = entry.map_err(|e| Error::CorruptArchive(e.to_string()))?;
        let raw_name = entry
            .path()
            .map_err(|e| Error::CorruptArchive(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let normalized = validate_entry_path(&raw_name)?;
        if normalized.is_empty() {
            continue;
        }

        let (parent, leaf) = split_path(&normalized);
        if is_whiteout_leaf(leaf) {
            if is_opaque_whiteout_leaf(leaf) {
                trace!(dir = %parent, "applying opaque whiteout");
                remove_if_exists(&target_dir.join(parent))?;
            } else {
                let name = &leaf[".wh.".len()..];
                let sibling = if parent.is_empty() {
                    name.to_string()
                } else {
                    format!("{parent}/{name}")
                };
                trace!(path = %sibling, "applying whiteout");
                remove_if_exists(&target_dir.join(&sibling))?;
            }
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(target_dir.join(&normalized))?;
            }
            EntryType::Regular => {
                let dest = target_dir.join(&normalized);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&dest)?;
                io::copy(&mut entry, &mut file)
                    .map_err(|e| Error::CorruptArchive(e.to_string()))?;
            }
            _ => {
                // Symlinks, hardlinks, device nodes, etc. are out of scope
                // and ignored on read just as they are never produced on
                // write.
            }
        }
    }
    Ok(())
}

/// Rejects absolute entry names and names containing `..` segments, then
/// normalizes. Absolute rejection happens here, *before* [`path::normalize`]
/// (which strips rather than rejects a leading slash), since an archive
/// entry escaping the target directory is a hard error, not a caller
/// convenience to be tolerated.
fn validate_entry_path(raw: &str) -> Result<String> {
    let as_forward_slashes = raw.replace('\\', "/");
    if as_forward_slashes.starts_with('/') {
        return Err(Error::InvalidPath {
            path: raw.to_string(),
            reason: "archive entry names must not be absolute",
        });
    }
    path::normalize(raw)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ChangeKind, EntryKind, FileChange};
    use std::fs;

    #[test]
    fn rejects_absolute_entry_names() {
        assert!(validate_entry_path("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(validate_entry_path("../escape").is_err());
    }

    #[test]
    fn round_trips_a_single_file() {
        let base = tempfile::tempdir().unwrap();
        fs::write(base.path().join("a.txt"), b"hello").unwrap();
        let changes = vec![FileChange {
            path: "a.txt".to_string(),
            change: ChangeKind::Added,
            entry_kind: EntryKind::File,
        }];
        let mut buf = Vec::new();
        crate::archive::writer::write_archive(
            &changes,
            base.path(),
            &mut buf,
            &CancellationToken::new(),
        )
        .unwrap();

        let target = tempfile::tempdir().unwrap();
        apply_archive_sync(buf.as_slice(), target.path(), &CancellationToken::new()).unwrap();
        assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn fails_on_truncated_archive() {
        let base = tempfile::tempdir().unwrap();
        fs::write(base.path().join("big.txt"), vec![b'x'; 4096]).unwrap();
        let changes = vec![FileChange {
            path: "big.txt".to_string(),
            change: ChangeKind::Added,
            entry_kind: EntryKind::File,
        }];
        let mut buf = Vec::new();
        crate::archive::writer::write_archive(
            &changes,
            base.path(),
            &mut buf,
            &CancellationToken::new(),
        )
        .unwrap();
        // Cut the stream off in the middle of the very first entry's
        // header, which a conformant tar reader must reject outright
        // rather than silently treat as "no more entries".
        buf.truncate(100);

        let target = tempfile::tempdir().unwrap();
        let err =
            apply_archive_sync(buf.as_slice(), target.path(), &CancellationToken::new())
                .unwrap_err();
        assert!(matches!(err, Error::CorruptArchive(_)));
    }
}
