use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tar::{Builder, EntryType, Header};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{opaque_whiteout_name, whiteout_name};
use crate::error::{Error, Result};
use crate::path;
use crate::snapshot::{ChangeKind, EntryKind, FileChange};

/// Byte-level summary of an archive write, independent of the tar entry
/// count (a single deleted directory subtree becomes one opaque-whiteout
/// entry regardless of how many files it used to contain).
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveStats {
    pub bytes_written: u64,
}

/// Verifies no two changes collide under case-insensitive path comparison.
/// Exposed so callers (the session controller) can run this check *before*
/// doing any other work for a commit, per the propagation policy that
/// duplicate detection must never partially populate the cache.
pub fn check_duplicate_paths(changes: &[FileChange]) -> Result<()> {
    let mut seen: HashSet<String> = HashSet::new();
    for change in changes {
        let key = path::ascii_lower_key(&change.path);
        if !seen.insert(key) {
            if let Some(other) = changes.iter().find(|c| {
                c.path != change.path && path::ascii_lower_key(&c.path) == path::ascii_lower_key(&change.path)
            }) {
                return Err(Error::DuplicatePath(other.path.clone(), change.path.clone()));
            }
            return Err(Error::DuplicatePath(change.path.clone(), change.path.clone()));
        }
    }
    Ok(())
}

/// Streams `changes` into `sink` as a pax tar archive with whiteout markers
/// for deletions, running the (blocking) work on a dedicated thread. Hands
/// `sink` back alongside the stats so callers that wrote to a seekable
/// destination (e.g. a temp file) can rewind and re-read it without a
/// second allocation.
pub async fn create_archive<W>(
    changes: Vec<FileChange>,
    base_dir: PathBuf,
    sink: W,
    cancel: CancellationToken,
) -> Result<(ArchiveStats, W)>
where
    W: Write + Send + 'static,
{
    tokio::task::spawn_blocking(move || write_archive(&changes, &base_dir, sink, &cancel))
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
}

/// Synchronous core: same contract as [`create_archive`], called directly
/// by callers already on a blocking thread.
pub fn write_archive<W: Write>(
    changes: &[FileChange],
    base_dir: &Path,
    sink: W,
    cancel: &CancellationToken,
) -> Result<(ArchiveStats, W)> {
    check_duplicate_paths(changes)?;

    // A deleted directory is covered by a single opaque whiteout; skip
    // emitting whiteouts for anything strictly nested under one, since the
    // opaque whiteout already removes the whole subtree on apply.
    let deleted_dirs: HashSet<&str> = changes
        .iter()
        .filter(|c| c.change == ChangeKind::Deleted && c.entry_kind == EntryKind::Directory)
        .map(|c| c.path.as_str())
        .collect();
    let nested_under_deleted_dir = |path: &str| {
        deleted_dirs
            .iter()
            .any(|dir| *dir != path && path.starts_with(*dir) && path[dir.len()..].starts_with('/'))
    };

    let counting = CountingWriter::new(sink);
    let mut builder = Builder::new(counting);

    for change in changes {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match change.change {
            ChangeKind::Added | ChangeKind::Modified => match change.entry_kind {
                EntryKind::Directory => append_directory(&mut builder, &change.path)?,
                EntryKind::File => append_file(&mut builder, base_dir, &change.path)?,
            },
            ChangeKind::Deleted => {
                if nested_under_deleted_dir(&change.path) {
                    continue;
                }
                let name = match change.entry_kind {
                    EntryKind::Directory => opaque_whiteout_name(&change.path),
                    EntryKind::File => whiteout_name(&change.path),
                };
                trace!(entry = %name, "emitting whiteout");
                append_empty(&mut builder, &name)?;
            }
        }
    }

    let counting = builder
        .into_inner()
        .map_err(|e| Error::CorruptArchive(e.to_string()))?;
    let bytes_written = counting.bytes_written();
    Ok((ArchiveStats { bytes_written }, counting.into_inner()))
}

fn neutral_header(entry_type: EntryType) -> Header {
    let mut header = Header::new_ustar();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(match entry_type {
        EntryType::Directory => 0o755,
        _ => 0o644,
    });
    header
}

fn append_directory<W: Write>(builder: &mut Builder<W>, path: &str) -> Result<()> {
    let mut header = neutral_header(EntryType::Directory);
    header.set_size(0);
    builder
        .append_data(&mut header, path, io::empty())
        .map_err(|e| Error::CorruptArchive(e.to_string()))
}

fn append_file<W: Write>(builder: &mut Builder<W>, base_dir: &Path, path: &str) -> Result<()> {
    let mut file = File::open(base_dir.join(path))?;
    let size = file.metadata()?.len();
    let mut header = neutral_header(EntryType::Regular);
    header.set_size(size);
    builder
        .append_data(&mut header, path, &mut file)
        .map_err(|e| Error::CorruptArchive(e.to_string()))
}

fn append_empty<W: Write>(builder: &mut Builder<W>, name: &str) -> Result<()> {
    let mut header = neutral_header(EntryType::Regular);
    header.set_size(0);
    builder
        .append_data(&mut header, name, io::empty())
        .map_err(|e| Error::CorruptArchive(e.to_string()))
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    fn bytes_written(&self) -> u64 {
        self.count
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
