//! Content-addressed, durable store of layer archives.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Disambiguates temp file names across concurrent `store()` calls for the
/// same hash; a fixed name would let two writers interleave into the same
/// inode.
static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub archive_count: u64,
    pub total_bytes: u64,
}

/// A directory of `<shard>/<hash>.tar` archive files, written via
/// write-temp-then-rename so readers never observe a partial archive.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, hash: &str) -> PathBuf {
        let shard = if hash.len() >= 2 { &hash[..2] } else { hash };
        self.root.join(shard)
    }

    fn final_path(&self, hash: &str) -> PathBuf {
        self.shard_dir(hash).join(format!("{hash}.tar"))
    }

    /// A fresh, unique temp path for each call, so that two `store()`
    /// invocations racing on the same `hash` each write to their own inode
    /// rather than interleaving writes into a shared one.
    fn temp_path(&self, hash: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        self.shard_dir(hash)
            .join(format!("{hash}.{}.{nanos}.{sequence}.tar.tmp", std::process::id()))
    }

    pub async fn exists(&self, hash: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.final_path(hash)).await.is_ok())
    }

    /// Opens a streaming read handle for `hash`, or `None` if absent.
    pub async fn open(&self, hash: &str) -> Result<Option<tokio::fs::File>> {
        match tokio::fs::File::open(self.final_path(hash)).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::CacheIOError(e)),
        }
    }

    /// Streams `source` into a temp file and atomically renames it into
    /// place. On any failure before the rename, the temp file is removed
    /// and the error is propagated; the operation is then safe to retry.
    pub async fn store<R>(&self, hash: &str, mut source: R, cancel: &CancellationToken) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let shard_dir = self.shard_dir(hash);
        tokio::fs::create_dir_all(&shard_dir)
            .await
            .map_err(Error::CacheIOError)?;

        let tmp_path = self.temp_path(hash);
        let result = self.store_inner(&tmp_path, &mut source, cancel).await;
        match result {
            Ok(bytes) => {
                tokio::fs::rename(&tmp_path, self.final_path(hash))
                    .await
                    .map_err(Error::CacheIOError)?;
                trace!(hash, bytes, "stored layer archive");
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }

    async fn store_inner<R>(
        &self,
        tmp_path: &Path,
        source: &mut R,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut tmp_file = tokio::fs::File::create(tmp_path)
            .await
            .map_err(Error::CacheIOError)?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let n = source.read(&mut buf).await.map_err(Error::CacheIOError)?;
            if n == 0 {
                break;
            }
            tmp_file
                .write_all(&buf[..n])
                .await
                .map_err(Error::CacheIOError)?;
            total += n as u64;
        }
        tmp_file.flush().await.map_err(Error::CacheIOError)?;
        Ok(total)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        let mut shards = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(Error::CacheIOError(e)),
        };
        while let Some(shard) = shards.next_entry().await.map_err(Error::CacheIOError)? {
            if !shard.file_type().await.map_err(Error::CacheIOError)?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(shard.path())
                .await
                .map_err(Error::CacheIOError)?;
            while let Some(file) = files.next_entry().await.map_err(Error::CacheIOError)? {
                let name = file.file_name();
                let name = name.to_string_lossy();
                if !name.ends_with(".tar") {
                    continue;
                }
                let meta = file.metadata().await.map_err(Error::CacheIOError)?;
                stats.archive_count += 1;
                stats.total_bytes += meta.len();
            }
        }
        debug!(count = stats.archive_count, bytes = stats.total_bytes, "cache stats");
        Ok(stats)
    }
}
