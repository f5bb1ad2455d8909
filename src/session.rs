//! Owns a working directory and drives the lifecycle of one layer step at a
//! time: cache lookup and replay, or snapshot/diff/archive/store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::archive;
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::snapshot::{self, ChangeKind, EntryKind, FileChange, Snapshot};

#[derive(Debug, Clone, Copy, Default)]
pub struct LayerStatistics {
    pub files_added: u64,
    pub files_modified: u64,
    pub files_deleted: u64,
    pub directories_added: u64,
    pub directories_deleted: u64,
}

impl LayerStatistics {
    fn from_changes(changes: &[FileChange]) -> Self {
        let mut stats = Self::default();
        for change in changes {
            match (change.change, change.entry_kind) {
                (ChangeKind::Added, EntryKind::File) => stats.files_added += 1,
                (ChangeKind::Modified, EntryKind::File) => stats.files_modified += 1,
                (ChangeKind::Deleted, EntryKind::File) => stats.files_deleted += 1,
                (ChangeKind::Added, EntryKind::Directory) => stats.directories_added += 1,
                (ChangeKind::Deleted, EntryKind::Directory) => stats.directories_deleted += 1,
                // A directory is never reported "modified" (§3 data model).
                (ChangeKind::Modified, EntryKind::Directory) => {}
            }
        }
        stats
    }
}

#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    pub input_hash: String,
    pub created_at: SystemTime,
    pub archive_size_bytes: u64,
    pub statistics: LayerStatistics,
}

impl LayerDescriptor {
    fn empty(input_hash: String) -> Self {
        Self {
            input_hash,
            created_at: SystemTime::now(),
            archive_size_bytes: 0,
            statistics: LayerStatistics::default(),
        }
    }
}

#[derive(Debug)]
struct SessionInner {
    working_dir: PathBuf,
    cache: Cache,
    applied_layers: Mutex<Vec<LayerDescriptor>>,
    step_open: AtomicBool,
    disposed: AtomicBool,
    cancellation: CancellationToken,
}

/// Owns a working directory for its lifetime. See [`crate`] docs for the
/// overall lifecycle.
///
/// `Session` wraps `Arc<SessionInner>` so a `LayerStep` can hold a clone and
/// append its descriptor on success; this is the idiomatic Rust stand-in for
/// the "child holds a back-reference, parent's lifetime strictly contains
/// the child's" relationship described in the design notes, since a literal
/// borrow can't cross the `async` suspension points a step's lifecycle
/// needs to support.
#[derive(Debug, Clone)]
pub struct Session(Arc<SessionInner>);

impl Session {
    /// Creates a session over `working_dir` and `cache_dir`, creating
    /// either if absent. Fails if `working_dir` exists and is non-empty.
    #[instrument(skip_all, fields(working_dir = %working_dir.as_ref().display()))]
    pub async fn create(
        working_dir: impl AsRef<Path>,
        cache_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let working_dir = working_dir.as_ref().to_path_buf();
        let cache_dir = cache_dir.as_ref().to_path_buf();
        if working_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("working_dir"));
        }
        if cache_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("cache_dir"));
        }

        match tokio::fs::metadata(&working_dir).await {
            Ok(meta) if meta.is_dir() => {
                let mut entries = tokio::fs::read_dir(&working_dir).await?;
                if entries.next_entry().await?.is_some() {
                    return Err(Error::WorkingDirectoryNotEmpty(working_dir));
                }
            }
            Ok(_) => return Err(Error::WorkingDirectoryNotEmpty(working_dir)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&working_dir).await?;
            }
            Err(e) => return Err(Error::Io(e)),
        }
        tokio::fs::create_dir_all(&cache_dir).await?;

        info!("session created");
        Ok(Self(Arc::new(SessionInner {
            working_dir,
            cache: Cache::new(cache_dir),
            applied_layers: Mutex::new(Vec::new()),
            step_open: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancellation: CancellationToken::new(),
        })))
    }

    pub fn working_directory(&self) -> &Path {
        &self.0.working_dir
    }

    pub fn applied_layers(&self) -> Vec<LayerDescriptor> {
        self.0.applied_layers.lock().expect("lock poisoned").clone()
    }

    /// A token that, when cancelled, propagates to every `LayerStep`
    /// derived from this session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.0.cancellation.clone()
    }

    /// Begins a new layer step keyed by `input_hash`. At most one step may
    /// be open per session at a time.
    #[instrument(skip(self), fields(input_hash = %input_hash.as_ref()))]
    pub async fn begin_layer(&self, input_hash: impl AsRef<str>) -> Result<LayerStep> {
        let input_hash = input_hash.as_ref().to_string();
        if input_hash.trim().is_empty() {
            return Err(Error::InvalidArgument("input_hash"));
        }
        if self.0.disposed.load(Ordering::SeqCst) {
            return Err(Error::SessionDisposed);
        }
        if self
            .0
            .step_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::ConcurrentStep);
        }

        match self.begin_layer_inner(&input_hash).await {
            Ok(step) => Ok(step),
            Err(e) => {
                self.0.step_open.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn begin_layer_inner(&self, input_hash: &str) -> Result<LayerStep> {
        let token = self.0.cancellation.child_token();

        // Baseline is always captured before any cached archive is applied,
        // so it reflects pre-step state rather than a post-apply one.
        let baseline = snapshot::create_snapshot(&self.0.working_dir, &token).await?;

        let cache_status = if self.0.cache.exists(input_hash).await? {
            let handle = self
                .0
                .cache
                .open(input_hash)
                .await?
                .ok_or_else(|| Error::CacheIOError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "cached archive vanished between Exists and Open",
                )))?;
            let std_handle = handle.into_std().await;
            archive::apply_archive(std_handle, self.0.working_dir.clone(), token.clone()).await?;

            let descriptor = LayerDescriptor::empty(input_hash.to_string());
            self.0
                .applied_layers
                .lock()
                .expect("lock poisoned")
                .push(descriptor);
            debug!("layer applied from cache");
            CacheStatus::Hit
        } else {
            debug!("cache miss");
            CacheStatus::Miss
        };

        Ok(LayerStep {
            session: self.0.clone(),
            input_hash: input_hash.to_string(),
            baseline,
            cache_status,
            phase: Phase::Open,
            disposed: false,
            cancellation: token,
        })
    }

    /// Idempotent. Does not delete the working directory or touch the
    /// cache.
    pub fn dispose(&self) {
        self.0.disposed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Committed,
    Cancelled,
}

/// The transactional scope within which a single layer is produced (cache
/// miss) or replayed (cache hit). At most one step is open per session.
#[derive(Debug)]
pub struct LayerStep {
    session: Arc<SessionInner>,
    input_hash: String,
    baseline: Snapshot,
    cache_status: CacheStatus,
    phase: Phase,
    disposed: bool,
    cancellation: CancellationToken,
}

impl LayerStep {
    pub fn is_from_cache(&self) -> bool {
        self.cache_status == CacheStatus::Hit
    }

    pub fn input_hash(&self) -> &str {
        &self.input_hash
    }

    /// A token cancelling this step alone (derived from the session's
    /// token); cancelling it does not affect sibling or later steps.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    #[instrument(skip(self), fields(input_hash = %self.input_hash))]
    pub async fn commit(&mut self) -> Result<LayerDescriptor> {
        if self.disposed {
            return Err(Error::StepDisposed);
        }
        if self.phase != Phase::Open {
            return Err(Error::AlreadyFinalized);
        }

        let descriptor = match self.cache_status {
            CacheStatus::Hit => {
                // The descriptor was already appended during
                // initialization; return a copy, never append again.
                let applied = self.session.applied_layers.lock().expect("lock poisoned");
                applied
                    .iter()
                    .rev()
                    .find(|d| d.input_hash == self.input_hash)
                    .cloned()
                    .unwrap_or_else(|| LayerDescriptor::empty(self.input_hash.clone()))
            }
            CacheStatus::Miss => self.commit_miss().await?,
        };

        self.phase = Phase::Committed;
        self.session.step_open.store(false, Ordering::SeqCst);
        Ok(descriptor)
    }

    async fn commit_miss(&mut self) -> Result<LayerDescriptor> {
        let after = snapshot::create_snapshot(&self.session.working_dir, &self.cancellation).await?;
        let changes = snapshot::detect_changes(&self.baseline, &after);

        if changes.is_empty() {
            debug!("empty diff, nothing to store");
            let descriptor = LayerDescriptor::empty(self.input_hash.clone());
            self.session
                .applied_layers
                .lock()
                .expect("lock poisoned")
                .push(descriptor.clone());
            return Ok(descriptor);
        }

        // Fatal and must never partially write the cache if it fails.
        archive::writer::check_duplicate_paths(&changes)?;

        // A real temp file, not an in-memory buffer: large files stream
        // through it without ever holding their whole contents in memory.
        let temp_file = tempfile::tempfile_in(self.session.cache.root()).map_err(Error::Io)?;
        let (stats, mut temp_file) = archive::create_archive(
            changes.clone(),
            self.session.working_dir.clone(),
            temp_file,
            self.cancellation.clone(),
        )
        .await?;

        use std::io::{Seek, SeekFrom};
        temp_file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        let tokio_file = tokio::fs::File::from_std(temp_file);
        self.session
            .cache
            .store(&self.input_hash, tokio_file, &self.cancellation)
            .await?;

        let statistics = LayerStatistics::from_changes(&changes);
        let descriptor = LayerDescriptor {
            input_hash: self.input_hash.clone(),
            created_at: SystemTime::now(),
            archive_size_bytes: stats.bytes_written,
            statistics,
        };
        self.session
            .applied_layers
            .lock()
            .expect("lock poisoned")
            .push(descriptor.clone());
        Ok(descriptor)
    }

    /// Leaves the working directory exactly as the caller left it; the
    /// caller is responsible for reconciling any changes already made.
    pub fn cancel(&mut self) -> Result<()> {
        if self.disposed {
            return Err(Error::StepDisposed);
        }
        if self.phase != Phase::Open {
            return Err(Error::AlreadyFinalized);
        }
        self.phase = Phase::Cancelled;
        self.session.step_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Idempotent. If called while still open, behaves like [`Self::cancel`].
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        if self.phase == Phase::Open {
            self.phase = Phase::Cancelled;
            self.session.step_open.store(false, Ordering::SeqCst);
        }
        self.disposed = true;
    }
}

impl Drop for LayerStep {
    fn drop(&mut self) {
        if !self.disposed && self.phase == Phase::Open {
            self.session.step_open.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn rejects_empty_paths() {
        assert!(matches!(
            Session::create("", "/tmp/cache").await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn rejects_nonempty_working_directory() {
        let working = tempfile::tempdir().unwrap();
        fs::write(working.path().join("preexisting"), b"x").unwrap();
        let cache = tempfile::tempdir().unwrap();
        let err = Session::create(working.path(), cache.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkingDirectoryNotEmpty(_)));
    }

    #[tokio::test]
    async fn begin_layer_rejects_empty_hash() {
        let working = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let session = Session::create(working.path(), cache.path()).await.unwrap();
        assert!(matches!(
            session.begin_layer("").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.begin_layer("   ").await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_step_is_rejected() {
        let working = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let session = Session::create(working.path(), cache.path()).await.unwrap();
        let _first = session.begin_layer("A").await.unwrap();
        assert!(matches!(
            session.begin_layer("B").await,
            Err(Error::ConcurrentStep)
        ));
    }

    #[tokio::test]
    async fn commit_twice_fails() {
        let working = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let session = Session::create(working.path(), cache.path()).await.unwrap();
        let mut step = session.begin_layer("A").await.unwrap();
        fs::write(working.path().join("a.txt"), b"hi").unwrap();
        step.commit().await.unwrap();
        assert!(matches!(step.commit().await, Err(Error::AlreadyFinalized)));
    }

    #[tokio::test]
    async fn empty_diff_is_idempotent_and_skips_cache() {
        let working = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let session = Session::create(working.path(), cache.path()).await.unwrap();
        let mut step = session.begin_layer("A").await.unwrap();
        let descriptor = step.commit().await.unwrap();
        assert_eq!(descriptor.archive_size_bytes, 0);
        assert_eq!(descriptor.statistics.files_added, 0);
        assert!(!session.0.cache.exists("A").await.unwrap());
        // A successful commit still counts toward applied_layers, even
        // when the diff was empty and nothing was written to the cache.
        assert_eq!(session.applied_layers().len(), 1);
    }

    #[tokio::test]
    async fn cancel_leaves_cache_untouched() {
        let working = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let session = Session::create(working.path(), cache.path()).await.unwrap();
        let mut step = session.begin_layer("X").await.unwrap();
        fs::write(working.path().join("x.txt"), b"x").unwrap();
        step.cancel().unwrap();
        assert!(!session.0.cache.exists("X").await.unwrap());
        assert!(matches!(step.cancel(), Err(Error::AlreadyFinalized)));
    }

    #[tokio::test]
    async fn session_disposed_rejects_new_steps() {
        let working = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let session = Session::create(working.path(), cache.path()).await.unwrap();
        session.dispose();
        assert!(matches!(
            session.begin_layer("A").await,
            Err(Error::SessionDisposed)
        ));
    }

    #[tokio::test]
    async fn dropping_an_open_step_frees_the_session() {
        let working = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let session = Session::create(working.path(), cache.path()).await.unwrap();
        {
            let _step = session.begin_layer("A").await.unwrap();
        }
        // The previous step was dropped without commit/cancel/dispose; the
        // session must not remain permanently wedged.
        assert!(session.begin_layer("B").await.is_ok());
    }
}
