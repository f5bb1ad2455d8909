//! A layered filesystem engine: content-addressed, OCI-style directory
//! layers.
//!
//! A [`Session`] owns a working directory. Each [`LayerStep`] captures a
//! snapshot of that directory, and on [`LayerStep::commit`] either replays a
//! previously cached archive for the step's input hash (a cache hit) or
//! diffs the working directory against the step's baseline, writes the
//! result as a pax tar archive with Docker/OCI-style whiteout markers for
//! deletions, and stores it in the [`Cache`](cache::Cache) keyed by that
//! hash (a cache miss).
//!
//! ```no_run
//! # async fn run() -> layerfs::Result<()> {
//! let session = layerfs::Session::create("/var/lib/build/root", "/var/lib/build/cache").await?;
//! let mut step = session.begin_layer("deadbeef").await?;
//! if !step.is_from_cache() {
//!     // ... mutate the working directory ...
//! }
//! let descriptor = step.commit().await?;
//! println!("layer archive: {} bytes", descriptor.archive_size_bytes);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod error;
pub mod path;
pub mod session;
pub mod snapshot;

pub use cache::{Cache, CacheStats};
pub use error::{Error, Result};
pub use session::{LayerDescriptor, LayerStatistics, LayerStep, Session};
pub use snapshot::{ChangeKind, EntryKind, FileChange, FileMetadata, Snapshot};
