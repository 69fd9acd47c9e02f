//! Uploads into the XNAT import service.
//!
//! Two strategies share the same session and progress model:
//!
//! 1. **Batch**: split a directory into N contiguous batches, archive each
//!    batch locally and post the archives in parallel.
//! 2. **Gradual**: post every file on its own from a fixed worker pool,
//!    then retry the failures once, one at a time.

pub mod archive;
pub mod batch;
pub mod gradual;
pub mod import;
pub mod types;

pub use archive::{ArchiveFormat, BatchArchive, build_archive};
pub use batch::BatchUploadCoordinator;
pub use gradual::GradualUploadCoordinator;
pub use import::{Destination, ImportOptions};
pub use types::{
    BatchUploadRequest, DEFAULT_PROGRESS_EVERY, DEFAULT_UPLOAD_WORKERS, DEFAULT_WARMUP_FILES,
    GradualUploadRequest, UploadSource,
};
