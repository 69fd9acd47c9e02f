//! Shared model for XNAT transfers.
//!
//! Units of work, progress events, end-of-run summaries, and the file
//! helpers (collection, partitioning, checksums, path checks) used by the
//! upload and download coordinators.

mod checksum;
mod collect;
mod partition;
mod progress;
mod types;
mod validation;

pub use checksum::{DigestAlgorithm, file_digest, md5_file, sha256_file, verify_file};
pub use collect::{CollectOptions, IMAGING_EXTENSIONS, collect_files};
pub use partition::{split_into_batches, split_into_n_batches};
pub use progress::{CollectingSink, NullSink, ProgressSink, ProgressThrottle, SharedSink};
pub use types::{Phase, ProgressEvent, TransferSummary, TransferUnit, UnitError, UnitStatus};
pub use validation::{ensure_unique_paths, validate_relative_path};

use xnatctl_session::SessionError;

/// Error text recorded for units that were never scheduled.
pub const CANCELLED_MESSAGE: &str = "cancelled before transfer";

/// Errors produced while preparing, moving or checking data.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Verification {
        path: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("cancelled")]
    Cancelled,
}
