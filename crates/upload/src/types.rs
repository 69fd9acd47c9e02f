use std::collections::HashSet;
use std::path::PathBuf;

use xnatctl_transfer::CollectOptions;

use crate::archive::ArchiveFormat;
use crate::import::ImportOptions;

pub const DEFAULT_UPLOAD_WORKERS: usize = 4;

/// Files sent one at a time before the gradual worker pool starts.
pub const DEFAULT_WARMUP_FILES: usize = 5;

/// Completed files between two gradual progress events.
pub const DEFAULT_PROGRESS_EVERY: usize = 100;

/// Upload of a directory as `workers` parallel archive batches.
#[derive(Debug, Clone)]
pub struct BatchUploadRequest {
    /// Collection root, and the base of archive entry names.
    pub source_dir: PathBuf,
    /// Explicit files to send instead of collecting `source_dir`.
    pub files: Option<Vec<PathBuf>>,
    pub import: ImportOptions,
    pub workers: usize,
    pub archive_format: ArchiveFormat,
    pub collect: CollectOptions,
}

impl BatchUploadRequest {
    pub fn new(source_dir: impl Into<PathBuf>, import: ImportOptions) -> Self {
        Self {
            source_dir: source_dir.into(),
            files: None,
            import,
            workers: DEFAULT_UPLOAD_WORKERS,
            archive_format: ArchiveFormat::default(),
            collect: CollectOptions::default(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn archive_format(mut self, format: ArchiveFormat) -> Self {
        self.archive_format = format;
        self
    }

    /// Sends exactly `files`; entry names stay relative to `source_dir`.
    pub fn files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = Some(files);
        self
    }
}

/// Input of a gradual upload.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// All visible files below a directory; identifiers are relative paths.
    Directory(PathBuf),
    /// Explicit files; identifiers are the paths as given.
    Files(Vec<PathBuf>),
    /// A ZIP archive unpacked to a temporary directory first.
    Zip(PathBuf),
}

/// Per-file upload through the gradual import handler.
#[derive(Debug, Clone)]
pub struct GradualUploadRequest {
    pub source: UploadSource,
    pub import: ImportOptions,
    pub workers: usize,
    /// Identifiers of files already uploaded by an earlier run.
    pub already_done: HashSet<String>,
    pub warmup_files: usize,
    pub progress_every: usize,
}

impl GradualUploadRequest {
    pub fn new(source: UploadSource, import: ImportOptions) -> Self {
        Self {
            source,
            import,
            workers: DEFAULT_UPLOAD_WORKERS,
            already_done: HashSet::new(),
            warmup_files: DEFAULT_WARMUP_FILES,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn resume_from(mut self, done: impl IntoIterator<Item = String>) -> Self {
        self.already_done.extend(done);
        self
    }

    pub fn warmup_files(mut self, n: usize) -> Self {
        self.warmup_files = n;
        self
    }

    pub fn progress_every(mut self, n: usize) -> Self {
        self.progress_every = n;
        self
    }
}
