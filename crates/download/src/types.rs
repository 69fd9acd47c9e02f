use std::path::PathBuf;

use serde::Serialize;
use xnatctl_transfer::TransferSummary;

pub const DEFAULT_DOWNLOAD_WORKERS: usize = 4;

/// What to download and where.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Experiment ID, or a session label when `project` is set.
    pub session_id: String,
    /// Project used to resolve a session label to its experiment ID.
    pub project: Option<String>,
    /// Directory name under `output_dir`; defaults to `session_id`.
    pub session_label: Option<String>,
    pub output_dir: PathBuf,
    /// `1` fetches a single combined archive.
    pub workers: usize,
    /// Restrict to these scan IDs.
    pub scans: Option<Vec<String>>,
    /// Only fetch this scan resource (`DICOM`, `NIFTI`, ...).
    pub resource: Option<String>,
    /// Also fetch session-level resources.
    pub include_resources: bool,
    pub extract: bool,
    /// Delete archives after a successful extraction.
    pub cleanup_archives: bool,
    /// Compare extracted files with server digests.
    pub verify: bool,
    /// Only plan; make no transfer requests.
    pub dry_run: bool,
}

impl DownloadRequest {
    pub fn new(session_id: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            project: None,
            session_label: None,
            output_dir: output_dir.into(),
            workers: DEFAULT_DOWNLOAD_WORKERS,
            scans: None,
            resource: None,
            include_resources: false,
            extract: true,
            cleanup_archives: true,
            verify: false,
            dry_run: false,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn session_label(mut self, label: impl Into<String>) -> Self {
        self.session_label = Some(label.into());
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn scans(mut self, scans: Vec<String>) -> Self {
        self.scans = Some(scans);
        self
    }

    pub fn include_resources(mut self, yes: bool) -> Self {
        self.include_resources = yes;
        self
    }

    pub fn extract(mut self, yes: bool) -> Self {
        self.extract = yes;
        self
    }

    pub fn cleanup_archives(mut self, yes: bool) -> Self {
        self.cleanup_archives = yes;
        self
    }

    pub fn verify(mut self, yes: bool) -> Self {
        self.verify = yes;
        self
    }

    pub fn dry_run(mut self, yes: bool) -> Self {
        self.dry_run = yes;
        self
    }

    pub fn session_dir(&self) -> PathBuf {
        self.output_dir
            .join(self.session_label.as_deref().unwrap_or(&self.session_id))
    }
}

/// A resource folder with the sizes the server reports for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub label: String,
    pub file_count: Option<u64>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanInfo {
    pub id: String,
    pub scan_type: Option<String>,
    pub resources: Vec<ResourceInfo>,
}

/// The set of archives a download would fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadPlan {
    /// Experiment ID, resolved from a label when needed.
    pub session_id: String,
    pub session_dir: PathBuf,
    /// One archive for all scans.
    pub combined: bool,
    /// Scan resource filter.
    pub resource: Option<String>,
    pub scans: Vec<ScanInfo>,
    /// Session-level resources.
    pub resources: Vec<ResourceInfo>,
}

impl DownloadPlan {
    /// Sum of reported sizes; resources without a size count as zero.
    pub fn approximate_bytes(&self) -> u64 {
        self.scans
            .iter()
            .flat_map(|s| s.resources.iter())
            .chain(self.resources.iter())
            .filter_map(|r| r.size_bytes)
            .sum()
    }

    pub fn scan_ids(&self) -> Vec<String> {
        self.scans.iter().map(|s| s.id.clone()).collect()
    }
}

/// Result of [`ParallelDownloadCoordinator::download`](crate::ParallelDownloadCoordinator::download).
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub plan: DownloadPlan,
    /// `None` for a dry run.
    pub summary: Option<TransferSummary>,
}
