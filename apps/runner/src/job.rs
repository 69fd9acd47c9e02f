//! Job files.
//!
//! ```toml
//! [client]
//! base_url = "https://xnat.example.org"
//! username = "alice"
//! password = "secret"
//!
//! [job]
//! kind = "download"
//! session = "XNAT_E00042"
//! output_dir = "/data/out"
//! workers = 4
//! verify = true
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use xnatctl_download::{DEFAULT_DOWNLOAD_WORKERS, DownloadRequest};
use xnatctl_session::ClientConfig;
use xnatctl_upload::{
    ArchiveFormat, BatchUploadRequest, DEFAULT_UPLOAD_WORKERS, DEFAULT_WARMUP_FILES,
    GradualUploadRequest, ImportOptions, UploadSource,
};

#[derive(Debug, Deserialize)]
pub struct JobFile {
    pub client: ClientConfig,
    pub job: Job,
}

impl JobFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read job file {}", path.display()))?;
        let file: JobFile = toml::from_str(&content)?;
        file.client.validate()?;
        Ok(file)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Job {
    BatchUpload(BatchUploadJob),
    GradualUpload(GradualUploadJob),
    Download(DownloadJob),
    Prearchive(PrearchiveJob),
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BatchUpload(_) => "batch-upload",
            Self::GradualUpload(_) => "gradual-upload",
            Self::Download(_) => "download",
            Self::Prearchive(_) => "prearchive",
        }
    }
}

fn default_upload_workers() -> usize {
    DEFAULT_UPLOAD_WORKERS
}

fn default_download_workers() -> usize {
    DEFAULT_DOWNLOAD_WORKERS
}

fn default_warmup_files() -> usize {
    DEFAULT_WARMUP_FILES
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct BatchUploadJob {
    pub source: PathBuf,
    /// Explicit files, relative to `source` unless absolute. All files
    /// below `source` when empty.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    pub import: ImportOptions,
    #[serde(default = "default_upload_workers")]
    pub workers: usize,
    #[serde(default)]
    pub archive_format: ArchiveFormat,
}

impl BatchUploadJob {
    pub fn request(&self) -> BatchUploadRequest {
        let request = BatchUploadRequest::new(&self.source, self.import.clone())
            .workers(self.workers)
            .archive_format(self.archive_format);
        if self.files.is_empty() {
            request
        } else {
            request.files(self.files.iter().map(|f| self.source.join(f)).collect())
        }
    }
}

/// Exactly one of `source`, `files` or `zip` must be set.
#[derive(Debug, Deserialize)]
pub struct GradualUploadJob {
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub zip: Option<PathBuf>,
    pub import: ImportOptions,
    #[serde(default = "default_upload_workers")]
    pub workers: usize,
    #[serde(default = "default_warmup_files")]
    pub warmup_files: usize,
    /// File with one uploaded identifier per line. Read before the upload
    /// and extended with the identifiers that succeeded.
    #[serde(default)]
    pub resume_file: Option<PathBuf>,
}

impl GradualUploadJob {
    pub fn source(&self) -> anyhow::Result<UploadSource> {
        match (&self.source, self.files.is_empty(), &self.zip) {
            (Some(dir), true, None) => Ok(UploadSource::Directory(dir.clone())),
            (None, false, None) => Ok(UploadSource::Files(self.files.clone())),
            (None, true, Some(zip)) => Ok(UploadSource::Zip(zip.clone())),
            _ => anyhow::bail!("gradual-upload needs exactly one of `source`, `files` or `zip`"),
        }
    }

    pub fn request(&self, already_done: Vec<String>) -> anyhow::Result<GradualUploadRequest> {
        Ok(GradualUploadRequest::new(self.source()?, self.import.clone())
            .workers(self.workers)
            .warmup_files(self.warmup_files)
            .resume_from(already_done))
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadJob {
    /// Experiment ID, or a session label when `project` is set.
    pub session: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    pub output_dir: PathBuf,
    #[serde(default = "default_download_workers")]
    pub workers: usize,
    #[serde(default)]
    pub scans: Option<Vec<String>>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub include_resources: bool,
    #[serde(default = "default_true")]
    pub extract: bool,
    #[serde(default = "default_true")]
    pub cleanup_archives: bool,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub dry_run: bool,
}

impl DownloadJob {
    pub fn request(&self) -> DownloadRequest {
        let mut request = DownloadRequest::new(&self.session, &self.output_dir)
            .workers(self.workers)
            .include_resources(self.include_resources)
            .extract(self.extract)
            .cleanup_archives(self.cleanup_archives)
            .verify(self.verify)
            .dry_run(self.dry_run);
        if let Some(label) = &self.label {
            request = request.session_label(label);
        }
        if let Some(scans) = &self.scans {
            request = request.scans(scans.clone());
        }
        if let Some(project) = &self.project {
            request = request.project(project);
        }
        if let Some(resource) = &self.resource {
            request = request.resource(resource);
        }
        request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrearchiveAction {
    List,
    Archive,
    Delete,
    Move,
    Rebuild,
}

#[derive(Debug, Deserialize)]
pub struct PrearchiveJob {
    pub action: PrearchiveAction,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub target_project: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
}

/// Reads a resume file; a missing file is an empty set.
pub fn read_resume_file(path: &Path) -> anyhow::Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("cannot read resume file {}", path.display())),
    }
}

/// Appends identifiers to a resume file.
pub fn append_resume_file(path: &Path, ids: &[String]) -> anyhow::Result<()> {
    use std::io::Write;

    if ids.is_empty() {
        return Ok(());
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot write resume file {}", path.display()))?;
    for id in ids {
        writeln!(file, "{id}")?;
    }
    Ok(())
}
