//! Concurrent scan download.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xnatctl_session::{SessionClient, SessionError, params};
use xnatctl_transfer::{
    CANCELLED_MESSAGE, NullSink, Phase, ProgressEvent, SharedSink, TransferError, TransferSummary,
    TransferUnit, UnitStatus,
};

use crate::extract::{EntryMapper, extract_archive};
use crate::plan::build_plan;
use crate::types::{DownloadPlan, DownloadReport, DownloadRequest};
use crate::verify::verify_scan;

/// What one unit fetches.
#[derive(Debug, Clone)]
enum Fetch {
    /// All selected scans in one archive.
    Combined(Vec<String>),
    Scan(String),
    Resource(String),
}

impl Fetch {
    fn unit_id(&self) -> String {
        match self {
            Self::Combined(_) => "scans".to_string(),
            Self::Scan(id) => format!("scan-{id}"),
            Self::Resource(label) => format!("resource-{label}"),
        }
    }

    fn archive_name(&self) -> String {
        match self {
            Self::Combined(_) => "scans.zip".to_string(),
            Self::Scan(id) => format!("scan_{id}.zip"),
            Self::Resource(label) => format!("resource_{label}.zip"),
        }
    }

    /// Server path of the archive. `resource` limits scan archives to one
    /// resource folder.
    fn url_path(&self, session: &str, all_scans: bool, resource: Option<&str>) -> String {
        let scans = match self {
            Self::Combined(_) if all_scans => "ALL".to_string(),
            Self::Combined(ids) => ids.join(","),
            Self::Scan(id) => id.clone(),
            Self::Resource(label) => return format!("/data/experiments/{session}/resources/{label}/files"),
        };
        match resource {
            Some(resource) => format!("/data/experiments/{session}/scans/{scans}/resources/{resource}/files"),
            None => format!("/data/experiments/{session}/scans/{scans}/files"),
        }
    }

    fn mapper(&self) -> EntryMapper {
        match self {
            Self::Combined(ids) => EntryMapper::for_scans(ids.clone()),
            Self::Scan(id) => EntryMapper::for_scan(id.clone()),
            Self::Resource(label) => EntryMapper::for_resource(label.clone()),
        }
    }

    /// Scans whose files this fetch brings in.
    fn scans(&self) -> &[String] {
        match self {
            Self::Combined(ids) => ids,
            Self::Scan(id) => std::slice::from_ref(id),
            Self::Resource(_) => &[],
        }
    }
}

/// Downloads the scans of one session.
pub struct ParallelDownloadCoordinator {
    client: SessionClient,
    sink: SharedSink,
    cancel: CancellationToken,
}

impl ParallelDownloadCoordinator {
    pub fn new(client: SessionClient) -> Self {
        Self {
            client,
            sink: NullSink::shared(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Cancelling stops scans that are still waiting for a worker.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Lists what `request` would fetch, including resource sizes.
    pub async fn plan(&self, request: &DownloadRequest) -> Result<DownloadPlan, TransferError> {
        build_plan(&self.client, request, true).await
    }

    /// Runs the download described by `request`.
    ///
    /// Errors only when planning fails; per-scan failures land in the
    /// summary. A dry run returns the plan without a summary.
    pub async fn download(&self, request: &DownloadRequest) -> Result<DownloadReport, TransferError> {
        if request.workers == 0 {
            return Err(TransferError::Validation("workers must be at least 1".into()));
        }
        let started = Instant::now();
        let plan = build_plan(&self.client, request, request.dry_run).await?;

        if request.dry_run {
            info!(
                session = %plan.session_id,
                scans = plan.scans.len(),
                resources = plan.resources.len(),
                bytes = plan.approximate_bytes(),
                "dry run"
            );
            self.sink.emit(
                ProgressEvent::new(Phase::Complete, 0, 0).message(format!(
                    "would fetch {} scans and {} resources (~{} bytes)",
                    plan.scans.len(),
                    plan.resources.len(),
                    plan.approximate_bytes()
                )),
            );
            return Ok(DownloadReport { plan, summary: None });
        }

        tokio::fs::create_dir_all(&plan.session_dir).await?;
        let fetches = fetches_for(&plan);
        let all_scans = request.scans.is_none();
        let total = fetches.len();
        let mut units: Vec<TransferUnit> = fetches
            .iter()
            .map(|f| TransferUnit::new(f.unit_id(), Vec::new()).with_target(plan.session_dir.join(f.archive_name())))
            .collect();

        info!(
            session = %plan.session_id,
            units = total,
            workers = request.workers,
            combined = plan.combined,
            "starting download"
        );
        self.sink.emit(
            ProgressEvent::new(Phase::Preparing, 0, total)
                .message(format!("{} archives to fetch", total)),
        );

        let permits = Arc::new(Semaphore::new(request.workers));
        let mut tasks = JoinSet::new();
        let mut task_units = HashMap::new();
        for (index, (unit, fetch)) in units.iter_mut().zip(fetches).enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            unit.start();
            let job = FetchJob {
                id: unit.id.clone(),
                path: fetch.url_path(&plan.session_id, all_scans, plan.resource.as_deref()),
                archive: unit.target.clone().unwrap_or_default(),
                fetch,
                session_id: plan.session_id.clone(),
                session_dir: plan.session_dir.clone(),
                extract: request.extract,
                cleanup: request.cleanup_archives,
                verify: request.verify,
                resource: plan.resource.clone(),
                client: self.client.clone(),
                sink: self.sink.clone(),
                cancel: self.cancel.clone(),
                permits: permits.clone(),
                total,
            };
            let handle = tasks.spawn(async move { (index, job.run().await) });
            task_units.insert(handle.id(), index);
        }

        let mut finished = 0;
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "download task aborted");
                    match task_units.get(&e.id()) {
                        Some(&index) => (index, Err(TransferError::Join(e))),
                        None => continue,
                    }
                }
            };
            finished += 1;
            let unit = &mut units[index];
            match result {
                Ok(bytes) => {
                    unit.size_bytes = bytes;
                    unit.succeed();
                    self.sink.emit(
                        ProgressEvent::new(Phase::Complete, finished, total)
                            .unit(&unit.id)
                            .message(format!("{} downloaded", unit.id)),
                    );
                }
                Err(TransferError::Cancelled) => unit.fail(CANCELLED_MESSAGE),
                Err(e) => {
                    let msg = e.to_string();
                    warn!(unit = %unit.id, error = %msg, "download failed");
                    unit.fail(&msg);
                    self.sink.emit(
                        ProgressEvent::new(Phase::Error, finished, total)
                            .unit(&unit.id)
                            .message(format!("{} failed", unit.id))
                            .errors(vec![msg]),
                    );
                }
            }
        }

        for unit in units.iter_mut().filter(|u| u.status() == UnitStatus::Pending) {
            unit.fail(CANCELLED_MESSAGE);
        }
        let summary = TransferSummary::from_units(&units, started.elapsed()).with_cancelled(self.cancel.is_cancelled());

        let phase = if summary.is_success() { Phase::Complete } else { Phase::Error };
        self.sink.emit(
            ProgressEvent::new(phase, summary.succeeded, summary.total)
                .message(format!("{} of {} archives downloaded", summary.succeeded, summary.total))
                .errors(summary.error_messages()),
        );
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            bytes = summary.bytes,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "download finished"
        );

        Ok(DownloadReport {
            plan,
            summary: Some(summary),
        })
    }
}

fn fetches_for(plan: &DownloadPlan) -> Vec<Fetch> {
    let mut fetches = Vec::new();
    if plan.combined {
        if !plan.scans.is_empty() {
            fetches.push(Fetch::Combined(plan.scan_ids()));
        }
    } else {
        fetches.extend(plan.scans.iter().map(|s| Fetch::Scan(s.id.clone())));
    }
    fetches.extend(plan.resources.iter().map(|r| Fetch::Resource(r.label.clone())));
    fetches
}

struct FetchJob {
    id: String,
    fetch: Fetch,
    path: String,
    archive: PathBuf,
    session_id: String,
    session_dir: PathBuf,
    extract: bool,
    cleanup: bool,
    verify: bool,
    resource: Option<String>,
    client: SessionClient,
    sink: SharedSink,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    total: usize,
}

impl FetchJob {
    /// Returns the archive size on success.
    async fn run(self) -> Result<u64, TransferError> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| TransferError::Cancelled)?
            }
        };

        self.emit(Phase::Transferring, format!("fetching {}", self.path));
        let bytes = fetch_archive(&self.client, &self.path, &self.archive).await?;
        debug!(unit = %self.id, bytes, "archive saved");

        if !self.extract {
            if self.verify {
                warn!(unit = %self.id, "verification needs extraction; skipped");
            }
            return Ok(bytes);
        }

        self.emit(Phase::Archiving, "extracting".to_string());
        let written = {
            let archive = self.archive.clone();
            let session_dir = self.session_dir.clone();
            let mapper = self.fetch.mapper();
            tokio::task::spawn_blocking(move || extract_archive(&archive, &session_dir, &mapper)).await??
        };
        debug!(unit = %self.id, files = written, "archive extracted");

        if self.cleanup
            && let Err(e) = tokio::fs::remove_file(&self.archive).await
        {
            warn!(archive = %self.archive.display(), error = %e, "failed to remove archive");
        }

        if self.verify && !self.fetch.scans().is_empty() {
            self.emit(Phase::Verifying, "verifying checksums".to_string());
            let mut problems = Vec::new();
            for scan in self.fetch.scans() {
                let found = verify_scan(
                    &self.client,
                    &self.session_id,
                    scan,
                    self.resource.as_deref(),
                    &self.session_dir,
                )
                .await?;
                problems.extend(found);
            }
            for problem in &problems {
                warn!(unit = %self.id, error = %problem, "verification failed");
            }
            // Extracted files stay in place; the unit reports the first mismatch.
            if let Some(first) = problems.into_iter().next() {
                return Err(first);
            }
        }

        Ok(bytes)
    }

    fn emit(&self, phase: Phase, message: String) {
        self.sink
            .emit(ProgressEvent::new(phase, 0, self.total).unit(&self.id).message(message));
    }
}

/// Streams a ZIP response into `target`, replacing any previous file.
async fn fetch_archive(client: &SessionClient, path: &str, target: &Path) -> Result<u64, TransferError> {
    let part = target.with_extension("zip.part");
    let response = client.get(path, &params(&[("format", "zip")])).await?;

    let result = async {
        let mut file = tokio::fs::File::create(&part).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(SessionError::from)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok::<_, TransferError>(written)
    }
    .await;

    match result {
        Ok(written) => {
            tokio::fs::rename(&part, target).await?;
            Ok(written)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(e)
        }
    }
}
