//! Parallel batch-archive upload.
//!
//! Files are split into at most N contiguous batches. Each batch runs in
//! its own task: build archive, post it, delete it. A failed batch does
//! not stop the others.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use xnatctl_session::{Params, RequestBody, SessionClient};
use xnatctl_transfer::{
    CANCELLED_MESSAGE, NullSink, Phase, ProgressEvent, SharedSink, TransferError,
    TransferSummary, TransferUnit, UnitStatus, collect_files, ensure_unique_paths,
    split_into_n_batches,
};

use crate::archive::{ArchiveFormat, build_archive};
use crate::import::IMPORT_ENDPOINT;
use crate::types::BatchUploadRequest;

/// Coordinates a batch-archive upload.
pub struct BatchUploadCoordinator {
    client: SessionClient,
    sink: SharedSink,
    cancel: CancellationToken,
}

impl BatchUploadCoordinator {
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

    /// Returns a cancellation token for this upload.
    ///
    /// Cancelling stops batches that have not started archiving yet.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads every file below `request.source_dir`, or the explicit
    /// file list when one is set.
    ///
    /// Errors only for invalid input; transfer failures are reported per
    /// batch in the summary.
    pub async fn upload(&self, request: &BatchUploadRequest) -> Result<TransferSummary, TransferError> {
        let started = Instant::now();
        request.import.validate()?;

        let files = match &request.files {
            Some(files) => {
                let files = files.clone();
                tokio::task::spawn_blocking(move || ensure_unique_paths(&files).map(|()| files)).await??
            }
            None => {
                let source = request.source_dir.clone();
                let options = request.collect.clone();
                tokio::task::spawn_blocking(move || collect_files(&source, &options)).await??
            }
        };
        if files.is_empty() {
            return Err(TransferError::Validation(format!(
                "no files found in {}",
                request.source_dir.display()
            )));
        }

        let batches = split_into_n_batches(&files, request.workers);
        let total = batches.len();
        let mut units: Vec<TransferUnit> = batches
            .into_iter()
            .enumerate()
            .map(|(i, batch)| TransferUnit::new(format!("batch-{}", i + 1), batch))
            .collect();

        info!(files = files.len(), batches = total, format = ?request.archive_format, "starting batch upload");
        self.sink.emit(
            ProgressEvent::new(Phase::Preparing, 0, total)
                .message(format!("{} files in {} batches", files.len(), total)),
        );

        let params = request.import.archive_params();
        let mut tasks = JoinSet::new();
        let mut task_units = HashMap::new();
        for (index, unit) in units.iter_mut().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            unit.start();
            let job = BatchJob {
                id: unit.id.clone(),
                files: unit.sources.clone(),
                base_dir: request.source_dir.clone(),
                format: request.archive_format,
                params: params.clone(),
                client: self.client.clone(),
                sink: self.sink.clone(),
                cancel: self.cancel.clone(),
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
                    error!(error = %e, "batch task aborted");
                    match task_units.get(&e.id()) {
                        Some(&index) => (index, Err(TransferError::Join(e))),
                        None => continue,
                    }
                }
            };
            finished += 1;
            let unit = &mut units[index];
            match result {
                Ok(size) => {
                    unit.size_bytes = size;
                    unit.succeed();
                    self.sink.emit(
                        ProgressEvent::new(Phase::Complete, finished, total)
                            .unit(&unit.id)
                            .message(format!("{} uploaded", unit.id)),
                    );
                }
                Err(e) => {
                    let msg = e.to_string();
                    warn!(batch = %unit.id, error = %msg, "batch failed");
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

        let cancelled = self.cancel.is_cancelled();
        for unit in units.iter_mut().filter(|u| u.status() == UnitStatus::Pending) {
            unit.fail(CANCELLED_MESSAGE);
        }

        let summary = TransferSummary::from_units(&units, started.elapsed()).with_cancelled(cancelled);
        self.emit_summary(&summary);
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "batch upload finished"
        );
        Ok(summary)
    }

    fn emit_summary(&self, summary: &TransferSummary) {
        let phase = if summary.is_success() { Phase::Complete } else { Phase::Error };
        self.sink.emit(
            ProgressEvent::new(phase, summary.succeeded, summary.total)
                .message(format!(
                    "{} of {} batches uploaded",
                    summary.succeeded, summary.total
                ))
                .errors(summary.error_messages()),
        );
    }
}

/// Work of one batch task.
struct BatchJob {
    id: String,
    files: Vec<PathBuf>,
    base_dir: PathBuf,
    format: ArchiveFormat,
    params: Params,
    client: SessionClient,
    sink: SharedSink,
    cancel: CancellationToken,
    total: usize,
}

impl BatchJob {
    /// Returns the archive size on success.
    async fn run(self) -> Result<u64, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        self.sink.emit(
            ProgressEvent::new(Phase::Archiving, 0, self.total)
                .unit(&self.id)
                .message(format!("archiving {} files", self.files.len())),
        );
        let archive = {
            let files = self.files.clone();
            let base_dir = self.base_dir.clone();
            let format = self.format;
            let name = self.id.clone();
            tokio::task::spawn_blocking(move || build_archive(&files, &base_dir, format, &name)).await??
        };

        self.sink.emit(
            ProgressEvent::new(Phase::Transferring, 0, self.total)
                .unit(&self.id)
                .message(format!("uploading {} bytes", archive.size())),
        );
        post_archive(&self.client, archive.path(), self.format, &self.params).await?;
        // Dropping `archive` removes the temporary file.
        Ok(archive.size())
    }
}

async fn post_archive(
    client: &SessionClient,
    path: &Path,
    format: ArchiveFormat,
    params: &Params,
) -> Result<(), TransferError> {
    client
        .post(IMPORT_ENDPOINT, params, RequestBody::file(path, format.content_type()))
        .await?;
    Ok(())
}
