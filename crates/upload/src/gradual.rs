//! Per-file upload through the gradual import handler.
//!
//! Three passes:
//! 1. a short sequential warm-up while the server creates the session,
//! 2. a fixed pool of workers, each with its own connection pool,
//! 3. one sequential retry of every file that did not succeed.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use xnatctl_session::{Params, RequestBody, SessionClient};
use xnatctl_transfer::{
    CANCELLED_MESSAGE, CollectOptions, NullSink, Phase, ProgressEvent, ProgressThrottle,
    SharedSink, TransferError, TransferSummary, TransferUnit, UnitStatus, collect_files,
    ensure_unique_paths,
};

use crate::archive::unpack_zip_source;
use crate::import::IMPORT_ENDPOINT;
use crate::types::{GradualUploadRequest, UploadSource};

const DICOM_CONTENT_TYPE: &str = "application/dicom";

/// Coordinates a gradual (one request per file) upload.
pub struct GradualUploadCoordinator {
    client: SessionClient,
    sink: SharedSink,
    cancel: CancellationToken,
}

/// A file resolved from the upload source.
struct SourceFile {
    id: String,
    path: PathBuf,
    size: u64,
}

impl GradualUploadCoordinator {
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
    /// Cancelling stops workers from taking new files; requests already
    /// in flight complete. Files never attempted are reported as failed.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn upload(&self, request: &GradualUploadRequest) -> Result<TransferSummary, TransferError> {
        let started = Instant::now();
        request.import.validate()?;

        let source = request.source.clone();
        let (files, _staging) = tokio::task::spawn_blocking(move || resolve_source(&source)).await??;
        if files.is_empty() {
            return Err(TransferError::Validation("no files found to upload".into()));
        }

        let (done, todo): (Vec<SourceFile>, Vec<SourceFile>) = files
            .into_iter()
            .partition(|f| request.already_done.contains(&f.id));
        let skipped = done.len();

        let mut units: Vec<TransferUnit> = todo
            .into_iter()
            .map(|f| TransferUnit::new(f.id, vec![f.path]).with_size(f.size))
            .collect();
        let total = units.len();

        info!(files = total, skipped, workers = request.workers, "starting gradual upload");
        self.sink.emit(
            ProgressEvent::new(Phase::Preparing, 0, total)
                .message(format!("{total} files to upload, {skipped} already done")),
        );

        let params = request.import.gradual_params();
        let mut throttle = ProgressThrottle::new(request.progress_every);

        // Warm-up.
        let warmup = request.warmup_files.min(total);
        if warmup > 0 {
            debug!(files = warmup, "warming up");
        }
        for unit in units.iter_mut().take(warmup) {
            if self.cancel.is_cancelled() {
                break;
            }
            unit.start();
            let result = upload_file(&self.client, &unit.sources[0], &params).await;
            self.record(unit, result, &mut throttle, total);
        }

        // Parallel pass.
        if !self.cancel.is_cancelled() && warmup < total {
            self.parallel_pass(&mut units, warmup, request.workers, &params, &mut throttle)
                .await?;
        }

        // Sequential retry pass.
        let retry: Vec<usize> = units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.status() != UnitStatus::Succeeded)
            .map(|(i, _)| i)
            .collect();
        if !retry.is_empty() && !self.cancel.is_cancelled() {
            info!(files = retry.len(), "retrying failed files sequentially");
            self.sink.emit(
                ProgressEvent::new(Phase::Transferring, throttle.done(), total)
                    .message(format!("retrying {} files", retry.len())),
            );
            for index in retry {
                if self.cancel.is_cancelled() {
                    break;
                }
                let unit = &mut units[index];
                unit.start();
                match upload_file(&self.client, &unit.sources[0], &params).await {
                    Ok(()) => unit.succeed(),
                    Err(e) => {
                        error!(file = %unit.id, error = %e, "file failed after retry");
                        unit.fail(e.to_string());
                    }
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        for unit in units.iter_mut().filter(|u| u.status() == UnitStatus::Pending) {
            unit.fail(CANCELLED_MESSAGE);
        }

        let summary = TransferSummary::from_units(&units, started.elapsed())
            .with_skipped(skipped)
            .with_cancelled(cancelled);

        let phase = if summary.is_success() { Phase::Complete } else { Phase::Error };
        self.sink.emit(
            ProgressEvent::new(phase, summary.succeeded, summary.total)
                .message(format!("{} of {} files uploaded", summary.succeeded, summary.total))
                .errors(summary.error_messages()),
        );
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "gradual upload finished"
        );
        Ok(summary)
    }

    /// Runs units `first..` on a pool of `workers` tasks.
    async fn parallel_pass(
        &self,
        units: &mut [TransferUnit],
        first: usize,
        workers: usize,
        params: &Params,
        throttle: &mut ProgressThrottle,
    ) -> Result<(), TransferError> {
        let total = units.len();
        let queue: Arc<Mutex<VecDeque<(usize, PathBuf)>>> = Arc::new(Mutex::new(
            units
                .iter()
                .enumerate()
                .skip(first)
                .map(|(i, u)| (i, u.sources[0].clone()))
                .collect(),
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pool = JoinSet::new();
        for worker in 0..workers.max(1) {
            let client = self.client.worker_handle()?;
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let cancel = self.cancel.clone();
            let params = params.clone();
            pool.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = match queue.lock() {
                        Ok(mut q) => q.pop_front(),
                        Err(poisoned) => poisoned.into_inner().pop_front(),
                    };
                    let Some((index, path)) = next else {
                        break;
                    };
                    let result = upload_file(&client, &path, &params).await;
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
                debug!(worker, "upload worker finished");
            });
        }
        drop(tx);

        while let Some((index, result)) = rx.recv().await {
            let unit = &mut units[index];
            unit.start();
            self.record(unit, result, throttle, total);
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                // Its file stays pending and goes to the retry pass.
                error!(error = %e, "upload worker aborted");
            }
        }
        Ok(())
    }

    fn record(
        &self,
        unit: &mut TransferUnit,
        result: Result<(), TransferError>,
        throttle: &mut ProgressThrottle,
        total: usize,
    ) {
        match result {
            Ok(()) => unit.succeed(),
            Err(e) => {
                debug!(file = %unit.id, error = %e, "file failed, queued for retry");
                unit.fail(e.to_string());
            }
        }
        if let Some(done) = throttle.record() {
            self.sink.emit(
                ProgressEvent::new(Phase::Transferring, done, total)
                    .message(format!("{done}/{total} files sent")),
            );
        }
    }
}

async fn upload_file(client: &SessionClient, path: &Path, params: &Params) -> Result<(), TransferError> {
    client
        .post(IMPORT_ENDPOINT, params, RequestBody::file(path, DICOM_CONTENT_TYPE))
        .await?;
    Ok(())
}

/// Resolves the source into identified files. The returned directory holds
/// unpacked ZIP content and must outlive the upload.
fn resolve_source(source: &UploadSource) -> Result<(Vec<SourceFile>, Option<TempDir>), TransferError> {
    let (paths, root, staging) = match source {
        UploadSource::Directory(dir) => {
            if !dir.is_dir() {
                return Err(TransferError::Validation(format!(
                    "{} is not a directory",
                    dir.display()
                )));
            }
            (collect_files(dir, &CollectOptions::default())?, Some(dir.clone()), None)
        }
        UploadSource::Files(list) => (list.clone(), None, None),
        UploadSource::Zip(zip) => {
            let staging = tempfile::Builder::new().prefix("xnatctl-gradual-").tempdir()?;
            unpack_zip_source(zip, staging.path())?;
            let files = collect_files(staging.path(), &CollectOptions::default())?;
            (files, Some(staging.path().to_path_buf()), Some(staging))
        }
    };

    ensure_unique_paths(&paths)?;

    let files = paths
        .into_iter()
        .map(|path| {
            let id = match &root {
                Some(root) => path
                    .strip_prefix(root)
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_else(|_| path.to_string_lossy().into_owned()),
                None => path.to_string_lossy().into_owned(),
            };
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            SourceFile { id, path, size }
        })
        .collect();

    Ok((files, staging))
}
