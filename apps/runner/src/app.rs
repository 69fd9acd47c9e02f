//! Runs one job against the server.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use xnatctl_download::ParallelDownloadCoordinator;
use xnatctl_prearchive::{ArchiveOptions, PrearchiveEntry, PrearchiveKey, PrearchiveReconciler};
use xnatctl_session::SessionClient;
use xnatctl_transfer::{Phase, ProgressEvent, SharedSink, TransferSummary};
use xnatctl_upload::{BatchUploadCoordinator, GradualUploadCoordinator};

use crate::job::{
    BatchUploadJob, DownloadJob, GradualUploadJob, Job, JobFile, PrearchiveAction, PrearchiveJob,
    append_resume_file, read_resume_file,
};

/// Runs the job. Returns `false` when the job completed with failures.
pub async fn run(file: JobFile) -> anyhow::Result<bool> {
    let client = SessionClient::new(&file.client)?;
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing in-flight transfers");
            ctrl_c.cancel();
        }
    });

    let sink: SharedSink = Arc::new(log_progress);
    let outcome = match &file.job {
        Job::BatchUpload(job) => run_batch(&client, job, sink, &cancel).await,
        Job::GradualUpload(job) => run_gradual(&client, job, sink, &cancel).await,
        Job::Download(job) => run_download(&client, job, sink, &cancel).await,
        Job::Prearchive(job) => run_prearchive(&client, job).await.map(|_| true),
    };

    // A configured token belongs to the caller; only end sessions we opened.
    if file.client.token.is_none()
        && let Err(e) = client.logout().await
    {
        tracing::debug!(error = %e, "logout failed");
    }
    client.close().await;
    outcome
}

async fn run_batch(
    client: &SessionClient,
    job: &BatchUploadJob,
    sink: SharedSink,
    cancel: &CancellationToken,
) -> anyhow::Result<bool> {
    let coordinator = BatchUploadCoordinator::new(client.clone()).with_sink(sink);
    forward_cancel(cancel, coordinator.cancel_token());
    let summary = coordinator.upload(&job.request()).await?;
    Ok(report(&summary))
}

async fn run_download(
    client: &SessionClient,
    job: &DownloadJob,
    sink: SharedSink,
    cancel: &CancellationToken,
) -> anyhow::Result<bool> {
    let coordinator = ParallelDownloadCoordinator::new(client.clone()).with_sink(sink);
    forward_cancel(cancel, coordinator.cancel_token());
    let result = coordinator.download(&job.request()).await?;
    match result.summary {
        Some(summary) => Ok(report(&summary)),
        None => {
            println!("{}", serde_json::to_string_pretty(&result.plan)?);
            Ok(true)
        }
    }
}

async fn run_gradual(
    client: &SessionClient,
    job: &GradualUploadJob,
    sink: SharedSink,
    cancel: &CancellationToken,
) -> anyhow::Result<bool> {
    let done = match &job.resume_file {
        Some(path) => read_resume_file(path)?,
        None => Vec::new(),
    };
    if !done.is_empty() {
        tracing::info!(files = done.len(), "resuming");
    }

    let coordinator = GradualUploadCoordinator::new(client.clone()).with_sink(sink);
    forward_cancel(cancel, coordinator.cancel_token());
    let summary = coordinator.upload(&job.request(done)?).await?;

    if let Some(path) = &job.resume_file {
        append_resume_file(path, &summary.succeeded_ids)?;
    }
    Ok(report(&summary))
}

async fn run_prearchive(client: &SessionClient, job: &PrearchiveJob) -> anyhow::Result<()> {
    let reconciler = PrearchiveReconciler::new(client.clone());

    if job.action == PrearchiveAction::List {
        let entries = reconciler.list(job.project.as_deref()).await?;
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let key = PrearchiveKey::new(
        job.project.clone().context("`project` is required")?,
        job.timestamp.clone().context("`timestamp` is required")?,
        job.name.clone().context("`name` is required")?,
    );
    let mut entry: PrearchiveEntry = reconciler.get(&key).await?;
    tracing::info!(entry = %entry.key, status = %entry.status, "prearchive entry");

    match job.action {
        PrearchiveAction::List => {}
        PrearchiveAction::Archive => {
            let options = ArchiveOptions {
                subject: job.subject.clone(),
                label: job.label.clone(),
                overwrite: job.overwrite,
            };
            let uri = reconciler.archive(&mut entry, &options).await?;
            tracing::info!(entry = %key, uri = %uri, "archived");
        }
        PrearchiveAction::Delete => {
            reconciler.delete(&mut entry).await?;
            tracing::info!(entry = %key, "deleted");
        }
        PrearchiveAction::Move => {
            let target = job
                .target_project
                .as_deref()
                .context("`target_project` is required")?;
            reconciler.move_to(&mut entry, target).await?;
            tracing::info!(from = %key, to = %entry.key, "moved");
        }
        PrearchiveAction::Rebuild => {
            reconciler.rebuild(&entry).await?;
            tracing::info!(entry = %key, "rebuild requested");
        }
    }
    Ok(())
}

fn forward_cancel(from: &CancellationToken, to: CancellationToken) {
    let from = from.clone();
    tokio::spawn(async move {
        from.cancelled().await;
        to.cancel();
    });
}

fn log_progress(event: ProgressEvent) {
    let unit = event.unit_id.as_deref().unwrap_or("-");
    match event.phase {
        Phase::Error => tracing::warn!(
            phase = %event.phase,
            unit,
            current = event.current,
            total = event.total,
            errors = ?event.errors,
            "{}",
            event.message
        ),
        _ => tracing::info!(
            phase = %event.phase,
            unit,
            current = event.current,
            total = event.total,
            "{}",
            event.message
        ),
    }
}

fn report(summary: &TransferSummary) -> bool {
    tracing::info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        bytes = summary.bytes,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        cancelled = summary.cancelled,
        "summary"
    );
    for error in &summary.errors {
        tracing::warn!(unit = %error.unit_id, error = %error.message, "failed");
    }
    summary.is_success()
}
