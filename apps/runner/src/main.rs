//! xnatctl job runner entry point.
//!
//! Usage: `xnatctl-runner <job.toml>`

mod app;
mod job;

use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path: PathBuf = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: xnatctl-runner <job.toml>")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), job = %path.display(), "starting xnatctl runner");

    let job = job::JobFile::load(&path)?;
    tracing::info!(kind = job.job.kind(), url = %job.client.base_url, "job loaded");

    let rt = tokio::runtime::Runtime::new()?;
    let ok = rt.block_on(app::run(job))?;
    if !ok {
        anyhow::bail!("job finished with failures");
    }

    tracing::info!("job finished");
    Ok(())
}
