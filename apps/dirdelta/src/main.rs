//! dirdelta demo entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dirdelta=debug")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting dirdelta");

    let (config, path) = config::Config::load()?;
    tracing::info!(
        path = %path.display(),
        host = %config.host.app_root.display(),
        client = %config.client.app_root.display(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(app::run(config))?;

    tracing::info!(
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "mirror finished"
    );
    Ok(())
}
