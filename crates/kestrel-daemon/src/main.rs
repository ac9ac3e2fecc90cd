mod archive;
mod capture;
mod codec;
mod config;
mod dispatch;
mod error;
mod process;
mod protocol;
mod recording;
mod server;
mod session;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up logging
    let filter = EnvFilter::try_from_env("KESTREL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Args::parse().to_config();
    info!(
        listen = %config.listen,
        work_dir = %config.work_dir.display(),
        "Starting kestrel-daemon"
    );

    server::run(config).await
}
