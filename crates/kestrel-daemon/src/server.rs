use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::capture::{CaptureProvider, FfmpegCapture};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::process::{ProcFs, SpawnLauncher};
use crate::recording::{self, RecordingController};
use crate::session;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let config = Arc::new(config);

    let capture: Arc<dyn CaptureProvider> = Arc::new(FfmpegCapture::new(&config));
    let recordings = Arc::new(RecordingController::new(capture.clone(), &config));
    let samplers = recording::spawn_samplers(recordings.clone(), config.sample_interval);
    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        recordings.clone(),
        capture,
        Arc::new(ProcFs::default()),
        Arc::new(SpawnLauncher),
    ));

    info!(
        addr = %listener.local_addr()?,
        code = %config.code,
        auth = config.auth_enabled(),
        "Daemon listening"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted connection");
                    let dispatcher = dispatcher.clone();
                    let io_timeout = config.io_timeout;
                    tokio::spawn(async move {
                        // Errors are logged by the session itself.
                        let _ = session::serve(stream, dispatcher, io_timeout).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                }
            },
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!(error = %e, "Could not listen for Ctrl-C");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    for sampler in &samplers {
        sampler.abort();
    }
    tokio::task::spawn_blocking(move || recordings.shutdown())
        .await
        .context("recording shutdown panicked")?;
    Ok(())
}
