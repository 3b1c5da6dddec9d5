use anyhow::{anyhow, Context as _};
use clap::Parser;
use rco::{controller, logging::init_logging, OperatorConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "SIGTERM handler unavailable, using Ctrl-C only");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Shutdown signal received");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();
    config
        .validate()
        .map_err(|e| anyhow!("invalid configuration: {e}"))?;

    let logging = config
        .logging()
        .map_err(|e| anyhow!("invalid logging configuration: {e}"))?;
    let _log_guard = init_logging(&logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "redis-cluster-operator starting");

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    controller::run(client, &config, shutdown).await?;
    Ok(())
}
