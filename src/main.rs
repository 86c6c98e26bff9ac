#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use tcp_proxy::{Server, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = ServerConfig::from_env()?;
    info!(listen = %cfg.listen_addr, mark = cfg.mark, "starting tcp-proxy");

    let shutdown = shutdown_signal()?;

    let mut server = Server::new(cfg);
    server.start().await.context("error starting tcp-proxy")?;

    shutdown.await;

    info!("stopping tcp-proxy");
    server.stop().await;
    info!("stopped tcp-proxy");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .compact()
        .init();
}

/// Resolves on SIGINT, SIGTERM or SIGHUP. Handlers are installed eagerly so a
/// signal arriving during startup is not lost.
#[cfg(unix)]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!(signal = "SIGINT", "received shutdown signal"),
            _ = terminate.recv() => info!(signal = "SIGTERM", "received shutdown signal"),
            _ = hangup.recv() => info!(signal = "SIGHUP", "received shutdown signal"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C"),
            Err(err) => tracing::warn!(error = %err, "failed to listen for Ctrl+C, shutting down"),
        }
    })
}
