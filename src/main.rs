//! Bufferlink
//!
//! Runs a renderer host and a synthetic producer against each other over the
//! buffer-pool protocol. Useful as a smoke test of the transport and as a
//! reference wiring for embedders.

mod config;
mod loopback;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let print_config = args.iter().any(|arg| arg == "--print-config");

    let config = config::Config::load().context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.filter.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if print_config {
        println!(
            "{}",
            toml::to_string_pretty(&config).context("Failed to serialize config")?
        );
        return Ok(());
    }

    info!(
        "Starting bufferlink loopback: {} frames at {}x{}",
        config.producer.frames, config.surface.width, config.surface.height
    );

    // Setup signal handlers for graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    let _ = tx.send(()).await;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    let _ = tx.send(()).await;
                }
            }
        });
    }

    // The host and producer loops block on sockets, keep them off the runtime.
    let shutdown = Arc::new(AtomicBool::new(false));
    let session_shutdown = shutdown.clone();
    let mut session =
        tokio::task::spawn_blocking(move || loopback::run(&config, session_shutdown));

    let result = tokio::select! {
        result = &mut session => result,
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, stopping producer...");
            shutdown.store(true, Ordering::Relaxed);
            session.await
        }
    };

    match result.context("Loopback task failed")? {
        Ok(summary) => {
            info!(
                "Done: {} buffers presented, {} frames displayed",
                summary.presented, summary.displayed
            );
            Ok(())
        }
        Err(e) => {
            error!("Loopback error: {:#}", e);
            Err(e)
        }
    }
}
