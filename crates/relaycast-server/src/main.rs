//! Relaycast - Dispatch engine entry point

use anyhow::Result;
use relaycast_common::config::{Config, LoggingConfig};
use relaycast_core::{DelayQueueScheduler, DispatchCoordinator, SmtpGatewayTransport};
use relaycast_storage::Repositories;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Relaycast dispatch engine...");

    // Initialize storage
    let repos = Repositories::open(&config.database).await?;
    info!(backend = %config.database.backend, "Storage ready");

    let shutdown = CancellationToken::new();

    // Start deferred task dispatcher
    let (deferred, deferred_handle) = DelayQueueScheduler::spawn(shutdown.clone());

    // Initialize dispatch coordinator
    let coordinator = Arc::new(DispatchCoordinator::new(
        &config,
        repos,
        Arc::new(SmtpGatewayTransport::new(config.smtp.clone())),
        Arc::new(deferred),
        shutdown.clone(),
    ));

    // Pick up campaigns left in progress, then keep polling for new ones
    let poll_handle = {
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        let poll = Duration::from_secs(config.dispatch.poll_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                match coordinator.resume_active().await {
                    Ok(0) => {}
                    Ok(started) => info!(started, "Campaign loops started"),
                    Err(e) => error!("Failed to resume campaigns: {}", e),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        })
    };

    info!(
        workers = config.dispatch.workers,
        batch_size = config.dispatch.batch_size,
        "Relaycast started successfully"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, waiting for in-flight sends");

    shutdown.cancel();
    if let Err(e) = poll_handle.await {
        error!("Campaign poller ended abnormally: {}", e);
    }
    coordinator.join().await;
    if let Err(e) = deferred_handle.await {
        error!("Deferred dispatcher ended abnormally: {}", e);
    }

    info!("Relaycast shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},relaycast=debug", config.level)));

    let (json, text) = if config.format == "json" {
        (Some(fmt::layer().json().with_target(true)), None)
    } else {
        (None, Some(fmt::layer().with_target(true).with_level(true)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}
