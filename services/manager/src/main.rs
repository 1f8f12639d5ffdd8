//! Deployment Manager
//!
//! Keeps the instance trees of every managed application, provisions the
//! machines backing scoped instances and drives agents over the message bus.
//!
//! ## Architecture
//!
//! - **Message Processor**: Handles heartbeats and status reports from agents
//! - **Health Monitor**: Flags agents that stop sending heartbeats
//! - **Orchestrator**: Applies lifecycle requests to the instance trees
//! - **State Store**: Persists applications so they survive a restart

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dm_manager::config::Config;
use dm_manager::messaging::{InMemoryBus, InMemoryClientFactory};
use dm_manager::monitor::run_monitor_loop;
use dm_manager::state::SqliteInstanceStore;
use dm_manager::targets::MockTargetHandler;
use dm_manager::{Manager, ManagerOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting deployment manager");
    info!(
        data_dir = %config.data_dir.display(),
        messaging_type = %config.messaging_type,
        monitor_interval_secs = config.monitor_interval_secs,
        heartbeat_threshold = config.heartbeat_threshold,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;
    let store = Arc::new(SqliteInstanceStore::open(config.database_path())?);

    let manager = Arc::new(Manager::new(
        ManagerOptions::from_config(&config).with_store(store),
    ));

    // Local backends; real ones register themselves the same way.
    let bus = Arc::new(InMemoryBus::new());
    manager
        .register_messaging_factory(Arc::new(InMemoryClientFactory::new(bus)))
        .await?;
    manager.register_target_handler(Arc::new(MockTargetHandler::new()));
    manager
        .switch_messaging_backend(&config.messaging_type)
        .await?;

    let restored = manager.restore_applications().await?;
    info!(applications = restored, "Applications restored");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor = manager
        .take_processor()
        .context("message processor already taken")?;
    let processor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { processor.run(shutdown_rx).await }
    });

    let monitor_handle = tokio::spawn({
        let manager = Arc::clone(&manager);
        let interval = config.monitor_interval();
        let shutdown_rx = shutdown_rx.clone();
        async move { run_monitor_loop(manager, interval, shutdown_rx).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = processor_handle => {
            match result {
                Ok(Ok(())) => info!("Message processor exited normally"),
                Ok(Err(e)) => error!(error = %e, "Message processor error"),
                Err(e) => error!(error = %e, "Message processor task panicked"),
            }
        }
        result = monitor_handle => {
            match result {
                Ok(Ok(())) => info!("Health monitor exited normally"),
                Ok(Err(e)) => error!(error = %e, "Health monitor error"),
                Err(e) => error!(error = %e, "Health monitor task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    manager.shutdown().await;

    info!("Deployment manager shutdown complete");
    Ok(())
}
