pub mod access;
pub mod commands;
pub mod config;
pub mod db;
pub mod errors;
pub mod merge;
pub mod models;
pub mod notifications;
pub mod remote;
pub mod sanitize;
pub mod sync;

use crate::config::AppConfig;
use crate::db::Database;
use crate::models::SyncEvent;
use crate::remote::HttpRemote;
use crate::sync::SyncController;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub fn run() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    init_tracing(&config.log_dir()).map_err(anyhow::Error::msg)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(Database::new(&config.db_path())?);
    let settings = store.get_settings()?;
    let remote = Arc::new(HttpRemote::new(
        &config.server_url,
        Duration::from_secs(settings.remote_timeout_secs),
    )?);

    let controller = SyncController::new(store, remote, settings)?;
    let phase = controller.bootstrap().await?;
    tracing::info!(
        phase = phase.as_str(),
        server_url = %config.server_url,
        db_path = %config.db_path().display(),
        "sync started"
    );

    let tasks = controller.start();
    let mut events = controller.subscribe_events();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(error) = result {
                    tracing::error!(error = %error, "failed to listen for shutdown signal");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(SyncEvent::DataUpdated { last_updated }) => {
                    tracing::info!(last_updated, "document updated from remote");
                }
                Ok(SyncEvent::Conflict { server_version }) => {
                    tracing::warn!(server_version, "write conflict resolved");
                }
                Ok(event) => tracing::debug!(event = ?event, "sync event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "sync event listener fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    tasks.shutdown();
    tracing::info!("sync stopped");
    Ok(())
}

fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "teamsync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
