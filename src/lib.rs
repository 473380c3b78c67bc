pub mod backup;
pub mod catalog;
pub mod db;
pub mod demographics;
pub mod embeddings;
pub mod error;
pub mod identity;
mod migrations;
pub mod object_store;
pub mod pipeline;
pub mod reports;
pub mod selection;
pub mod state;
pub mod sync;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use error::SyncError;
use state::AppState;

/// Channel buffer size for fatal errors raised by background tasks
const FATAL_CHANNEL_SIZE: usize = 4;

/// How long pollers get to notice shutdown before they are aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Spawn the background pollers and wait until `shutdown` flips to true or a
/// poller hits a local storage failure. Returns that failure, if any.
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
    // Config problems surface before anything is spawned.
    let media_dir = match state.object_store {
        Some(_) => catalog_media_dir(&state.config)?,
        None => None,
    };

    let (fatal_tx, mut fatal_rx) = mpsc::channel::<SyncError>(FATAL_CHANNEL_SIZE);
    let mut tasks = Vec::new();

    match state.sync.clone() {
        Some(engine) => {
            tasks.push(tokio::spawn(sync::poller::run_sync_poller(
                engine,
                state.sync_wake.clone(),
                shutdown.clone(),
                fatal_tx.clone(),
            )));
        }
        None => log::info!("Sync disabled; running stand-alone"),
    }

    if let Some(store) = state.object_store.clone() {
        if state.config.backup.enabled {
            tasks.push(tokio::spawn(backup::run_backup_poller(
                state.db.clone(),
                store.clone(),
                state.config.backup.clone(),
                shutdown.clone(),
            )));
        }
        if let Some(media_dir) = media_dir {
            tasks.push(tokio::spawn(catalog::run_catalog_poller(
                state.db.clone(),
                store,
                state.config.catalog.clone(),
                media_dir,
                shutdown.clone(),
            )));
        }
    }

    tasks.push(tokio::spawn(identity::run_retention_poller(
        state.resolver.clone(),
        shutdown.clone(),
    )));
    drop(fatal_tx);

    let outcome = tokio::select! {
        Some(err) = fatal_rx.recv() => Err(err),
        _ = async {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        } => Ok(()),
    };

    // On a clean shutdown the pollers stop by themselves; after a fatal error
    // nothing tells them to, so they are aborted.
    let grace = if outcome.is_ok() { SHUTDOWN_GRACE } else { Duration::ZERO };
    for mut task in tasks {
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
        }
    }
    outcome
}

/// Media directory for catalog ingest, or `None` when ingest is off.
fn catalog_media_dir(config: &types::Config) -> Result<Option<std::path::PathBuf>, SyncError> {
    if !config.catalog.enabled {
        return Ok(None);
    }
    config
        .resolved_media_dir()
        .map(Some)
        .map_err(|e| SyncError::Configuration(e.to_string()))
}
