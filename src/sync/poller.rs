//! Background sync poller.
//!
//! Runs a round every `intervalSecs`, immediately when woken through the
//! `Notify`, and again without waiting while either side has more than a
//! batch queued. Failed rounds wait out the engine's backoff instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};

use super::engine::SyncEngine;
use crate::error::SyncError;

pub async fn run_sync_poller(
    engine: Arc<SyncEngine>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    fatal: mpsc::Sender<SyncError>,
) {
    let interval = Duration::from_secs(engine.config().interval_secs.max(1));

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = if !engine.config().enabled {
            interval
        } else {
            match engine.run_with_retry(&shutdown).await {
                Ok(report) => {
                    if report.pushed + report.pulled + report.conflicts > 0 {
                        log::info!(
                            "Sync poller: pushed {}, pulled {}, {} conflicts",
                            report.pushed,
                            report.pulled,
                            report.conflicts
                        );
                    } else {
                        log::debug!("Sync poller: nothing to sync");
                    }
                    if report.has_more {
                        Duration::ZERO
                    } else {
                        interval
                    }
                }
                Err(SyncError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    log::error!("Sync poller: stopping on local storage failure: {}", e);
                    let _ = fatal.send(e).await;
                    break;
                }
                Err(e) => {
                    let delay = engine.next_backoff_delay();
                    log::warn!("Sync poller: round failed ({}), next attempt in {:?}", e, delay);
                    delay
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = wake.notified() => {
                log::info!("Sync poller: woken by manual sync signal");
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            },
        }
    }

    log::info!("Sync poller: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::EntityType;
    use crate::sync::remote::MemoryRemoteStore;
    use crate::types::SyncConfig;
    use chrono::Utc;

    #[tokio::test]
    async fn test_wake_runs_a_round_and_shutdown_stops() {
        let remote = MemoryRemoteStore::new();
        let db = test_db("dev-a").into_shared();
        let config = SyncConfig {
            enabled: true,
            interval_secs: 3600,
            ..SyncConfig::default()
        };
        let engine = Arc::new(SyncEngine::new(db.clone(), Arc::new(remote.clone()), config));
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

        let handle = tokio::spawn(run_sync_poller(engine.clone(), wake.clone(), shutdown_rx, fatal_tx));

        // The first round runs at startup with nothing to push.
        db.lock().create_person("p1", &[1.0, 0.0], None, Utc::now()).unwrap();
        let mut synced = false;
        for _ in 0..200 {
            wake.notify_one();
            if remote.rows_of(EntityType::Person).len() == 1 {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(synced);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(fatal_rx.try_recv().is_err());
        assert!(engine.status().last_success.is_some());
    }
}
