//! One sync round and the retry driver around it.
//!
//! The store lock is taken in short scoped blocks and never held across an
//! `.await`; detection keeps resolving and selecting while a round waits on
//! the network. Cancellation is checked at every phase boundary.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use super::backoff::Backoff;
use super::checksum::{checksum, BatchChecksum};
use super::reconcile::{apply_rows, ApplyStats};
use super::remote::{PullRequest, PushRequest, RemoteError, RemoteStore};
use super::{SyncState, SyncStatus};
use crate::db::{DbError, EntityType, SharedDb, SyncRow};
use crate::error::{SyncError, SyncErrorReport};
use crate::types::SyncConfig;

/// What one successful round moved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundReport {
    pub pushed: usize,
    pub duplicates: usize,
    pub pulled: usize,
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    /// More rows were waiting on either side than one batch could carry.
    pub has_more: bool,
}

impl RoundReport {
    fn absorb(&mut self, stats: ApplyStats) {
        self.applied += stats.applied;
        self.skipped += stats.skipped;
        self.conflicts += stats.conflicts;
    }
}

struct OutgoingBatch {
    entity: EntityType,
    rows: Vec<SyncRow>,
    more_waiting: bool,
}

pub struct SyncEngine {
    db: SharedDb,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    request_timeout: Duration,
    status: Mutex<SyncStatus>,
    backoff: Mutex<Backoff>,
}

impl SyncEngine {
    pub fn new(db: SharedDb, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let request_timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let backoff = Backoff::new(config.retry.clone());
        Self {
            db,
            remote,
            config,
            request_timeout,
            status: Mutex::new(SyncStatus::default()),
            backoff: Mutex::new(backoff),
        }
    }

    /// Override the per-call timeout taken from configuration.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    /// Delay before the next round after a failed one. Grows with each call
    /// until a round succeeds.
    pub fn next_backoff_delay(&self) -> Duration {
        self.backoff.lock().next_delay()
    }

    fn transition(&self, next: SyncState) {
        let mut status = self.status.lock();
        if status.state.can_transition_to(next) {
            status.state = next;
        } else {
            log::warn!("Sync: rejected transition {} -> {}", status.state, next);
        }
    }

    fn check_cancelled(shutdown: &watch::Receiver<bool>) -> Result<(), SyncError> {
        if *shutdown.borrow() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    async fn call_remote<T, F>(&self, call: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(self.request_timeout)),
        }
    }

    // =========================================================================
    // One round
    // =========================================================================

    /// Run a single `Collecting → Pushing → Pulling → Reconciling` round.
    ///
    /// On a remote-side failure the engine ends in `Backoff`; on cancellation
    /// or a local storage failure it ends in `Idle`.
    pub async fn run_round(&self, shutdown: &watch::Receiver<bool>) -> Result<RoundReport, SyncError> {
        self.transition(SyncState::Collecting);
        let result = self.round_phases(shutdown).await;
        match &result {
            Ok(_) => self.transition(SyncState::Idle),
            Err(SyncError::Cancelled) => {
                log::info!("Sync: round cancelled");
                self.transition(SyncState::Idle);
            }
            Err(e) if e.is_fatal() => {
                log::error!("Sync: local storage failure, abandoning round: {}", e);
                self.transition(SyncState::Idle);
            }
            Err(e) => {
                log::warn!("Sync: round failed: {}", e);
                self.transition(SyncState::Failed);
                self.transition(SyncState::Backoff);
            }
        }
        result
    }

    async fn round_phases(&self, shutdown: &watch::Receiver<bool>) -> Result<RoundReport, SyncError> {
        let mut report = RoundReport::default();

        Self::check_cancelled(shutdown)?;
        let batches = self.collect()?;
        report.has_more = batches.iter().any(|b| b.more_waiting);

        Self::check_cancelled(shutdown)?;
        self.transition(SyncState::Pushing);
        for batch in batches.iter().filter(|b| !b.rows.is_empty()) {
            Self::check_cancelled(shutdown)?;
            let (accepted, duplicates) = self.push_batch(batch).await?;
            report.pushed += accepted;
            report.duplicates += duplicates;
        }

        Self::check_cancelled(shutdown)?;
        self.transition(SyncState::Pulling);
        for entity in EntityType::APPLY_ORDER {
            Self::check_cancelled(shutdown)?;
            let (pulled, has_more) = self.pull_entity(entity).await?;
            report.pulled += pulled;
            report.has_more |= has_more;
        }

        Self::check_cancelled(shutdown)?;
        self.transition(SyncState::Reconciling);
        let stats = self.reconcile()?;
        report.absorb(stats);

        {
            let db = self.db.lock();
            let mut pending = 0;
            for entity in EntityType::PUSH_ORDER {
                pending += db.pending_outgoing(entity)?;
            }
            self.status.lock().pending = pending;
        }

        Ok(report)
    }

    fn collect(&self) -> Result<Vec<OutgoingBatch>, SyncError> {
        let db = self.db.lock();
        let mut batches = Vec::with_capacity(EntityType::PUSH_ORDER.len());
        let mut pending = 0;
        for entity in EntityType::PUSH_ORDER {
            let cursor = db.sync_cursor(entity)?;
            let rows = db.collect_outgoing(entity, cursor.last_pushed_seq, self.config.batch_size)?;
            let waiting = db.pending_outgoing(entity)?;
            pending += waiting;
            batches.push(OutgoingBatch {
                entity,
                more_waiting: waiting > rows.len() as i64,
                rows,
            });
        }
        self.status.lock().pending = pending;
        Ok(batches)
    }

    /// Push one batch; advance the push cursor only once the remote confirms
    /// it holds exactly these rows.
    async fn push_batch(&self, batch: &OutgoingBatch) -> Result<(usize, usize), SyncError> {
        let device_id = self.device_id();
        let sent = integrity_checksum(&batch.rows)?;
        let first_seq = batch.rows.first().map(|r| r.seq).unwrap_or(0);
        let last_seq = batch.rows.last().map(|r| r.seq).unwrap_or(0);
        let request = PushRequest {
            idempotency_key: format!("{}:{}:{}-{}", device_id, batch.entity, first_seq, last_seq),
            device_id,
            entity_type: batch.entity,
            rows: batch.rows.clone(),
            checksum: sent.clone(),
        };

        let ack = self.call_remote(self.remote.push(request)).await?;
        if ack.persisted != sent {
            return Err(SyncError::IntegrityMismatch {
                entity: batch.entity,
                phase: "push",
                expected: sent.to_string(),
                actual: ack.persisted.to_string(),
            });
        }

        {
            let db = self.db.lock();
            db.with_transaction(|db| db.advance_push_cursor(batch.entity, last_seq, Utc::now()))?;
        }
        log::info!(
            "Sync: pushed {} {} rows ({} accepted, {} already present)",
            batch.rows.len(),
            batch.entity,
            ack.accepted,
            ack.duplicates
        );
        Ok((ack.accepted, ack.duplicates))
    }

    /// Pull one page of other devices' rows for `entity` into staging.
    async fn pull_entity(&self, entity: EntityType) -> Result<(usize, bool), SyncError> {
        let device_id = self.device_id();
        let since = {
            let db = self.db.lock();
            db.clear_staging(entity)?;
            db.sync_cursor(entity)?.last_pulled_remote_seq
        };

        let request = PullRequest {
            device_id: device_id.clone(),
            entity_type: entity,
            since_remote_seq: since,
            limit: self.config.batch_size,
        };
        let batch = self.call_remote(self.remote.pull(request)).await?;

        let received = integrity_checksum(&batch.rows)?;
        if received != batch.checksum {
            return Err(SyncError::IntegrityMismatch {
                entity,
                phase: "pull",
                expected: batch.checksum.to_string(),
                actual: received.to_string(),
            });
        }
        if let Some(stray) = batch
            .rows
            .iter()
            .find(|r| r.entity_type != entity || r.origin_device == device_id || r.remote_seq.is_none())
        {
            return Err(SyncError::IntegrityMismatch {
                entity,
                phase: "pull",
                expected: format!("{} rows from other devices", entity),
                actual: format!("row {}", stray.idempotency_key()),
            });
        }
        if batch.rows.is_empty() {
            return Ok((0, false));
        }

        let db = self.db.lock();
        db.stage_rows(&batch.rows)?;
        let staged = integrity_checksum(&db.staged_rows(entity)?)?;
        if staged != batch.checksum {
            db.clear_staging(entity)?;
            return Err(SyncError::IntegrityMismatch {
                entity,
                phase: "staging",
                expected: batch.checksum.to_string(),
                actual: staged.to_string(),
            });
        }
        log::info!("Sync: staged {} {} rows", batch.rows.len(), entity);
        Ok((batch.rows.len(), batch.has_more))
    }

    /// Apply everything staged in one local transaction that also advances
    /// the pull cursors and empties staging.
    fn reconcile(&self) -> Result<ApplyStats, SyncError> {
        let db = self.db.lock();
        db.with_transaction(|db| {
            let now = Utc::now();
            let mut total = ApplyStats::default();
            for entity in EntityType::APPLY_ORDER {
                let staged = db.staged_rows(entity)?;
                let Some(max_remote_seq) = staged.iter().filter_map(|r| r.remote_seq).max() else {
                    continue;
                };
                let stats = apply_rows(db, entity, &staged, now).map_err(|e| reconcile_error(entity, e))?;
                db.advance_pull_cursor(entity, max_remote_seq, now)?;
                db.clear_staging(entity)?;
                if stats.conflicts > 0 || stats.applied > 0 {
                    log::info!(
                        "Sync: applied {} {} rows, {} conflicts",
                        stats.applied,
                        entity,
                        stats.conflicts
                    );
                }
                total.applied += stats.applied;
                total.skipped += stats.skipped;
                total.conflicts += stats.conflicts;
                total.known_conflicts += stats.known_conflicts;
            }
            Ok(total)
        })
    }

    fn device_id(&self) -> String {
        self.db.lock().device_id().to_string()
    }

    // =========================================================================
    // Retry driver
    // =========================================================================

    /// Run a round, retrying transient failures up to `maxAttempts` and an
    /// integrity mismatch once. Escalated failures raise the operator alert.
    pub async fn run_with_retry(&self, shutdown: &watch::Receiver<bool>) -> Result<RoundReport, SyncError> {
        let policy = self.config.retry.clone();
        let mut attempt: u32 = 0;
        let mut integrity_retried = false;

        loop {
            attempt += 1;
            let err = match self.run_round(shutdown).await {
                Ok(report) => {
                    self.record_success();
                    return Ok(report);
                }
                Err(e) => e,
            };

            if matches!(err, SyncError::Cancelled) {
                return Err(err);
            }
            if err.is_integrity() && !integrity_retried {
                integrity_retried = true;
                self.record_failure(&err, false);
                log::warn!("Sync: integrity check failed, retrying once: {}", err);
            } else if err.is_retryable() && attempt < policy.max_attempts {
                self.record_failure(&err, false);
                log::warn!(
                    "Sync: attempt {}/{} failed, retrying: {}",
                    attempt,
                    policy.max_attempts,
                    err
                );
            } else {
                let escalate = err.is_fatal() || err.is_integrity() || err.requires_operator();
                self.record_failure(&err, escalate);
                return Err(err);
            }

            sleep_or_cancel(policy.delay(attempt), shutdown).await?;
        }
    }

    fn record_success(&self) {
        self.backoff.lock().reset();
        let mut status = self.status.lock();
        status.last_success = Some(Utc::now());
        status.last_error = None;
        status.operator_alert = None;
        status.consecutive_failures = 0;
    }

    fn record_failure(&self, err: &SyncError, escalate: bool) {
        let report = SyncErrorReport::from(err);
        let mut status = self.status.lock();
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        status.last_error = Some(report.clone());
        if escalate {
            log::error!("Sync: operator attention needed: {} ({})", report.message, report.recovery_suggestion);
            status.operator_alert = Some(report);
        }
    }
}

fn integrity_checksum(rows: &[SyncRow]) -> Result<BatchChecksum, SyncError> {
    checksum(rows).map_err(|e| SyncError::LocalStorageFatal(DbError::Json(e)))
}

/// Rows that pass the checksum but do not decode came from a faulty peer,
/// not from local storage.
fn reconcile_error(entity: EntityType, err: DbError) -> SyncError {
    match err {
        DbError::Corrupt(msg) => SyncError::IntegrityMismatch {
            entity,
            phase: "reconcile",
            expected: "decodable rows".to_string(),
            actual: msg,
        },
        DbError::Json(e) => SyncError::IntegrityMismatch {
            entity,
            phase: "reconcile",
            expected: "decodable rows".to_string(),
            actual: e.to_string(),
        },
        other => SyncError::LocalStorageFatal(other),
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
pub async fn sleep_or_cancel(delay: Duration, shutdown: &watch::Receiver<bool>) -> Result<(), SyncError> {
    if *shutdown.borrow() {
        return Err(SyncError::Cancelled);
    }
    let mut shutdown = shutdown.clone();
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
                Err(SyncError::Cancelled)
            } else {
                Ok(())
            }
        }
    }
}
