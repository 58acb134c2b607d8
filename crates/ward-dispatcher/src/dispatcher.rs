//! The coordination kernel's single serialization point. Every authoritative
//! state change - submit, lease grant, heartbeat, complete, fail, and the
//! background expiry scan - funnels through [`Coordinator`]'s one lock and
//! the canonical pipeline `validate -> choose record -> append -> sync (per
//! policy) -> apply -> respond`.

use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;
use ward_core::{LeaseEngine, Metrics, MetricsSnapshot, Record, RetryPolicy, StateStore, WorkerRegistry};
use ward_wal::{Wal, WalError};

use crate::config::DispatcherConfig;

/// Transport-level failure: the operation did not happen. Distinct from the
/// REJECTED/CANCELLED response variants, which are normal outcomes of a
/// request that *did* reach the pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("durability failure: {0}")]
    Durability(#[from] WalError),

    #[error("rejected: {0}")]
    Rejected(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Outcome of `request_lease`.
pub enum LeaseOutcome {
    Granted {
        task_id: Uuid,
        lease_id: Uuid,
        payload: Vec<u8>,
        lease_expiry: DateTime<Utc>,
        attempt: i64,
    },
    NoWork,
}

/// Outcome of `heartbeat`. No CANCELLED variant: an expired or mismatched
/// lease at heartbeat time is a rejection, not a cancellation, because
/// nothing was ever committed under it.
pub enum HeartbeatOutcome {
    Committed { new_expiry: DateTime<Utc> },
    Rejected(String),
}

/// Outcome of `complete`/`fail`.
pub enum TerminalOutcome {
    Committed,
    Cancelled,
    Rejected(String),
}

struct CoordinatorState {
    wal: Wal,
    store: StateStore,
    unsynced: usize,
    batch_opened_at: Option<Instant>,
}

/// Replay statistics surfaced to the caller on startup, and to the
/// `Metrics` snapshot as `last_replay_duration_micros`.
#[derive(Debug, Clone, Copy)]
pub struct ReplayStats {
    pub record_count: usize,
    pub duration: StdDuration,
}

pub struct Coordinator {
    state: Mutex<CoordinatorState>,
    synced_offset_tx: watch::Sender<u64>,
    synced_offset_rx: watch::Receiver<u64>,
    registry: WorkerRegistry,
    metrics: Metrics,
    config: DispatcherConfig,
}

impl Coordinator {
    /// Opens the WAL at `config.wal_path`, replays it into a fresh
    /// `StateStore`, and returns a ready coordinator plus replay stats. This
    /// is the only place `StateStore` is constructed other than in tests.
    pub fn open(config: DispatcherConfig) -> anyhow::Result<(Self, ReplayStats)> {
        let wal = Wal::open(&config.wal_path)?;
        let mut store = StateStore::new();
        let replay_start = Instant::now();
        let mut count = 0usize;
        wal.replay(|replayed| {
            let now = record_embedded_now(&replayed.record);
            store
                .apply(&replayed.record, now)
                .map_err(|err| WalError::Corruption {
                    offset: replayed.offset,
                    reason: err.to_string(),
                })?;
            count += 1;
            Ok(())
        })?;
        let duration = replay_start.elapsed();
        tracing::info!(records = count, duration_ms = duration.as_millis(), "wal replay complete");

        let metrics = Metrics::new();
        metrics.record_replay_duration(duration);
        if count > 0 {
            metrics.record_coordinator_restart();
        }

        let (synced_offset_tx, synced_offset_rx) = watch::channel(wal.size());
        let coordinator = Self {
            state: Mutex::new(CoordinatorState {
                wal,
                store,
                unsynced: 0,
                batch_opened_at: None,
            }),
            synced_offset_tx,
            synced_offset_rx,
            registry: WorkerRegistry::new(),
            metrics,
            config,
        };
        Ok((coordinator, ReplayStats { record_count: count, duration }))
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        // Best-effort, lock-free-ish snapshot: try_lock so a metrics reader
        // never competes with the write path for the serialization lock.
        let leased = self
            .state
            .try_lock()
            .map(|g| g.store.leased_task_count() as u64)
            .unwrap_or(0);
        self.metrics.snapshot(leased)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    // ---- request operations -------------------------------------------

    pub async fn submit_task(
        &self,
        payload: Vec<u8>,
        execution_window_secs: i64,
        retry_policy: RetryPolicy,
        request_id: Option<String>,
    ) -> DispatchResult<Uuid> {
        if execution_window_secs <= 0 {
            // Malformed requests never reach the WAL; validation happens
            // strictly before any record is chosen.
            return Err(DispatchError::Rejected(
                "execution_window_secs must be positive".into(),
            ));
        }
        if retry_policy.max_attempts < 0 {
            return Err(DispatchError::Rejected("retry_policy.max_attempts must be non-negative".into()));
        }

        let mut guard = self.state.lock().await;

        if let Some(rid) = &request_id {
            if let Some(existing) = guard.store.task_id_for_request(rid) {
                tracing::info!(event = "submit_task_idempotent", request_id = %rid, task_id = %existing);
                return Ok(existing);
            }
        }

        let task_id = Uuid::new_v4();
        let now = Utc::now();
        let record = Record::TaskCreated {
            task_id,
            payload,
            execution_window_secs,
            retry_policy,
            request_id,
            created_at: now,
        };

        let offset = self.append_and_apply(&mut guard, record, now)?;
        drop(guard);
        self.wait_for_sync(offset).await;

        tracing::info!(event = "task_created", task_id = %task_id);
        Ok(task_id)
    }

    pub async fn request_lease(&self, worker_id: &str) -> DispatchResult<LeaseOutcome> {
        self.registry.record_heartbeat(worker_id, Utc::now());

        let mut guard = self.state.lock().await;
        let now = Utc::now();
        let Some(candidate) = LeaseEngine::select_grant(&guard.store, &self.registry, worker_id, now) else {
            return Ok(LeaseOutcome::NoWork);
        };

        let Record::LeaseGranted {
            task_id,
            lease_id,
            attempt,
            lease_expiry,
            ..
        } = candidate.clone()
        else {
            unreachable!("LeaseEngine::select_grant only returns LeaseGranted");
        };

        let payload = guard
            .store
            .task(task_id)
            .map(|t| t.payload.clone())
            .unwrap_or_default();

        let offset = self.append_and_apply(&mut guard, candidate, now)?;
        drop(guard);
        self.wait_for_sync(offset).await;
        self.registry.adjust_lease_count(worker_id, 1);

        if attempt > 1 {
            self.metrics.record_duplicate_execution();
        }

        tracing::info!(event = "lease_granted", task_id = %task_id, lease_id = %lease_id, worker_id, attempt);
        Ok(LeaseOutcome::Granted {
            task_id,
            lease_id,
            payload,
            lease_expiry,
            attempt,
        })
    }

    pub async fn heartbeat(&self, worker_id: &str, task_id: Uuid, lease_id: Uuid) -> DispatchResult<HeartbeatOutcome> {
        self.registry.record_heartbeat(worker_id, Utc::now());

        let mut guard = self.state.lock().await;
        let now = Utc::now();

        if !guard.store.is_current(task_id, lease_id) {
            return Ok(HeartbeatOutcome::Rejected("lease is not current for task".into()));
        }
        let Some(lease) = guard.store.lease(lease_id) else {
            return Ok(HeartbeatOutcome::Rejected("unknown lease".into()));
        };
        if lease.expiry <= now {
            return Ok(HeartbeatOutcome::Rejected("lease already expired".into()));
        }

        let new_expiry = now + self.task_execution_window(&guard.store, task_id);
        let record = Record::LeaseExtended {
            lease_id,
            new_lease_expiry: new_expiry,
        };

        let offset = self.append_and_apply(&mut guard, record, now)?;
        drop(guard);
        self.wait_for_sync(offset).await;

        tracing::info!(event = "lease_extended", task_id = %task_id, lease_id = %lease_id, new_expiry = %new_expiry);
        Ok(HeartbeatOutcome::Committed { new_expiry })
    }

    pub async fn complete(&self, task_id: Uuid, lease_id: Uuid) -> DispatchResult<TerminalOutcome> {
        let mut guard = self.state.lock().await;
        let now = Utc::now();

        if guard.store.task(task_id).is_none() {
            return Ok(TerminalOutcome::Rejected("unknown task".into()));
        }

        if guard.store.is_current(task_id, lease_id) {
            let expired = guard.store.lease(lease_id).map(|l| l.expiry <= now).unwrap_or(true);
            if expired {
                // The lease is still current in the store (nobody has run the
                // expiry scan yet) but has already timed out on the wall
                // clock. Retire it the same way the scan would, then answer
                // the worker as if it lost the race, which it did.
                let record = Record::LeaseExpired { task_id, lease_id };
                let offset = self.append_and_apply(&mut guard, record, now)?;
                drop(guard);
                self.wait_for_sync(offset).await;
                self.metrics.record_lease_expiration();
                tracing::info!(event = "lease_expired", task_id = %task_id, lease_id = %lease_id, reason = "observed expired at completion");
                return Ok(TerminalOutcome::Cancelled);
            }
            let record = Record::TaskCompleted { task_id, lease_id };
            let offset = self.append_and_apply(&mut guard, record, now)?;
            drop(guard);
            self.wait_for_sync(offset).await;
            tracing::info!(event = "task_completed", task_id = %task_id, lease_id = %lease_id);
            return Ok(TerminalOutcome::Committed);
        }

        if !guard.store.was_ever_leased(task_id, lease_id) {
            return Ok(TerminalOutcome::Rejected("lease was never associated with this task".into()));
        }

        // The lease is not current (raced with an expiry or a later grant)
        // but it did hold authority at some point: the report is late, not
        // malformed, so the record is a TaskCancelled rather than a rejection.
        let record = Record::TaskCancelled { task_id, lease_id };
        let offset = self.append_and_apply(&mut guard, record, now)?;
        drop(guard);
        self.wait_for_sync(offset).await;
        tracing::info!(event = "task_cancelled", task_id = %task_id, lease_id = %lease_id, reason = "lease not current");
        Ok(TerminalOutcome::Cancelled)
    }

    pub async fn fail(&self, task_id: Uuid, lease_id: Uuid, reason: String) -> DispatchResult<TerminalOutcome> {
        let mut guard = self.state.lock().await;
        let now = Utc::now();

        let Some(task) = guard.store.task(task_id) else {
            return Ok(TerminalOutcome::Rejected("unknown task".into()));
        };

        if guard.store.is_current(task_id, lease_id) {
            let expired = guard.store.lease(lease_id).map(|l| l.expiry <= now).unwrap_or(true);
            let record = if expired {
                Record::LeaseExpired { task_id, lease_id }
            } else {
                Record::TaskFailed {
                    task_id,
                    lease_id,
                    failure_reason: reason,
                }
            };
            let will_retry = !expired && task.attempt < task.retry_policy.max_attempts;
            let offset = self.append_and_apply(&mut guard, record, now)?;
            drop(guard);
            self.wait_for_sync(offset).await;
            if expired {
                self.metrics.record_lease_expiration();
                tracing::info!(event = "lease_expired", task_id = %task_id, lease_id = %lease_id, reason = "observed expired at failure");
                return Ok(TerminalOutcome::Cancelled);
            }
            if will_retry {
                self.metrics.record_retry();
            }
            tracing::info!(event = "task_failed", task_id = %task_id, lease_id = %lease_id, will_retry);
            return Ok(TerminalOutcome::Committed);
        }

        if !guard.store.was_ever_leased(task_id, lease_id) {
            return Ok(TerminalOutcome::Rejected("lease was never associated with this task".into()));
        }

        let record = Record::TaskCancelled { task_id, lease_id };
        let offset = self.append_and_apply(&mut guard, record, now)?;
        drop(guard);
        self.wait_for_sync(offset).await;
        tracing::info!(event = "task_cancelled", task_id = %task_id, lease_id = %lease_id, reason = "lease not current");
        Ok(TerminalOutcome::Cancelled)
    }

    /// Scans for past-due leases and revokes each through the same
    /// serialization point as any external request. Called by the
    /// background expiry ticker; never by request handlers directly.
    pub async fn scan_expired_leases(&self) -> DispatchResult<usize> {
        let mut expired_count = 0usize;
        loop {
            let mut guard = self.state.lock().await;
            let now = Utc::now();
            let candidates = LeaseEngine::expire_candidates(&guard.store, now);
            let Some(record) = candidates.into_iter().next() else {
                break;
            };
            let task_id = record.task_id();
            let offset = self.append_and_apply(&mut guard, record, now)?;
            drop(guard);
            self.wait_for_sync(offset).await;
            self.metrics.record_lease_expiration();
            expired_count += 1;
            tracing::info!(event = "lease_expired", task_id = %task_id);
        }
        Ok(expired_count)
    }

    fn task_execution_window(&self, store: &StateStore, task_id: Uuid) -> chrono::Duration {
        store
            .task(task_id)
            .map(|t| t.execution_window())
            .unwrap_or_else(|| chrono::Duration::seconds(self.config.lease_duration_secs))
    }

    /// Appends, applies the batch-sync policy, and applies the record to
    /// the in-memory store. Returns the WAL offset the caller must wait to
    /// see synced before it may respond. The applier running here is the
    /// same pure function replay uses; a precondition failure at this point
    /// (live append) is a correctness bug in the caller, not a recoverable
    /// condition, so it is propagated as a panic-free `InvariantViolation`
    /// log and the record is still durable (the bug is in validation, not
    /// in the WAL).
    fn append_and_apply(
        &self,
        guard: &mut CoordinatorState,
        record: Record,
        now: DateTime<Utc>,
    ) -> DispatchResult<u64> {
        guard.wal.append(&record)?;
        let offset = guard.wal.size();
        guard.unsynced += 1;
        if guard.batch_opened_at.is_none() {
            guard.batch_opened_at = Some(Instant::now());
        }

        let batch_full = guard.unsynced >= self.config.sync_batch_size.max(1);
        let batch_timed_out = guard
            .batch_opened_at
            .map(|t| t.elapsed() >= StdDuration::from_millis(self.config.sync_batch_interval_ms))
            .unwrap_or(false);

        if self.config.sync_batch_size <= 1 || batch_full || batch_timed_out {
            guard.wal.sync()?;
            guard.unsynced = 0;
            guard.batch_opened_at = None;
            let _ = self.synced_offset_tx.send(offset);
        }

        if let Err(err) = guard.store.apply(&record, now) {
            // A precondition failure on a record the dispatcher itself just
            // chose means the validate step above had a bug; the record is
            // already durable, so we can only surface it loudly.
            tracing::error!(error = %err, record = record.name(), "applier rejected a live-appended record");
        }

        Ok(offset)
    }

    /// Blocks until the batch containing `offset` has been fsync'd, either
    /// by this call (batch size 1) or by the background batch-sync ticker.
    async fn wait_for_sync(&self, offset: u64) {
        let mut rx = self.synced_offset_rx.clone();
        if *rx.borrow() >= offset {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() >= offset {
                return;
            }
        }
    }

    /// Periodic batch-sync flush: if a batch has been left open longer than
    /// `sync_batch_interval_ms` without reaching `sync_batch_size`, force it
    /// through. Runs until `shutdown_rx` fires.
    pub async fn run_batch_sync_ticker(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = StdDuration::from_millis(self.config.sync_batch_interval_ms.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    continue;
                }
            }
            if *shutdown_rx.borrow() {
                return;
            }
            let mut guard = self.state.lock().await;
            if guard.unsynced > 0 {
                if let Err(err) = guard.wal.sync() {
                    tracing::error!(error = %err, "batch-sync ticker failed");
                    continue;
                }
                guard.unsynced = 0;
                guard.batch_opened_at = None;
                let offset = guard.wal.size();
                let _ = self.synced_offset_tx.send(offset);
            }
        }
    }

    /// Periodic expiry scan: runs until `shutdown_rx` fires.
    pub async fn run_expiry_ticker(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = StdDuration::from_millis(self.config.expiry_scan_interval_ms.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    continue;
                }
            }
            if *shutdown_rx.borrow() {
                return;
            }
            if let Err(err) = self.scan_expired_leases().await {
                tracing::error!(error = %err, "expiry scan failed");
            }
        }
    }
}

/// Replay applies each record against its own embedded timestamp: for
/// records whose precondition checks time (`TaskCompleted`/`TaskFailed`
/// expiry comparisons), the only timestamp available offline is the one the
/// record itself carries as metadata (`granted_at`); records with no
/// embedded clock reuse `Utc::now()`-independent defaults since their
/// preconditions do not consult time at all.
fn record_embedded_now(record: &Record) -> DateTime<Utc> {
    match record {
        Record::TaskCreated { created_at, .. } => *created_at,
        Record::LeaseGranted { granted_at, .. } => *granted_at,
        // None of these apply-effects consult `now`; any value strictly
        // before a lease's own expiry keeps the precondition honest since
        // the expiry comparison for TaskCompleted/TaskFailed only matters
        // on the live decision path, never replay, where the
        // record already encodes the outcome as a fact.
        _ => DateTime::<Utc>::MIN_UTC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> DispatcherConfig {
        DispatcherConfig {
            wal_path: dir.join("ward.wal"),
            bind_addr: "127.0.0.1:0".to_string(),
            lease_duration_secs: 30,
            heartbeat_interval_secs: 10,
            max_retries: 0,
            sync_batch_size: 1,
            sync_batch_interval_ms: 50,
            expiry_scan_interval_ms: 1000,
        }
    }

    #[tokio::test]
    async fn happy_path_s1() {
        let dir = tempdir().unwrap();
        let (coordinator, _) = Coordinator::open(config(dir.path())).unwrap();

        let task_id = coordinator
            .submit_task(b"payload".to_vec(), 300, RetryPolicy::none(), None)
            .await
            .unwrap();

        let LeaseOutcome::Granted {
            task_id: leased_task,
            lease_id,
            attempt,
            ..
        } = coordinator.request_lease("w1").await.unwrap()
        else {
            panic!("expected a grant");
        };
        assert_eq!(leased_task, task_id);
        assert_eq!(attempt, 1);

        let outcome = coordinator.complete(task_id, lease_id).await.unwrap();
        assert!(matches!(outcome, TerminalOutcome::Committed));
    }

    #[tokio::test]
    async fn duplicate_submit_with_same_request_id_is_idempotent() {
        let dir = tempdir().unwrap();
        let (coordinator, _) = Coordinator::open(config(dir.path())).unwrap();

        let first = coordinator
            .submit_task(b"p".to_vec(), 30, RetryPolicy::none(), Some("req-1".into()))
            .await
            .unwrap();
        let second = coordinator
            .submit_task(b"p".to_vec(), 30, RetryPolicy::none(), Some("req-1".into()))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn complete_on_unknown_task_is_rejected() {
        let dir = tempdir().unwrap();
        let (coordinator, _) = Coordinator::open(config(dir.path())).unwrap();

        let outcome = coordinator
            .complete(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(outcome, TerminalOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn expiry_then_duplicate_execution_s2() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.expiry_scan_interval_ms = 10;
        let (coordinator, _) = Coordinator::open(cfg).unwrap();

        let task_id = coordinator
            .submit_task(b"p".to_vec(), 1, RetryPolicy::none(), None)
            .await
            .unwrap();
        let LeaseOutcome::Granted { lease_id: lease_1, .. } = coordinator.request_lease("w1").await.unwrap() else {
            panic!("expected grant");
        };

        // Let the 1-second lease window lapse for real; the applier's clock
        // is wall-clock time, not mockable tokio virtual time.
        tokio::time::sleep(StdDuration::from_millis(1100)).await;
        let expired = coordinator.scan_expired_leases().await.unwrap();
        assert_eq!(expired, 1);

        let LeaseOutcome::Granted {
            lease_id: lease_2,
            attempt: attempt_2,
            ..
        } = coordinator.request_lease("w2").await.unwrap()
        else {
            panic!("expected second grant");
        };
        assert_eq!(attempt_2, 2);

        let w2_outcome = coordinator.complete(task_id, lease_2).await.unwrap();
        assert!(matches!(w2_outcome, TerminalOutcome::Committed));

        let w1_outcome = coordinator.complete(task_id, lease_1).await.unwrap();
        assert!(matches!(w1_outcome, TerminalOutcome::Cancelled));
    }

    #[tokio::test]
    async fn retry_on_failure_then_success_s4() {
        let dir = tempdir().unwrap();
        let (coordinator, _) = Coordinator::open(config(dir.path())).unwrap();

        let task_id = coordinator
            .submit_task(b"p".to_vec(), 300, RetryPolicy { max_attempts: 2 }, None)
            .await
            .unwrap();

        let LeaseOutcome::Granted { lease_id: lease_1, .. } = coordinator.request_lease("w1").await.unwrap() else {
            panic!("expected grant");
        };
        let outcome = coordinator.fail(task_id, lease_1, "oom".into()).await.unwrap();
        assert!(matches!(outcome, TerminalOutcome::Committed));

        let LeaseOutcome::Granted {
            lease_id: lease_2,
            attempt,
            ..
        } = coordinator.request_lease("w2").await.unwrap()
        else {
            panic!("expected second grant");
        };
        assert_eq!(attempt, 2);
        let outcome = coordinator.complete(task_id, lease_2).await.unwrap();
        assert!(matches!(outcome, TerminalOutcome::Committed));
    }

    #[tokio::test]
    async fn restart_replays_in_flight_lease() {
        let dir = tempdir().unwrap();
        let task_id;
        let lease_id;
        {
            let (coordinator, _) = Coordinator::open(config(dir.path())).unwrap();
            task_id = coordinator
                .submit_task(b"p".to_vec(), 300, RetryPolicy::none(), None)
                .await
                .unwrap();
            let LeaseOutcome::Granted { lease_id: l, .. } = coordinator.request_lease("w1").await.unwrap() else {
                panic!("expected grant");
            };
            lease_id = l;
        }

        let (coordinator, stats) = Coordinator::open(config(dir.path())).unwrap();
        assert_eq!(stats.record_count, 2);
        let outcome = coordinator.complete(task_id, lease_id).await.unwrap();
        assert!(matches!(outcome, TerminalOutcome::Committed));
    }
}
