use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Mandatory observable signals. These are plain counters updated under the
/// same serialization point as everything else; a telemetry collaborator
/// reads a snapshot, it never mutates one.
#[derive(Default)]
pub struct Metrics {
    lease_expirations: AtomicU64,
    duplicate_executions: AtomicU64,
    retries: AtomicU64,
    coordinator_restarts: AtomicU64,
    last_replay_duration_micros: AtomicI64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub leased_task_count: u64,
    pub lease_expiration_count: u64,
    pub duplicate_execution_count: u64,
    pub retry_count: u64,
    pub coordinator_restart_count: u64,
    pub last_replay_duration_micros: i64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lease_expiration(&self) {
        self.lease_expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_execution(&self) {
        self.duplicate_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coordinator_restart(&self) {
        self.coordinator_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_duration(&self, duration: std::time::Duration) {
        self.last_replay_duration_micros
            .store(duration.as_micros().min(i64::MAX as u128) as i64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, leased_task_count: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            leased_task_count,
            lease_expiration_count: self.lease_expirations.load(Ordering::Relaxed),
            duplicate_execution_count: self.duplicate_executions.load(Ordering::Relaxed),
            retry_count: self.retries.load(Ordering::Relaxed),
            coordinator_restart_count: self.coordinator_restarts.load(Ordering::Relaxed),
            last_replay_duration_micros: self.last_replay_duration_micros.load(Ordering::Relaxed),
        }
    }
}
