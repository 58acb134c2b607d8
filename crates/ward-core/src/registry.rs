use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::model::WorkerState;

/// Soft, rebuildable map of worker -> heartbeat/lease-count. Advisory only;
/// losing it entirely (e.g. across a restart) cannot violate correctness;
/// it is rebuilt lazily as heartbeats and lease grants arrive again.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerState>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) {
        let mut guard = self.workers.write().expect("worker registry lock poisoned");
        guard
            .entry(worker_id.to_string())
            .and_modify(|w| w.last_heartbeat = now)
            .or_insert(WorkerState {
                worker_id: worker_id.to_string(),
                last_heartbeat: now,
                active_lease_count: 0,
            });
    }

    pub fn adjust_lease_count(&self, worker_id: &str, delta: i64) {
        let mut guard = self.workers.write().expect("worker registry lock poisoned");
        if let Some(worker) = guard.get_mut(worker_id) {
            worker.active_lease_count = (worker.active_lease_count + delta).max(0);
        }
    }

    /// Advisory placement heuristic: is this worker stale relative to a
    /// heartbeat interval? Never consulted for correctness, only to prefer
    /// livelier workers when more than one could take a lease.
    pub fn is_stale(&self, worker_id: &str, now: DateTime<Utc>, heartbeat_interval: chrono::Duration) -> bool {
        let guard = self.workers.read().expect("worker registry lock poisoned");
        match guard.get(worker_id) {
            Some(w) => now - w.last_heartbeat > heartbeat_interval * 3,
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerState> {
        self.workers
            .read()
            .expect("worker registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_then_stale_check() {
        let registry = WorkerRegistry::new();
        let now = Utc::now();
        registry.record_heartbeat("w1", now);
        assert!(!registry.is_stale("w1", now, chrono::Duration::seconds(10)));
        let later = now + chrono::Duration::seconds(31);
        assert!(registry.is_stale("w1", later, chrono::Duration::seconds(10)));
    }

    #[test]
    fn unknown_worker_is_not_stale() {
        let registry = WorkerRegistry::new();
        assert!(!registry.is_stale("ghost", Utc::now(), chrono::Duration::seconds(10)));
    }
}
