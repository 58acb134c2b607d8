use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::record::Record;
use crate::registry::WorkerRegistry;
use crate::state::StateStore;

/// Pure decision logic: given the current state and registry, decide what a
/// lease grant *would* look like. Never mutates anything; the dispatcher is
/// responsible for appending and applying the candidate it returns.
pub struct LeaseEngine;

impl LeaseEngine {
    /// Selects the oldest waiting task (FIFO by `created_at`, ties broken by
    /// `task_id` ascending via the StateStore's own ordering) and constructs
    /// a candidate `LeaseGranted`. Returns `None` if there is no waiting work.
    pub fn select_grant(
        store: &StateStore,
        _registry: &WorkerRegistry,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Record> {
        let task_id = store.next_waiting_task()?;
        let task = store.task(task_id)?;
        let lease_id = Uuid::new_v4();
        let lease_expiry = now + task.execution_window();
        Some(Record::LeaseGranted {
            task_id,
            lease_id,
            worker_id: worker_id.to_string(),
            attempt: task.attempt + 1,
            lease_expiry,
            granted_at: now,
        })
    }

    /// Returns every lease whose `expiry <= now`, as logical `LeaseExpired`
    /// candidates for the dispatcher to append one at a time through the
    /// same serialization point as any other write.
    pub fn expire_candidates(store: &StateStore, now: DateTime<Utc>) -> Vec<Record> {
        store
            .expired_leases(now)
            .into_iter()
            .filter_map(|lease_id| {
                let lease = store.lease(lease_id)?;
                Some(Record::LeaseExpired {
                    task_id: lease.task_id,
                    lease_id,
                })
            })
            .collect()
    }
}
