use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{Lease, RetryPolicy, Task, TaskState};
use crate::record::Record;

/// In-memory authoritative state. Every field here is rebuilt purely by
/// applying WAL records, in order, from offset zero; nothing in this struct
/// is ever written to independently of `apply`.
#[derive(Debug, Default)]
pub struct StateStore {
    tasks: HashMap<Uuid, Task>,
    leases: HashMap<Uuid, Lease>,
    request_ids: HashMap<String, Uuid>,

    waiting_tasks: BTreeSet<(DateTime<Utc>, Uuid)>,
    leased_tasks: HashMap<Uuid, Uuid>,
    leases_by_expiry: BTreeSet<(DateTime<Utc>, Uuid)>,
    terminal_tasks: HashSet<Uuid>,

    /// `lease_id -> task_id` for every lease ever granted, kept even after
    /// the lease is invalidated. Distinguishes a worker reporting on a lease
    /// that genuinely lost authority (history has it) from one reporting on
    /// a fabricated or unrelated lease_id (history does not).
    lease_history: HashMap<Uuid, Uuid>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, task_id: Uuid) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    pub fn lease(&self, lease_id: Uuid) -> Option<&Lease> {
        self.leases.get(&lease_id)
    }

    pub fn task_id_for_request(&self, request_id: &str) -> Option<Uuid> {
        self.request_ids.get(request_id).copied()
    }

    /// Whether `lease_id` was ever granted for `task_id`, current or not.
    /// Used to tell a late-but-legitimate report (CANCELLED) apart from one
    /// referring to a lease that never existed for this task (REJECTED).
    pub fn was_ever_leased(&self, task_id: Uuid, lease_id: Uuid) -> bool {
        self.lease_history.get(&lease_id) == Some(&task_id)
    }

    pub fn is_current(&self, task_id: Uuid, lease_id: Uuid) -> bool {
        self.tasks
            .get(&task_id)
            .and_then(|t| t.current_lease_id)
            .map(|cur| cur == lease_id)
            .unwrap_or(false)
    }

    /// Oldest waiting task by `created_at`, ties broken by `task_id` ascending.
    pub fn next_waiting_task(&self) -> Option<Uuid> {
        self.waiting_tasks.iter().next().map(|(_, id)| *id)
    }

    pub fn waiting_task_count(&self) -> usize {
        self.waiting_tasks.len()
    }

    pub fn leased_task_count(&self) -> usize {
        self.leased_tasks.len()
    }

    /// Leases with `expiry <= now`, oldest first.
    pub fn expired_leases(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.leases_by_expiry
            .range(..=(now, Uuid::max()))
            .map(|(_, lease_id)| *lease_id)
            .collect()
    }

    /// Apply one record deterministically. `now` is supplied by the caller
    /// (the dispatcher's clock at decision time, or the replay harness' view
    /// of "now" which for replay is simply each record's own embedded
    /// timestamp where relevant), never read from a global clock here.
    pub fn apply(&mut self, record: &Record, now: DateTime<Utc>) -> CoreResult<()> {
        match record {
            Record::TaskCreated {
                task_id,
                payload,
                execution_window_secs,
                retry_policy,
                request_id,
                created_at,
            } => self.apply_task_created(
                *task_id,
                payload.clone(),
                *execution_window_secs,
                *retry_policy,
                request_id.clone(),
                *created_at,
            ),
            Record::LeaseGranted {
                task_id,
                lease_id,
                worker_id,
                attempt,
                lease_expiry,
                ..
            } => self.apply_lease_granted(*task_id, *lease_id, worker_id.clone(), *attempt, *lease_expiry),
            Record::LeaseExtended {
                lease_id,
                new_lease_expiry,
            } => self.apply_lease_extended(*lease_id, *new_lease_expiry),
            Record::LeaseExpired { task_id, lease_id } => {
                self.apply_lease_expired(*task_id, *lease_id)
            }
            Record::TaskCompleted { task_id, lease_id } => {
                self.apply_task_completed(*task_id, *lease_id, now)
            }
            Record::TaskFailed {
                task_id,
                lease_id,
                ..
            } => self.apply_task_failed(*task_id, *lease_id, now),
            Record::TaskCancelled { task_id, lease_id } => {
                self.apply_task_cancelled(*task_id, *lease_id)
            }
            Record::TaskDead { task_id, .. } => self.apply_task_dead(*task_id),
        }
    }

    fn apply_task_created(
        &mut self,
        task_id: Uuid,
        payload: Vec<u8>,
        execution_window_secs: i64,
        retry_policy: RetryPolicy,
        request_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        if self.tasks.contains_key(&task_id) {
            return Err(CoreError::InvariantViolation(format!(
                "TaskCreated precondition violated: task {task_id} already present"
            )));
        }
        let task = Task {
            task_id,
            payload,
            execution_window_secs,
            retry_policy,
            state: TaskState::Waiting,
            attempt: 0,
            current_lease_id: None,
            created_at,
            request_id: request_id.clone(),
        };
        self.waiting_tasks.insert((created_at, task_id));
        if let Some(rid) = request_id {
            self.request_ids.insert(rid, task_id);
        }
        self.tasks.insert(task_id, task);
        Ok(())
    }

    fn apply_lease_granted(
        &mut self,
        task_id: Uuid,
        lease_id: Uuid,
        worker_id: String,
        attempt: i64,
        lease_expiry: DateTime<Utc>,
    ) -> CoreResult<()> {
        let task = self.tasks.get_mut(&task_id).ok_or_else(|| {
            CoreError::InvariantViolation(format!("LeaseGranted for unknown task {task_id}"))
        })?;
        if task.state != TaskState::Waiting {
            return Err(CoreError::InvariantViolation(format!(
                "LeaseGranted precondition violated: task {task_id} not WAITING"
            )));
        }
        if attempt != task.attempt + 1 {
            return Err(CoreError::InvariantViolation(format!(
                "LeaseGranted precondition violated: attempt {attempt} is not task {task_id}'s prior_attempt+1"
            )));
        }
        task.state = TaskState::Leased;
        task.attempt = attempt;
        task.current_lease_id = Some(lease_id);
        self.waiting_tasks.remove(&(task.created_at, task_id));
        self.leased_tasks.insert(task_id, lease_id);
        self.leases_by_expiry.insert((lease_expiry, lease_id));
        self.lease_history.insert(lease_id, task_id);
        self.leases.insert(
            lease_id,
            Lease {
                lease_id,
                task_id,
                worker_id,
                expiry: lease_expiry,
                attempt,
            },
        );
        Ok(())
    }

    fn apply_lease_extended(
        &mut self,
        lease_id: Uuid,
        new_lease_expiry: DateTime<Utc>,
    ) -> CoreResult<()> {
        let lease = self
            .leases
            .get_mut(&lease_id)
            .ok_or_else(|| CoreError::InvariantViolation(format!("LeaseExtended for unknown lease {lease_id}")))?;
        let task_id = lease.task_id;
        if !self
            .tasks
            .get(&task_id)
            .map(|t| t.current_lease_id == Some(lease_id))
            .unwrap_or(false)
        {
            return Err(CoreError::InvariantViolation(format!(
                "LeaseExtended precondition violated: lease {lease_id} is not current"
            )));
        }
        if new_lease_expiry <= lease.expiry {
            return Err(CoreError::InvariantViolation(format!(
                "LeaseExtended precondition violated: new expiry must be strictly later for lease {lease_id}"
            )));
        }
        self.leases_by_expiry.remove(&(lease.expiry, lease_id));
        lease.expiry = new_lease_expiry;
        self.leases_by_expiry.insert((new_lease_expiry, lease_id));
        Ok(())
    }

    fn apply_lease_expired(&mut self, task_id: Uuid, lease_id: Uuid) -> CoreResult<()> {
        let task = self.tasks.get_mut(&task_id).ok_or_else(|| {
            CoreError::InvariantViolation(format!("LeaseExpired for unknown task {task_id}"))
        })?;
        if task.state != TaskState::Leased || task.current_lease_id != Some(lease_id) {
            return Err(CoreError::InvariantViolation(format!(
                "LeaseExpired precondition violated: lease {lease_id} is not current for task {task_id}"
            )));
        }
        task.state = TaskState::Waiting;
        task.current_lease_id = None;
        self.leased_tasks.remove(&task_id);
        self.waiting_tasks.insert((task.created_at, task_id));
        self.invalidate_lease(lease_id);
        Ok(())
    }

    fn apply_task_completed(
        &mut self,
        task_id: Uuid,
        lease_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let task = self.tasks.get_mut(&task_id).ok_or_else(|| {
            CoreError::InvariantViolation(format!("TaskCompleted for unknown task {task_id}"))
        })?;
        if task.state != TaskState::Leased || task.current_lease_id != Some(lease_id) {
            return Err(CoreError::InvariantViolation(format!(
                "TaskCompleted precondition violated: lease {lease_id} is not current for task {task_id}"
            )));
        }
        let lease = self.leases.get(&lease_id);
        if lease.map(|l| l.expiry <= now).unwrap_or(true) {
            return Err(CoreError::InvariantViolation(format!(
                "TaskCompleted precondition violated: lease {lease_id} already expired"
            )));
        }
        task.state = TaskState::Completed;
        task.current_lease_id = None;
        self.leased_tasks.remove(&task_id);
        self.terminal_tasks.insert(task_id);
        self.invalidate_lease(lease_id);
        Ok(())
    }

    fn apply_task_failed(
        &mut self,
        task_id: Uuid,
        lease_id: Uuid,
        _now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let task = self.tasks.get_mut(&task_id).ok_or_else(|| {
            CoreError::InvariantViolation(format!("TaskFailed for unknown task {task_id}"))
        })?;
        if task.state != TaskState::Leased || task.current_lease_id != Some(lease_id) {
            return Err(CoreError::InvariantViolation(format!(
                "TaskFailed precondition violated: lease {lease_id} is not current for task {task_id}"
            )));
        }
        task.current_lease_id = None;
        self.leased_tasks.remove(&task_id);
        if task.attempt < task.retry_policy.max_attempts {
            task.state = TaskState::Waiting;
            self.waiting_tasks.insert((task.created_at, task_id));
        } else {
            task.state = TaskState::Failed;
            self.terminal_tasks.insert(task_id);
        }
        self.invalidate_lease(lease_id);
        Ok(())
    }

    fn apply_task_cancelled(&mut self, task_id: Uuid, lease_id: Uuid) -> CoreResult<()> {
        if !self.tasks.contains_key(&task_id) {
            return Err(CoreError::InvariantViolation(format!(
                "TaskCancelled for unknown task {task_id}"
            )));
        }
        if self
            .tasks
            .get(&task_id)
            .and_then(|t| t.current_lease_id)
            .map(|cur| cur == lease_id)
            .unwrap_or(false)
        {
            return Err(CoreError::InvariantViolation(format!(
                "TaskCancelled precondition violated: lease {lease_id} is still current for task {task_id}"
            )));
        }
        // History only: no state change, no index mutation.
        Ok(())
    }

    fn apply_task_dead(&mut self, task_id: Uuid) -> CoreResult<()> {
        let task = self.tasks.get_mut(&task_id).ok_or_else(|| {
            CoreError::InvariantViolation(format!("TaskDead for unknown task {task_id}"))
        })?;
        if task.state.is_terminal() {
            return Err(CoreError::InvariantViolation(format!(
                "TaskDead precondition violated: task {task_id} already terminal"
            )));
        }
        if let Some(lease_id) = task.current_lease_id.take() {
            self.leased_tasks.remove(&task_id);
            self.invalidate_lease(lease_id);
        } else {
            self.waiting_tasks.remove(&(task.created_at, task_id));
        }
        task.state = TaskState::Dead;
        self.terminal_tasks.insert(task_id);
        Ok(())
    }

    fn invalidate_lease(&mut self, lease_id: Uuid) {
        if let Some(lease) = self.leases.remove(&lease_id) {
            self.leases_by_expiry.remove(&(lease.expiry, lease_id));
        }
    }
}
