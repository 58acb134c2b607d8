use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A non-negative, strictly-increasing-by-one-per-grant attempt counter.
pub type Attempt = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Leased,
    Completed,
    Failed,
    Dead,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Dead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: i64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_attempts: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub payload: Vec<u8>,
    pub execution_window_secs: i64,
    pub retry_policy: RetryPolicy,
    pub state: TaskState,
    pub attempt: Attempt,
    pub current_lease_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub request_id: Option<String>,
}

impl Task {
    pub fn execution_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.execution_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub task_id: Uuid,
    pub worker_id: String,
    pub expiry: DateTime<Utc>,
    pub attempt: Attempt,
}

#[derive(Debug, Clone)]
pub struct WorkerState {
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub active_lease_count: i64,
}
