use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::RetryPolicy;

/// The eight record types, as a tagged sum. Each variant carries exactly the
/// fields its apply effect needs; nothing here is reconstructible from a
/// heartbeat, a metric, or any other non-authoritative signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Record {
    TaskCreated {
        task_id: Uuid,
        payload: Vec<u8>,
        execution_window_secs: i64,
        retry_policy: RetryPolicy,
        request_id: Option<String>,
        created_at: DateTime<Utc>,
    },
    LeaseGranted {
        task_id: Uuid,
        lease_id: Uuid,
        worker_id: String,
        attempt: i64,
        lease_expiry: DateTime<Utc>,
        granted_at: DateTime<Utc>,
    },
    LeaseExtended {
        lease_id: Uuid,
        new_lease_expiry: DateTime<Utc>,
    },
    LeaseExpired {
        task_id: Uuid,
        lease_id: Uuid,
    },
    TaskCompleted {
        task_id: Uuid,
        lease_id: Uuid,
    },
    TaskFailed {
        task_id: Uuid,
        lease_id: Uuid,
        failure_reason: String,
    },
    TaskCancelled {
        task_id: Uuid,
        lease_id: Uuid,
    },
    TaskDead {
        task_id: Uuid,
        reason: String,
    },
}

impl Record {
    /// Normative wire tag per the on-disk record set.
    pub fn type_tag(&self) -> u8 {
        match self {
            Record::TaskCreated { .. } => 1,
            Record::TaskCompleted { .. } => 2,
            Record::TaskFailed { .. } => 3,
            Record::TaskCancelled { .. } => 4,
            Record::LeaseGranted { .. } => 5,
            Record::LeaseExtended { .. } => 6,
            Record::LeaseExpired { .. } => 7,
            Record::TaskDead { .. } => 8,
        }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            Record::TaskCreated { task_id, .. }
            | Record::LeaseGranted { task_id, .. }
            | Record::LeaseExpired { task_id, .. }
            | Record::TaskCompleted { task_id, .. }
            | Record::TaskFailed { task_id, .. }
            | Record::TaskCancelled { task_id, .. }
            | Record::TaskDead { task_id, .. } => *task_id,
            Record::LeaseExtended { .. } => {
                unreachable!("LeaseExtended is looked up by lease_id, not task_id")
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Record::TaskCreated { .. } => "TaskCreated",
            Record::LeaseGranted { .. } => "LeaseGranted",
            Record::LeaseExtended { .. } => "LeaseExtended",
            Record::LeaseExpired { .. } => "LeaseExpired",
            Record::TaskCompleted { .. } => "TaskCompleted",
            Record::TaskFailed { .. } => "TaskFailed",
            Record::TaskCancelled { .. } => "TaskCancelled",
            Record::TaskDead { .. } => "TaskDead",
        }
    }

    /// Byte-deterministic payload encoding. The type tag is framed separately
    /// by the WAL; this is just the variant's field set.
    pub fn encode_payload(&self) -> Vec<u8> {
        bincode::serialize(self).expect("record payload encoding is infallible")
    }

    pub fn decode_payload(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_match_normative_numbers() {
        let now = Utc::now();
        assert_eq!(
            Record::TaskCreated {
                task_id: Uuid::nil(),
                payload: vec![],
                execution_window_secs: 30,
                retry_policy: RetryPolicy::none(),
                request_id: None,
                created_at: now,
            }
            .type_tag(),
            1
        );
        assert_eq!(
            Record::TaskCompleted {
                task_id: Uuid::nil(),
                lease_id: Uuid::nil(),
            }
            .type_tag(),
            2
        );
        assert_eq!(
            Record::TaskFailed {
                task_id: Uuid::nil(),
                lease_id: Uuid::nil(),
                failure_reason: "x".into(),
            }
            .type_tag(),
            3
        );
        assert_eq!(
            Record::TaskCancelled {
                task_id: Uuid::nil(),
                lease_id: Uuid::nil(),
            }
            .type_tag(),
            4
        );
        assert_eq!(
            Record::LeaseGranted {
                task_id: Uuid::nil(),
                lease_id: Uuid::nil(),
                worker_id: "w".into(),
                attempt: 1,
                lease_expiry: now,
                granted_at: now,
            }
            .type_tag(),
            5
        );
        assert_eq!(
            Record::LeaseExtended {
                lease_id: Uuid::nil(),
                new_lease_expiry: now,
            }
            .type_tag(),
            6
        );
        assert_eq!(
            Record::LeaseExpired {
                task_id: Uuid::nil(),
                lease_id: Uuid::nil(),
            }
            .type_tag(),
            7
        );
        assert_eq!(
            Record::TaskDead {
                task_id: Uuid::nil(),
                reason: "x".into(),
            }
            .type_tag(),
            8
        );
    }

    #[test]
    fn payload_round_trips() {
        let rec = Record::LeaseGranted {
            task_id: Uuid::new_v4(),
            lease_id: Uuid::new_v4(),
            worker_id: "worker-1".into(),
            attempt: 3,
            lease_expiry: Utc::now(),
            granted_at: Utc::now(),
        };
        let bytes = rec.encode_payload();
        let back = Record::decode_payload(&bytes).expect("decode");
        assert_eq!(rec.type_tag(), back.type_tag());
        assert_eq!(rec.task_id(), back.task_id());
    }
}
