use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for the coordination kernel. Variant names mirror the
/// design-level taxonomy rather than any particular wire status code; the
/// dispatcher layer maps these onto COMMITTED/CANCELLED/REJECTED and
/// transport-level failures.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authority loss: lease {lease_id} is not current for task {task_id}")]
    AuthorityLoss { task_id: Uuid, lease_id: Uuid },

    #[error("precondition violation: {0}")]
    PreconditionViolation(String),

    #[error("durability error: {0}")]
    Durability(#[from] anyhow::Error),

    #[error("corruption error: {0}")]
    Corruption(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
