//! Coordination-kernel data model: tasks, leases, the record set, the
//! deterministic applier, lease-grant/expiry decision logic, and the
//! advisory worker registry. No I/O lives here - the WAL crate and the
//! dispatcher crate are the only things that touch a filesystem or a
//! socket.

pub mod error;
pub mod lease;
pub mod metrics;
pub mod model;
pub mod record;
pub mod registry;
pub mod state;

pub use error::{CoreError, CoreResult};
pub use lease::LeaseEngine;
pub use metrics::{Metrics, MetricsSnapshot};
pub use model::{Attempt, Lease, RetryPolicy, Task, TaskState, WorkerState};
pub use record::Record;
pub use registry::WorkerRegistry;
pub use state::StateStore;
