//! Coordinator binding: configuration, the single-serialization-point
//! `Coordinator`, and the HTTP surface that exposes it to workers and
//! clients.

pub mod config;
pub mod dispatcher;
pub mod http;

pub use config::DispatcherConfig;
pub use dispatcher::{
    Coordinator, DispatchError, DispatchResult, HeartbeatOutcome, LeaseOutcome, ReplayStats, TerminalOutcome,
};
pub use http::{run_until_ctrl_c, CoordinatorServer};
