use std::path::PathBuf;

use clap::Parser;

/// Coordinator configuration knobs. All explicit, all with conservative
/// defaults; nothing is inferred from the environment beyond what `clap`'s
/// `env` feature reads directly.
#[derive(Parser, Clone, Debug)]
pub struct DispatcherConfig {
    /// Path to the write-ahead log file.
    #[arg(long, env = "WARD_WAL_PATH", default_value = "ward.wal")]
    pub wal_path: PathBuf,

    /// Bind address for the coordinator's HTTP server.
    #[arg(long, env = "WARD_BIND_ADDR", default_value = "127.0.0.1:7878")]
    pub bind_addr: String,

    /// Fallback lease duration in seconds, used only when a task's own
    /// `execution_window_secs` cannot be looked up (e.g. a stale lease
    /// referencing an id no longer in the store).
    #[arg(long, env = "WARD_LEASE_DURATION_SECS", default_value_t = 30)]
    pub lease_duration_secs: i64,

    /// Advisory worker heartbeat interval; workers are assumed stale past
    /// three missed intervals. Does not gate lease expiry directly.
    #[arg(long, env = "WARD_HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    pub heartbeat_interval_secs: i64,

    /// Maximum retry attempts applied when a submitted task carries no
    /// explicit retry policy of its own.
    #[arg(long, env = "WARD_MAX_RETRIES", default_value_t = 0)]
    pub max_retries: i64,

    /// Number of WAL appends collected before a forced fsync. `1` syncs on
    /// every append (strongest durability, most syscalls).
    #[arg(long, env = "WARD_SYNC_BATCH_SIZE", default_value_t = 1)]
    pub sync_batch_size: usize,

    /// Maximum time an unsynced batch may sit before the background ticker
    /// forces a sync regardless of `sync_batch_size`.
    #[arg(long, env = "WARD_SYNC_BATCH_INTERVAL_MS", default_value_t = 0)]
    pub sync_batch_interval_ms: u64,

    /// Interval between background lease-expiry scans.
    #[arg(long, env = "WARD_EXPIRY_SCAN_INTERVAL_MS", default_value_t = 1000)]
    pub expiry_scan_interval_ms: u64,
}

impl DispatcherConfig {
    pub fn heartbeat_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_interval_secs)
    }

    pub fn from_env() -> Self {
        Self::parse_from(["ward-coordinator"])
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            wal_path: PathBuf::from("ward.wal"),
            bind_addr: "127.0.0.1:7878".to_string(),
            lease_duration_secs: 30,
            heartbeat_interval_secs: 10,
            max_retries: 0,
            sync_batch_size: 1,
            sync_batch_interval_ms: 0,
            expiry_scan_interval_ms: 1000,
        }
    }
}
