//! Demo worker: polls the coordinator for work, "executes" it (a sleep
//! standing in for real payload execution, which is explicitly out of
//! scope for the coordination kernel), and reports the outcome back.

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use ward_client::{LeaseOutcome, TerminalOutcome, WardClient};

#[derive(Parser, Clone, Debug)]
struct Cli {
    #[arg(long, env = "WARD_COORDINATOR_URL", default_value = "http://127.0.0.1:7878")]
    coordinator_url: String,

    #[arg(long, env = "WARD_WORKER_ID", default_value = "demo-worker")]
    worker_id: String,

    #[arg(long, env = "WARD_WORKER_POLL_MS", default_value_t = 500)]
    poll_interval_ms: u64,

    /// How long a simulated task "execution" takes before reporting back.
    #[arg(long, env = "WARD_WORKER_WORK_MS", default_value_t = 100)]
    work_duration_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ward=debug")))
        .init();

    let cli = Cli::parse();
    let client = WardClient::new(cli.coordinator_url.clone());
    let poll_interval = Duration::from_millis(cli.poll_interval_ms);

    tracing::info!(worker_id = %cli.worker_id, coordinator = %cli.coordinator_url, "worker started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("worker shutting down");
                return Ok(());
            }
            outcome = client.request_lease(&cli.worker_id) => {
                match outcome {
                    Ok(LeaseOutcome::Granted { task_id, lease_id, attempt, payload, .. }) => {
                        tracing::info!(task_id = %task_id, lease_id = %lease_id, attempt, bytes = payload.len(), "lease granted");
                        tokio::time::sleep(Duration::from_millis(cli.work_duration_ms)).await;
                        match client.complete(task_id, lease_id).await {
                            Ok(TerminalOutcome::Committed) => tracing::info!(task_id = %task_id, "task committed"),
                            Ok(TerminalOutcome::Cancelled) => tracing::warn!(task_id = %task_id, "task cancelled (authority lost)"),
                            Ok(TerminalOutcome::Rejected(reason)) => tracing::warn!(task_id = %task_id, reason, "complete rejected"),
                            Err(err) => tracing::error!(task_id = %task_id, error = %err, "complete failed"),
                        }
                    }
                    Ok(LeaseOutcome::NoWork) => {
                        tokio::time::sleep(poll_interval).await;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "request_lease failed");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        }
    }
}
