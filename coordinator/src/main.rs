use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use ward_dispatcher::{run_until_ctrl_c, DispatcherConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ward=debug")))
        .init();

    let config = DispatcherConfig::parse();
    let addr = config.bind_addr.parse().context("parse bind_addr")?;

    run_until_ctrl_c(config, addr).await
}
