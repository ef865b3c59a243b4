use clap::Parser;
use edge_scheduler::config::{Cli, Config};
use edge_scheduler::host::HostProbe;
use edge_scheduler::Node;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let probe = HostProbe::new();
    let config = Config::load(&cli.config, probe.core_count(), probe.total_memory_mib())?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let node = Node::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.shutdown().await;

    Ok(())
}
