use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use nerdd::{Config, Node};

#[derive(Parser, Debug)]
#[command(name = "nerdd")]
#[command(author, version, about = "peer-to-peer content distribution daemon")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log filter, e.g. "info" or "nerdd=debug".
    #[arg(short, long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&args.config).context("loading configuration")?;
    info!(
        port = config.port,
        dht = config.enable_dht,
        tracker = config.enable_tracker,
        payments = config.enable_bsv,
        "nerdd starting"
    );

    let node = Node::new(config).await.context("initializing node")?;
    node.run().await.context("running node")?;

    Ok(())
}
