//! Nelson - a peer-discovery and neighbor-management daemon for an
//! IOTA-style ledger node.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod links;
mod node;

use config::NodeConfig;
use node::Node;

/// Peer-discovery and neighbor-management daemon.
#[derive(Parser, Debug)]
#[command(name = "nelson")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "nelson.toml")]
    config: PathBuf,

    /// Persistent store location
    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Peer-to-peer control port
    #[arg(short, long)]
    port: Option<u16>,

    /// Status API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Status API bind host
    #[arg(long)]
    api_hostname: Option<String>,

    /// Ledger RPC host
    #[arg(long)]
    iri_hostname: Option<String>,

    /// Ledger RPC port
    #[arg(long)]
    iri_port: Option<u16>,

    /// Cycle tick period in seconds
    #[arg(long)]
    cycle_interval: Option<u64>,

    /// Epoch tick period in seconds
    #[arg(long)]
    epoch_interval: Option<u64>,

    /// Beat tick period in seconds
    #[arg(long)]
    beat_interval: Option<u64>,

    /// Default trusted peer URIs (hostname/port/tcp_port/udp_port)
    #[arg(short, long)]
    neighbors: Vec<String>,

    /// Weight peers by connection longevity
    #[arg(long)]
    master: bool,

    /// Permit multiple peers per hostname
    #[arg(long)]
    multi_port: bool,

    /// Use a throwaway store
    #[arg(long)]
    temporary: bool,

    /// Log filter directives (e.g. "debug" or "nelson_node=trace")
    #[arg(long)]
    log_level: Option<String>,
}

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// directives; unparseable directives fall back to info.
fn init_logging(directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load(&args.config, &args)?;

    init_logging(&config.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        p2p_port = config.port,
        api_host = %config.api_hostname,
        api_port = config.api_port,
        ledger_host = %config.iri_hostname,
        ledger_port = config.iri_port,
        data_path = ?config.data_path,
        temporary = config.temporary,
        "Nelson starting"
    );

    let node = Node::new(config)?;

    let mut runner = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.run().await })
    };

    tokio::select! {
        outcome = &mut runner => outcome??,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, stopping");
            node.shutdown().await;
            runner.await??;
        }
    }

    info!("Nelson stopped");
    Ok(())
}
