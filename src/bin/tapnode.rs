//! Demo node: run a synchronized tap-list database from the command line.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tapsync::{SyncConfig, SyncedDb};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tapnode")]
#[command(about = "Run a peer-synchronized tap-list database node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a node until interrupted
    Run {
        /// Path to the SQLite database file
        #[arg(short, long)]
        db: PathBuf,

        /// UDP broadcast port shared by all nodes
        #[arg(short, long, default_value_t = 5002)]
        broadcast_port: u16,

        /// TCP sync port unique to this node
        #[arg(short, long, default_value_t = 5003)]
        sync_port: u16,

        /// Peers to add manually, e.g. "192.168.1.20:5003" (comma-separated)
        #[arg(short, long, default_value = "")]
        peers: String,
    },
    /// Insert a beer into a node's database and notify peers
    AddBeer {
        /// Path to the SQLite database file
        #[arg(short, long)]
        db: PathBuf,

        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        abv: Option<f64>,

        #[arg(long)]
        description: Option<String>,

        /// UDP broadcast port shared by all nodes
        #[arg(short, long, default_value_t = 5002)]
        broadcast_port: u16,

        /// TCP sync port unique to this node
        #[arg(short, long, default_value_t = 5003)]
        sync_port: u16,
    },
}

fn parse_peers(spec: &str) -> Result<Vec<(IpAddr, u16)>> {
    let mut peers = Vec::new();
    for part in spec.split(',').filter(|p| !p.is_empty()) {
        let (addr, port) = part
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("peer spec {part:?} is not addr:port"))?;
        peers.push((addr.parse()?, port.parse()?));
    }
    Ok(peers)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            db,
            broadcast_port,
            sync_port,
            peers,
        } => {
            let peers = parse_peers(&peers)?;
            let mut config = SyncConfig::new(db);
            config.broadcast_port = broadcast_port;
            config.sync_port = sync_port;
            let node = SyncedDb::start(config).await?;

            for (addr, port) in peers {
                if let Err(e) = node.add_peer(addr, port).await {
                    tracing::warn!("could not pull from manual peer {addr}:{port}: {e:#}");
                }
            }

            info!("node running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            node.stop().await;
        }
        Commands::AddBeer {
            db,
            name,
            abv,
            description,
            broadcast_port,
            sync_port,
        } => {
            let mut config = SyncConfig::new(db);
            config.broadcast_port = broadcast_port;
            config.sync_port = sync_port;
            let node = SyncedDb::start(config).await?;
            let id = node.add_beer(&name, abv, description.as_deref()).await?;
            info!("added beer {name:?} with id {id}");
            node.stop().await;
        }
    }
    Ok(())
}
