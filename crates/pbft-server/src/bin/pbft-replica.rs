//! PBFT replica daemon.
//!
//! ```bash
//! # Generate this node's keys and print the public halves for the cluster file
//! pbft-replica keygen --out ./keys
//!
//! # Run replica 0 of the cluster described by cluster.toml
//! pbft-replica run --config cluster.toml --index 0 --metrics 127.0.0.1:9100
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pbft_config::{ConfigLoader, NodeKeys};
use pbft_core::ReplicaState;
use pbft_server::{KvStore, ReplicaNode, UdpTransport};
use pbft_types::{PrincipalId, ReplicaId};

/// PBFT replica hosting a replicated key-value store.
#[derive(Parser)]
#[command(name = "pbft-replica")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a replica.
    Run {
        /// Cluster file. Defaults to pbft.toml in the current directory.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// This replica's index in the cluster file.
        #[arg(short, long)]
        index: u32,

        /// Serve Prometheus metrics on this address.
        #[arg(short, long)]
        metrics: Option<SocketAddr>,
    },

    /// Generate a signing key and a key-exchange secret.
    Keygen {
        /// Directory to write the key files into.
        #[arg(short, long, default_value = "keys")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            index,
            metrics,
        } => run(config, index, metrics),
        Commands::Keygen { out } => keygen(&out),
    }
}

fn run(config: Option<PathBuf>, index: u32, metrics: Option<SocketAddr>) -> Result<()> {
    let loader = match &config {
        Some(file) => ConfigLoader::new().with_file(file),
        None => ConfigLoader::new(),
    };
    let cluster_file = loader.load().context("loading cluster configuration")?;

    let me = PrincipalId::Replica(ReplicaId::new(index));
    let replica_config = cluster_file.replica_config()?;
    let keys = cluster_file
        .load_keyring(me)
        .with_context(|| format!("loading keys for {me}"))?;
    let transport = UdpTransport::bind(me, keys.principals())?;

    let state = ReplicaState::new(replica_config, keys, KvStore::new());
    let mut node = ReplicaNode::new(
        state,
        transport,
        cluster_file.node.task_queue_capacity,
        metrics,
    )?;
    node.run()?;
    Ok(())
}

fn keygen(out: &std::path::Path) -> Result<()> {
    let keys = NodeKeys::generate();
    let (signing, exchange) = keys.write(out)?;
    tracing::info!(signing = %signing.display(), exchange = %exchange.display(), "keys written");

    println!("signing_key = \"{}\"", keys.verifying_key_hex());
    println!("exchange_key = \"{}\"", keys.exchange_key_hex());
    Ok(())
}
