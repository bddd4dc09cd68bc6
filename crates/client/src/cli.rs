//! Client binary: disperse a file into the cluster or retrieve one back.
//!
//! Peers and erasure geometry come from the same config layering as the
//! node (TOML file, `AVID_*` env, CLI flags, highest wins).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use avidfp_common::config::{Config, ConfigError};

use avidfp_client::ClusterClient;

#[derive(Parser, Debug)]
#[command(name = "avidfp-client", version, about = "AVID-FP object store client")]
pub struct ClientArgs {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Comma-separated host:port cluster peers
    #[arg(long, value_delimiter = ',')]
    pub peers: Option<Vec<String>>,

    /// Data fragment count (m)
    #[arg(long)]
    pub m: Option<usize>,

    /// Total fragment count (n)
    #[arg(long)]
    pub n: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Erasure-code a file and disperse it across the cluster
    Disperse {
        /// Unique object id
        #[arg(long)]
        id: String,
        /// Input file
        #[arg(long)]
        file: PathBuf,
    },
    /// Reassemble an object from the cluster into a file
    Retrieve {
        /// Unique object id
        #[arg(long)]
        id: String,
        /// Output file
        #[arg(long)]
        file: PathBuf,
    },
}

pub async fn run() -> i32 {
    let args = ClientArgs::parse();
    init_tracing();

    let (peers, m, n) = match resolve_cluster(&args) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return 2;
        }
    };
    let client = match ClusterClient::new(peers, m, n) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "invalid cluster geometry");
            return 2;
        }
    };

    match execute(&client, &args.command).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "command failed");
            1
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolve peers and erasure geometry from config layering. The client
/// never appends a self identity, so `Config::finalize` is not used.
pub fn resolve_cluster(args: &ClientArgs) -> Result<(Vec<String>, usize, usize), ConfigError> {
    let mut cfg = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    cfg.apply_env()?;

    if let Some(peers) = &args.peers {
        cfg.cluster.peers = peers.clone();
    }
    if let Some(m) = args.m {
        cfg.erasure.data = m;
    }
    if let Some(n) = args.n {
        cfg.erasure.total = n;
    }

    if cfg.cluster.peers.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "cluster.peers".to_string(),
            value: "need at least one peer via --peers, config, or env".to_string(),
        });
    }
    Ok((cfg.cluster.peers.clone(), cfg.erasure.data, cfg.erasure.total))
}

async fn execute(
    client: &ClusterClient,
    command: &Command,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match command {
        Command::Disperse { id, file } => {
            let blob = tokio::fs::read(file).await?;
            client.disperse(id, &blob).await?;
            info!(object = %id, bytes = blob.len(), "disperse complete");
            Ok(())
        }
        Command::Retrieve { id, file } => {
            let blob = client.retrieve(id).await?;
            tokio::fs::write(file, &blob).await?;
            info!(object = %id, bytes = blob.len(), path = %file.display(), "retrieve complete");
            Ok(())
        }
    }
}
