//! Node binary: flag parsing, config resolution, and the serve loop.
//!
//! Precedence: CLI flags over `AVID_*` environment variables over the TOML
//! file over defaults. Fatal startup failures (bind, KV open, datadir)
//! exit non-zero; an orderly ctrl-c shutdown flushes evidence and exits 0.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use avidfp_common::config::{Config, ConfigError};
use avidfp_proto::DispersalServer;
use avidfp_storage::kv::unix_millis_now;
use avidfp_storage::{FragmentError, FragmentStore, Gc, KvError, MetaDb};

use avidfp_node::gossip::Gossip;
use avidfp_node::metrics::{serve_metrics, NodeMetrics};
use avidfp_node::service::{warm_up, DispersalService, DEFAULT_DISPERSE_TIMEOUT};
use avidfp_node::state::NodeState;

#[derive(Parser, Debug, Default)]
#[command(name = "avidfp-node", version, about = "AVID-FP object store node")]
pub struct NodeArgs {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Inbound gRPC port
    #[arg(long)]
    pub port: Option<u16>,

    /// Data fragment count (m)
    #[arg(long)]
    pub m: Option<usize>,

    /// Total fragment count (n)
    #[arg(long)]
    pub n: Option<usize>,

    /// Comma-separated host:port cluster peers
    #[arg(long, value_delimiter = ',')]
    pub peers: Option<Vec<String>>,

    /// This node's cluster identity (defaults to localhost:<port>)
    #[arg(long)]
    pub self_addr: Option<String>,

    /// Durable KV file path
    #[arg(long)]
    pub db: Option<String>,

    /// Fragment directory root
    #[arg(long)]
    pub datadir: Option<String>,

    /// Object TTL before garbage collection (e.g. 24h, 90s)
    #[arg(long)]
    pub ttl: Option<String>,

    /// Prometheus metrics HTTP port
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
enum NodeError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("kv: {0}")]
    Kv(#[from] KvError),

    #[error("fragments: {0}")]
    Fragment(#[from] FragmentError),

    #[error("transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn run() -> i32 {
    let args = NodeArgs::parse();
    init_tracing();

    let cfg = match resolve_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return 2;
        }
    };

    match serve(cfg).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "node failed");
            1
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Merge defaults, TOML file, environment, and CLI flags (highest wins).
pub fn resolve_config(args: &NodeArgs) -> Result<Config, ConfigError> {
    let mut cfg = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    cfg.apply_env()?;

    if let Some(port) = args.port {
        cfg.server.grpc_port = port;
    }
    if let Some(m) = args.m {
        cfg.erasure.data = m;
    }
    if let Some(n) = args.n {
        cfg.erasure.total = n;
    }
    if let Some(peers) = &args.peers {
        cfg.cluster.peers = peers.clone();
    }
    if let Some(self_addr) = &args.self_addr {
        cfg.cluster.self_addr = Some(self_addr.clone());
    }
    if let Some(db) = &args.db {
        cfg.storage.db = Some(db.clone());
    }
    if let Some(datadir) = &args.datadir {
        cfg.storage.datadir = datadir.clone();
    }
    if let Some(ttl) = &args.ttl {
        cfg.object.ttl = ttl.clone();
    }
    if let Some(metrics_port) = args.metrics_port {
        cfg.server.metrics_port = metrics_port;
    }

    cfg.finalize();
    cfg.validate()?;
    Ok(cfg)
}

async fn serve(cfg: Config) -> Result<(), NodeError> {
    let m = cfg.erasure.data;
    let n = cfg.erasure.total;
    let ttl = cfg.ttl()?;
    let self_id = cfg.self_addr().to_string();

    let kv = Arc::new(MetaDb::open(cfg.db_path())?);
    let fragments = Arc::new(FragmentStore::new(&cfg.storage.datadir)?);

    let state = Arc::new(NodeState::new(self_id.clone(), m, n));
    warm_up(&state, &kv)?;

    let metrics = Arc::new(NodeMetrics::new());
    let shutdown = Arc::new(Notify::new());

    {
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        let port = cfg.server.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(metrics, port, shutdown).await {
                warn!(error = %e, "metrics server failed");
            }
        });
    }

    let gossip = Gossip::new(cfg.cluster.peers.clone(), self_id.clone());
    let service = DispersalService::new(
        state.clone(),
        kv.clone(),
        fragments.clone(),
        gossip,
        metrics.clone(),
        DEFAULT_DISPERSE_TIMEOUT,
    );

    {
        let gc = Gc::new(kv.clone(), fragments.clone(), ttl);
        let state = state.clone();
        let shutdown = shutdown.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(gc.interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // the first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let stats = gc.sweep_once(unix_millis_now());
                        for object in &stats.expired {
                            state.drop_object(object);
                        }
                        metrics.record_gc_removed(stats.expired.len() as u64);
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.notify_waiters();
            }
        });
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.grpc_port));
    info!(
        %addr,
        self_id = %self_id,
        m,
        n,
        f = n - m,
        peers = ?cfg.cluster.peers,
        metrics_port = cfg.server.metrics_port,
        "node listening"
    );

    let server_shutdown = shutdown.clone();
    Server::builder()
        .add_service(DispersalServer::new(service.clone()))
        .serve_with_shutdown(addr, async move {
            server_shutdown.notified().await;
        })
        .await?;

    service.flush_evidence().await;
    info!("node stopped");
    Ok(())
}
