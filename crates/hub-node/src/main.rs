use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::sync::watch;

use hub_cluster::{ClusterContext, ClusterSettings, InMemoryEngine, Leader};
use hub_server::serve_status;
use hub_store::{CoordinationStore, FjallStore, MemStore, TimeoutStore};

#[derive(clap::Parser, Debug)]
#[command(name = "hub-node", about = "Hub cluster coordination node")]
struct Cli {
    /// Defaults to the advertised address.
    #[arg(long)]
    node_id: Option<String>,
    #[arg(long)]
    listen_addr: Option<String>,
    #[arg(long)]
    advertise_addr: Option<String>,
    /// Pin the leader instead of reading it from the store.
    #[arg(long)]
    leader: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    advertise_addr: String,
}

#[derive(Debug, Deserialize)]
struct StoreConfig {
    backend: String,
    data_dir: String,
    call_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct LeaderConfig {
    static_id: String,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    listen_addr: String,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    node: NodeConfig,
    store: StoreConfig,
    leader: LeaderConfig,
    cluster: ClusterSettings,
    server: ServerConfig,
    observability: ObservabilityConfig,
}

struct NodeSetup {
    node_id: String,
    advertise_addr: String,
    listen_addr: SocketAddr,
    leader: Option<String>,
    settings: ClusterSettings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("HUBCOORD_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let listen = cli.listen_addr.clone().unwrap_or(config.server.listen_addr);
    let listen_addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen_addr: {listen}"))?;
    let advertise_addr = cli
        .advertise_addr
        .clone()
        .or_else(|| Some(config.node.advertise_addr).filter(|a| !a.is_empty()))
        .unwrap_or_else(|| listen.clone());
    let leader = cli
        .leader
        .clone()
        .or_else(|| Some(config.leader.static_id).filter(|l| !l.is_empty()));

    let setup = NodeSetup {
        node_id: cli.node_id.clone().unwrap_or_else(|| advertise_addr.clone()),
        advertise_addr,
        listen_addr,
        leader,
        settings: config.cluster,
    };

    tracing::info!(
        node_id = %setup.node_id,
        advertise_addr = %setup.advertise_addr,
        listen_addr = %setup.listen_addr,
        backend = %config.store.backend,
        leader = ?setup.leader,
        "node starting"
    );

    let call_timeout = Duration::from_millis(config.store.call_timeout_ms);
    match config.store.backend.as_str() {
        "memory" => run(TimeoutStore::new(MemStore::new(), call_timeout), setup).await,
        "fjall" => {
            let data_dir = cli.data_dir.unwrap_or_else(|| PathBuf::from(&config.store.data_dir));
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;
            let store = FjallStore::open(&data_dir)
                .with_context(|| format!("cannot open store at {}", data_dir.display()))?;
            run(TimeoutStore::new(store, call_timeout), setup).await
        }
        other => anyhow::bail!("unknown store backend '{other}' (expected memory or fjall)"),
    }
}

async fn run<S: CoordinationStore>(store: S, setup: NodeSetup) -> anyhow::Result<()> {
    let store = Arc::new(store);
    let leader = match setup.leader {
        Some(id) => Leader::fixed(Some(id)),
        None => Leader::from_store(store.clone()),
    };
    let ctx = Arc::new(
        ClusterContext::new(
            store,
            Arc::new(InMemoryEngine::new()),
            setup.node_id,
            setup.advertise_addr,
            leader,
            setup.settings,
        )
        .context("invalid cluster configuration")?,
    );
    ctx.start().await.context("failed to join the cluster")?;

    let (tx, rx) = watch::channel(false);
    let tasks = ctx.spawn_background(rx.clone());

    let shutdown = async move {
        tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
        tracing::info!("shutdown requested");
        let _ = tx.send(true);
        Ok::<_, anyhow::Error>(())
    };

    tokio::try_join!(serve_status(setup.listen_addr, ctx.clone(), rx), shutdown)?;

    for task in tasks {
        task.await.context("background task panicked")?;
    }
    ctx.shutdown().await.context("failed to leave the cluster cleanly")?;
    Ok(())
}
