//! kestreld — the per-node PostgreSQL cluster supervisor.

mod daemon;
mod health;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use kestrel_cluster::failover::apply_failover;
use kestrel_cluster::{find_best_replica, write_cluster_status_if_changed};
use kestrel_common::config::{KestrelConfig, StoreBackend};
use kestrel_common::state::{cluster_status_changed, ClusterSpec};
use kestrel_store::{EtcdStore, MemoryStore, StateStore};

/// Identity stamped on statuses written from the CLI rather than a daemon.
const CLI_SOURCE: &str = "kestrel CLI";

#[derive(Parser, Debug)]
#[command(name = "kestreld", about = "kestrel — PostgreSQL cluster supervisor", version)]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "kestrel.toml")]
    config: String,

    /// Name of the Postgres cluster (overrides config).
    #[arg(long, env = "KESTREL_CLUSTER")]
    cluster_name: Option<String>,

    /// Name of this node (overrides config; defaults to the hostname).
    #[arg(long, env = "KESTREL_NODE")]
    node_name: Option<String>,

    /// Store backend: etcd or memory (overrides config).
    #[arg(long, value_parser = parse_backend)]
    store_backend: Option<StoreBackend>,

    /// Store endpoint, host:port (overrides config).
    #[arg(long)]
    store_endpoint: Option<String>,

    /// Leader lease duration in milliseconds (overrides config).
    #[arg(long)]
    lease_duration_ms: Option<u64>,

    /// Wakeup UDP port; 0 disables wakeups (overrides config).
    #[arg(long)]
    wakeup_port: Option<u16>,

    /// PostgreSQL host (overrides config).
    #[arg(long)]
    postgres_host: Option<String>,

    /// PostgreSQL port (overrides config).
    #[arg(long)]
    postgres_port: Option<u16>,

    /// PostgreSQL user (overrides config).
    #[arg(long)]
    postgres_user: Option<String>,

    /// Health HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor daemon indefinitely.
    Daemon,
    /// Fetch the cluster state and pretty-print it as JSON.
    ShowCluster,
    /// Reassign the intended primary via compare-and-swap.
    Failover {
        /// Node to promote. When omitted, the most caught-up replica is
        /// chosen by WAL position.
        #[arg(long)]
        target: Option<String>,
    },
    /// Write the cluster spec (bootstraps the cluster keyspace).
    Init,
}

fn parse_backend(s: &str) -> Result<StoreBackend, String> {
    match s.to_lowercase().as_str() {
        "etcd" => Ok(StoreBackend::Etcd),
        "memory" => Ok(StoreBackend::Memory),
        other => Err(format!("Invalid backend {other:?}: expected etcd or memory")),
    }
}

fn apply_overrides(mut config: KestrelConfig, cli: &Cli) -> KestrelConfig {
    if let Some(ref name) = cli.cluster_name {
        config.cluster.name = name.clone();
    }
    if let Some(ref name) = cli.node_name {
        config.cluster.node_name = name.clone();
    }
    if let Some(backend) = cli.store_backend {
        config.store.backend = backend;
    }
    if let Some(ref endpoint) = cli.store_endpoint {
        config.store.endpoint = endpoint.clone();
    }
    if let Some(ms) = cli.lease_duration_ms {
        config.cluster.lease_duration_ms = ms;
    }
    if let Some(port) = cli.wakeup_port {
        config.wakeup.port = port;
    }
    if let Some(ref host) = cli.postgres_host {
        config.postgres.host = host.clone();
    }
    if let Some(port) = cli.postgres_port {
        config.postgres.port = port;
    }
    if let Some(ref user) = cli.postgres_user {
        config.postgres.user = user.clone();
    }
    if let Some(ref addr) = cli.listen {
        config.health.listen_addr = addr.clone();
    }
    config
}

async fn build_store(config: &KestrelConfig) -> Result<Arc<dyn StateStore>> {
    match config.store.backend {
        StoreBackend::Etcd => {
            tracing::info!(endpoint = %config.store.endpoint, "Using etcd store backend");
            let store = EtcdStore::connect(&config.store.endpoint, &config.cluster.name)
                .await
                .context("failed to construct etcd client")?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store backend; state is local to this process");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    kestrel_observability::init_tracing();

    let config = KestrelConfig::load(&cli.config)?;
    let config = apply_overrides(config, &cli).finalize()?;

    let store = build_store(&config).await?;

    match cli.command {
        Command::Daemon => daemon::run(config, store).await,
        Command::ShowCluster => show_cluster(store.as_ref()).await,
        Command::Failover { target } => failover(store.as_ref(), target).await,
        Command::Init => init_cluster(store.as_ref()).await,
    }
}

async fn show_cluster(store: &dyn StateStore) -> Result<()> {
    let state = store
        .fetch_cluster_state()
        .await
        .context("failed to fetch cluster state")?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn failover(store: &dyn StateStore, target: Option<String>) -> Result<()> {
    let state = store
        .fetch_cluster_state()
        .await
        .context("failed to fetch cluster state")?;

    let target = match target {
        Some(name) => {
            if !state.nodes.contains_key(&name) {
                bail!("target node {name:?} is not a member of the cluster");
            }
            name
        }
        None => {
            find_best_replica(&state, &state.status.intended_primary)
                .context("no target given and no promotable replica found")?
                .name
        }
    };

    let new_status = apply_failover(&state.status, &target);
    if !cluster_status_changed(&state.status, &new_status) {
        println!("No change needed, intended primary is already {target}");
        return Ok(());
    }

    let (_, applied) =
        write_cluster_status_if_changed(store, &state.status, new_status, CLI_SOURCE)
            .await
            .context("failed to write cluster status")?;
    if !applied {
        bail!("cluster status changed concurrently; re-run failover");
    }
    println!("Initiated failover to {target}");
    Ok(())
}

async fn init_cluster(store: &dyn StateStore) -> Result<()> {
    store
        .set_cluster_spec(&ClusterSpec::default())
        .await
        .context("failed to write cluster spec")?;
    println!("Cluster spec written");
    Ok(())
}
