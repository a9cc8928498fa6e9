use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::sync::watch;

use rkv_consensus::{start, RaftConfig, RaftHandle};
use rkv_server::{serve_client, serve_cluster, GrpcTransport};
use rkv_storage::{FjallKvStore, FjallLogStorage, FjallStore, MemLogStorage};
use rkv_txn::{
    FallbackConfig, FallbackKvDatabase, LinearizablePolicy, RaftKvDatabase, ReconcilePolicy, RetryPolicy,
    StandaloneKvDatabase,
};
use rkv_types::{ClusterConfig, NodeId};

#[derive(clap::Parser, Debug)]
#[command(name = "rkv-node", about = "Replicated transactional key-value node")]
struct Cli {
    #[arg(long)]
    node_id: NodeId,
    #[arg(long, default_value = "0.0.0.0:17000")]
    client_addr: String,
    #[arg(long, default_value = "0.0.0.0:17001")]
    cluster_addr: String,
    /// Cluster address other members use to reach this node. Defaults to
    /// --cluster-addr.
    #[arg(long)]
    advertise_addr: Option<String>,
    /// Peer specs: "id=addr" format, repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,
    /// Start without membership and wait to be added by the leader.
    #[arg(long, conflicts_with = "peers")]
    join: bool,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides storage.data_dir.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
    engine: String,
}

#[derive(Debug, Deserialize)]
struct RaftSection {
    heartbeat_interval_ms: u64,
    election_timeout_min_ms: u64,
    election_timeout_max_ms: u64,
    rpc_timeout_ms: u64,
    lease_timeout_ms: u64,
    commit_timeout_ms: u64,
    max_append_entries: usize,
    snapshot_threshold: u64,
    snapshot_chunk_bytes: usize,
    history_retention: u64,
    backoff_initial_ms: u64,
    backoff_max_ms: u64,
    forward_attempts: u32,
}

impl RaftSection {
    fn to_raft_config(&self, node_id: NodeId) -> RaftConfig {
        RaftConfig {
            node_id,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(self.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_max_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            lease_timeout: Duration::from_millis(self.lease_timeout_ms),
            commit_timeout: Duration::from_millis(self.commit_timeout_ms),
            max_append_entries: self.max_append_entries,
            snapshot_threshold: self.snapshot_threshold,
            snapshot_chunk_bytes: self.snapshot_chunk_bytes,
            history_retention: self.history_retention,
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            forward_attempts: self.forward_attempts,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TransactionsConfig {
    retry_max_attempts: u32,
    retry_initial_backoff_ms: u64,
    retry_max_backoff_ms: u64,
}

#[derive(Debug, Deserialize)]
struct FallbackSection {
    enabled: bool,
    check_interval_ms: u64,
    probe_timeout_ms: u64,
    min_unavailable_ms: u64,
    min_available_ms: u64,
    reconcile: ReconcilePolicy,
    standalone_linearizable: LinearizablePolicy,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    raft: RaftSection,
    transactions: TransactionsConfig,
    fallback: FallbackSection,
    server: ServerConfig,
    observability: ObservabilityConfig,
}

fn parse_peer(spec: &str) -> anyhow::Result<(NodeId, String)> {
    let (id, addr) = spec
        .split_once('=')
        .with_context(|| format!("invalid peer {spec:?}, expected id=addr"))?;
    let id = id.trim().parse().with_context(|| format!("invalid peer id in {spec:?}"))?;
    Ok((id, addr.trim().to_string()))
}

/// Resolves once the shutdown flag is raised.
async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("RKV_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    let log_format = config.observability.log_format.as_str();
    match log_format {
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

    let client_addr: SocketAddr = cli
        .client_addr
        .parse()
        .with_context(|| format!("invalid client_addr: {}", cli.client_addr))?;
    let cluster_addr: SocketAddr = cli
        .cluster_addr
        .parse()
        .with_context(|| format!("invalid cluster_addr: {}", cli.cluster_addr))?;
    let advertise = cli.advertise_addr.clone().unwrap_or_else(|| cli.cluster_addr.clone());

    let raft_config = config.raft.to_raft_config(cli.node_id);
    raft_config.validate().context("invalid [raft] configuration")?;

    let initial = if cli.join {
        ClusterConfig::default()
    } else {
        let mut members = cli.peers.iter().map(|p| parse_peer(p)).collect::<anyhow::Result<Vec<_>>>()?;
        members.push((cli.node_id, advertise.clone()));
        ClusterConfig::new(members)
    };

    tracing::info!(
        node_id = cli.node_id,
        client_addr = %client_addr,
        cluster_addr = %cluster_addr,
        advertise = %advertise,
        members = initial.members.len(),
        join = cli.join,
        "node starting"
    );

    let transport = GrpcTransport::new(cli.node_id, Duration::from_millis(config.server.connect_timeout_ms));
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.storage.data_dir.clone());
    let (raft, standalone): (RaftHandle, StandaloneKvDatabase) = match config.storage.engine.as_str() {
        "fjall" => {
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
            let store = FjallStore::open(&data_dir)
                .with_context(|| format!("failed to open storage at {}", data_dir.display()))?;
            let raft = start(raft_config, initial, FjallLogStorage(store.clone()), transport)
                .await
                .context("failed to start consensus")?;
            let standalone = StandaloneKvDatabase::open(FjallKvStore(store))
                .await
                .context("failed to open standalone store")?;
            (raft, standalone)
        }
        "memory" => {
            let raft = start(raft_config, initial, MemLogStorage::new(), transport)
                .await
                .context("failed to start consensus")?;
            (raft, StandaloneKvDatabase::in_memory())
        }
        other => anyhow::bail!("unknown storage engine {other:?}, expected \"fjall\" or \"memory\""),
    };

    let fb = &config.fallback;
    let fallback_config = FallbackConfig {
        check_interval: Duration::from_millis(fb.check_interval_ms),
        probe_timeout: Duration::from_millis(fb.probe_timeout_ms),
        min_unavailable: Duration::from_millis(fb.min_unavailable_ms),
        min_available: Duration::from_millis(fb.min_available_ms),
        reconcile: fb.reconcile,
        standalone_linearizable: fb.standalone_linearizable,
    };
    let raft_db = RaftKvDatabase::new(raft.clone());
    let (db, monitor) = if fb.enabled {
        let db = FallbackKvDatabase::open(raft_db, standalone, fallback_config).await;
        let monitor = db.spawn_monitor();
        (db, Some(monitor))
    } else {
        (FallbackKvDatabase::new(raft_db, standalone, fallback_config), None)
    };

    let tx = &config.transactions;
    let retry = RetryPolicy {
        max_attempts: tx.retry_max_attempts,
        initial_backoff: Duration::from_millis(tx.retry_initial_backoff_ms),
        max_backoff: Duration::from_millis(tx.retry_max_backoff_ms),
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        let _ = stop_tx.send(true);
    });

    let served = tokio::try_join!(
        serve_client(client_addr, db.clone(), retry, shutdown_signal(stop_rx.clone())),
        serve_cluster(cluster_addr, raft.clone(), db, shutdown_signal(stop_rx)),
    );

    if let Some(monitor) = monitor {
        monitor.abort();
    }
    raft.shutdown();
    served?;
    tracing::info!(node_id = cli.node_id, "node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_parse_as_id_and_addr() {
        assert_eq!(parse_peer("2=10.0.0.2:17001").unwrap(), (2, "10.0.0.2:17001".to_string()));
        assert_eq!(parse_peer(" 3 = host:1 ").unwrap(), (3, "host:1".to_string()));
        assert!(parse_peer("10.0.0.2:17001").is_err());
        assert!(parse_peer("x=host:1").is_err());
    }

    #[test]
    fn default_config_is_complete_and_valid() {
        let config: Config = Figment::new()
            .merge(Toml::string(include_str!("../../../config/default.toml")))
            .extract()
            .unwrap();
        config.raft.to_raft_config(1).validate().unwrap();
        assert_eq!(config.fallback.reconcile, ReconcilePolicy::Discard);
        assert_eq!(config.fallback.standalone_linearizable, LinearizablePolicy::Reject);
        assert!(config.fallback.enabled);
    }

    #[test]
    fn environment_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("RKV_RAFT__HEARTBEAT_INTERVAL_MS", "25");
            jail.set_env("RKV_FALLBACK__RECONCILE", "resync");
            let config: Config = Figment::new()
                .merge(Toml::string(include_str!("../../../config/default.toml")))
                .merge(Env::prefixed("RKV_").split("__"))
                .extract()?;
            assert_eq!(config.raft.heartbeat_interval_ms, 25);
            assert_eq!(config.fallback.reconcile, ReconcilePolicy::Resync);
            Ok(())
        });
    }
}
