//! The IPAM daemon.
//!
//! Start order: tracing → config → metrics → mapping store → pool → RSM
//! (log store, state machine, raft core, peer RPC server) → allocation
//! service. Shutdown runs the same chain in reverse on SIGINT/SIGTERM,
//! draining in-flight requests before the consensus core closes.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use openraft::{BasicNode, Config, Raft};
use tracing::{info, warn};

use tamarack::config::DaemonConfig;
use tamarack::metrics::{IpamMetrics, MetricsCollector, MetricsServer, COLLECT_INTERVAL};
use tamarack::pool::Pool;
use tamarack::raft::network::TcpRaftNetworkFactory;
use tamarack::raft::node::RaftNode;
use tamarack::raft::server::RaftRpcServer;
use tamarack::raft::storage::{IpamStateMachine, RedbLogStore};
use tamarack::raft::types::NodeId;
use tamarack::server::{AllocationService, ServiceServer};
use tamarack::store::MappingStore;

#[derive(Debug, Parser)]
#[command(name = "tamarack-node", about = "Replicated IPAM daemon")]
struct Args {
    /// Unique raft node id. Overrides IPAM_NODE_ID.
    #[arg(long)]
    node_id: Option<NodeId>,

    /// Raft peer RPC bind address. Overrides IPAM_RAFT_BIND.
    #[arg(long)]
    raft_bind: Option<String>,

    /// Peer map, e.g. `1=host-a:4710,2=host-b:4710`. Overrides IPAM_RAFT_PEERS.
    #[arg(long)]
    peers: Option<String>,

    /// Bootstrap a fresh single-node cluster.
    #[arg(long)]
    bootstrap: bool,

    /// Cluster CIDR carved into node blocks. Overrides IPAM_CLUSTER_CIDR.
    #[arg(long)]
    cluster_cidr: Option<String>,

    /// Node block prefix length. Overrides IPAM_BLOCK_PREFIX.
    #[arg(long)]
    block_prefix: Option<u8>,

    /// Allocation service TCP bind address. Overrides IPAM_SERVICE_BIND.
    #[arg(long)]
    service_bind: Option<String>,

    /// Allocation service unix socket path. Overrides IPAM_SERVICE_SOCKET.
    #[arg(long)]
    unix_socket: Option<String>,

    /// Data directory for the mapping store. Overrides IPAM_DATA_DIR.
    #[arg(long)]
    data_dir: Option<String>,

    /// Metrics exporter bind address. Overrides IPAM_METRICS_BIND.
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Disable the container-to-IP mapping store.
    #[arg(long)]
    no_store: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = DaemonConfig::load().context("failed to load configuration")?;
    apply_overrides(&mut config, &args)?;

    info!(
        node_id = config.raft.node_id,
        cluster_cidr = %config.pool.cluster_cidr,
        block_prefix = config.pool.block_prefix,
        "starting tamarack-node"
    );

    // Metrics first so every later stage can record into them.
    let metrics = IpamMetrics::new().context("failed to build metrics registry")?;
    let metrics_server = MetricsServer::spawn(&config.metrics.bind_addr, metrics.clone())
        .await
        .context("failed to start metrics server")?;

    // Mapping store (best-effort collaborator; the daemon runs without it).
    let store = if args.no_store {
        None
    } else {
        tokio::fs::create_dir_all(&config.storage.data_dir)
            .await
            .with_context(|| format!("failed to create {}", config.storage.data_dir.display()))?;
        match MappingStore::open(config.storage.mapping_db_path()) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(error = %err, "mapping store unavailable; reverse lookups disabled");
                None
            }
        }
    };

    // Pool and replicated state machine.
    let pool = Pool::new(&config.pool.cluster_cidr, config.pool.block_prefix)
        .map_err(|err| anyhow::anyhow!("invalid pool configuration: {err}"))?;
    let state_machine = IpamStateMachine::new(pool);
    let log_store = RedbLogStore::new(config.storage.raft_log_path())
        .context("failed to open raft log store")?;

    let raft_config = Arc::new(
        Config {
            heartbeat_interval: 500,
            election_timeout_min: 1500,
            election_timeout_max: 3000,
            ..Default::default()
        }
        .validate()
        .context("invalid raft configuration")?,
    );
    let network = TcpRaftNetworkFactory::new(config.raft.peers.clone());
    let raft = Raft::new(
        config.raft.node_id,
        raft_config,
        network,
        log_store,
        state_machine.clone(),
    )
    .await
    .context("failed to create raft core")?;

    let rpc_server = RaftRpcServer::spawn(&config.raft.bind_addr, raft.clone())
        .await
        .context("failed to start raft rpc server")?;

    let raft_node = Arc::new(
        RaftNode::new(config.raft.node_id, raft, state_machine.clone())
            .with_proposal_timeout(config.raft.proposal_timeout),
    );

    if config.raft.bootstrap {
        let mut members = std::collections::BTreeMap::new();
        members.insert(config.raft.node_id, BasicNode::default());
        match raft_node.initialize(members).await {
            Ok(()) => info!("bootstrapped single-node cluster"),
            Err(err) => warn!(error = %err, "bootstrap skipped (already initialized?)"),
        }
    }

    let collector = MetricsCollector::spawn(
        metrics.clone(),
        state_machine.clone(),
        Some(raft_node.clone()),
        store.clone(),
        COLLECT_INTERVAL,
    );

    // Allocation service last: everything it needs is running.
    let service = AllocationService::new(raft_node.clone(), store.clone(), Some(metrics.clone()));
    let service_server = ServiceServer::spawn(
        &config.service.bind_addr,
        Some(config.service.socket_path.clone()),
        service,
    )
    .await
    .context("failed to start allocation service")?;

    info!(
        service = %service_server.local_addr(),
        raft = %rpc_server.local_addr(),
        metrics = %metrics_server.local_addr(),
        "tamarack-node running"
    );

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    // Reverse order: stop taking requests, then consensus, then the rest.
    service_server.shutdown().await;
    if let Err(err) = rpc_server.shutdown().await {
        warn!(error = %err, "raft rpc server shutdown failed");
    }
    raft_node.shutdown().await;
    collector.shutdown().await;
    metrics_server.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

fn apply_overrides(config: &mut DaemonConfig, args: &Args) -> Result<()> {
    if let Some(node_id) = args.node_id {
        config.raft.node_id = node_id;
    }
    if let Some(bind) = &args.raft_bind {
        config.raft.bind_addr = bind.clone();
    }
    if let Some(peers) = &args.peers {
        let mut parsed = HashMap::new();
        for part in peers.split(',').filter(|p| !p.is_empty()) {
            let (id, addr) = part
                .split_once('=')
                .with_context(|| format!("expected id=addr in --peers, got {part}"))?;
            parsed.insert(
                id.trim().parse::<NodeId>().context("peer id must be a number")?,
                addr.trim().to_string(),
            );
        }
        config.raft.peers = parsed;
    }
    if args.bootstrap {
        config.raft.bootstrap = true;
    }
    if let Some(cidr) = &args.cluster_cidr {
        config.pool.cluster_cidr = cidr.clone();
    }
    if let Some(prefix) = args.block_prefix {
        config.pool.block_prefix = prefix;
    }
    if let Some(bind) = &args.service_bind {
        config.service.bind_addr = bind.clone();
    }
    if let Some(path) = &args.unix_socket {
        config.service.socket_path = path.into();
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.into();
    }
    if let Some(bind) = &args.metrics_bind {
        config.metrics.bind_addr = bind.clone();
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
