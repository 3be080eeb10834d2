//! In-memory Raft router for deterministic multi-node testing.
//!
//! Manages multiple Raft nodes with simulated networking: no real I/O,
//! configurable send delay, and fail/recover switches for individual
//! nodes. Integration tests drive whole-cluster scenarios (leader change,
//! snapshot transfer, replica convergence) through this router.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{Context as _, Result};
use openraft::alias::VoteOf;
use openraft::error::{NetworkError, RPCError, ReplicationClosed, StreamingError, Unreachable};
use openraft::metrics::Wait;
use openraft::network::v2::RaftNetworkV2;
use openraft::network::RPCOption;
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Config, Raft};
use tokio::time::sleep;

use crate::pool::Pool;
use crate::raft::storage::{InMemoryLogStore, IpamStateMachine};
use crate::raft::types::{IpamRequest, IpamResponse, IpamTypeConfig, NodeId};

/// A Raft node managed by the router, with its storage handles.
pub struct ClusterNode {
    pub id: NodeId,
    pub raft: Raft<IpamTypeConfig>,
    pub log_store: InMemoryLogStore,
    pub state_machine: Arc<IpamStateMachine>,
}

/// Network factory routing RPCs through the shared in-memory router.
#[derive(Clone)]
struct InMemoryNetworkFactory {
    source: NodeId,
    router: Arc<InnerRouter>,
}

impl openraft::network::RaftNetworkFactory<IpamTypeConfig> for InMemoryNetworkFactory {
    type Network = InMemoryNetwork;

    async fn new_client(&mut self, target: NodeId, _node: &BasicNode) -> Self::Network {
        InMemoryNetwork {
            source: self.source,
            target,
            router: self.router.clone(),
        }
    }
}

struct InMemoryNetwork {
    source: NodeId,
    target: NodeId,
    router: Arc<InnerRouter>,
}

impl RaftNetworkV2<IpamTypeConfig> for InMemoryNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<IpamTypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<IpamTypeConfig>, RPCError<IpamTypeConfig>> {
        let raft = self.router.reachable_raft(self.source, self.target)?;
        self.router.apply_network_delay().await;
        raft.append_entries(rpc)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<IpamTypeConfig>,
        _option: RPCOption,
    ) -> Result<VoteResponse<IpamTypeConfig>, RPCError<IpamTypeConfig>> {
        let raft = self.router.reachable_raft(self.source, self.target)?;
        self.router.apply_network_delay().await;
        raft.vote(rpc)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))
    }

    async fn full_snapshot(
        &mut self,
        vote: VoteOf<IpamTypeConfig>,
        snapshot: openraft::Snapshot<IpamTypeConfig>,
        _cancel: impl std::future::Future<Output = ReplicationClosed> + openraft::OptionalSend + 'static,
        _option: RPCOption,
    ) -> Result<SnapshotResponse<IpamTypeConfig>, StreamingError<IpamTypeConfig>> {
        let raft = self
            .router
            .reachable_raft(self.source, self.target)
            .map_err(unreachable_to_streaming)?;
        self.router.apply_network_delay().await;
        raft.install_full_snapshot(vote, snapshot)
            .await
            .map_err(|e| StreamingError::Network(NetworkError::new(&e)))
    }
}

fn unreachable_to_streaming(err: RPCError<IpamTypeConfig>) -> StreamingError<IpamTypeConfig> {
    match err {
        RPCError::Unreachable(u) => StreamingError::Unreachable(u),
        other => StreamingError::Network(NetworkError::new(&std::io::Error::other(
            other.to_string(),
        ))),
    }
}

/// Router state shared across all network factories.
struct InnerRouter {
    nodes: StdMutex<BTreeMap<NodeId, ClusterNode>>,
    send_delay_ms: AtomicU64,
    failed_nodes: StdMutex<HashMap<NodeId, bool>>,
}

impl InnerRouter {
    fn new() -> Self {
        Self {
            nodes: StdMutex::new(BTreeMap::new()),
            send_delay_ms: AtomicU64::new(0),
            failed_nodes: StdMutex::new(HashMap::new()),
        }
    }

    async fn apply_network_delay(&self) {
        let delay_ms = self.send_delay_ms.load(Ordering::Relaxed);
        if delay_ms > 0 {
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    fn is_node_failed(&self, node_id: NodeId) -> bool {
        let failed = self.failed_nodes.lock().unwrap();
        failed.get(&node_id).copied().unwrap_or(false)
    }

    /// Resolve the target's Raft handle, enforcing fail switches on both
    /// endpoints.
    fn reachable_raft(
        &self,
        source: NodeId,
        target: NodeId,
    ) -> Result<Raft<IpamTypeConfig>, RPCError<IpamTypeConfig>> {
        if self.is_node_failed(source) {
            return Err(RPCError::Unreachable(Unreachable::new(&std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "source node marked as failed",
            ))));
        }
        if self.is_node_failed(target) {
            return Err(RPCError::Unreachable(Unreachable::new(&std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "target node marked as failed",
            ))));
        }

        let nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&target).ok_or_else(|| {
            RPCError::Unreachable(Unreachable::new(&std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("target node {target} not found"),
            )))
        })?;
        Ok(node.raft.clone())
    }
}

/// Router managing in-memory Raft nodes.
///
/// Multi-node pattern: create all nodes, `initialize` one of them (the
/// membership covers every registered node), then wait for a leader via
/// [`IpamRouter::wait`].
pub struct IpamRouter {
    config: Arc<Config>,
    /// Flat pool configuration cloned into every new node's state machine.
    pool_template: Pool,
    inner: Arc<InnerRouter>,
}

impl IpamRouter {
    /// Create a router. Every node boots with a state machine around a
    /// clone of `pool_template`, mirroring a fleet booted from one config.
    pub fn new(config: Arc<Config>, pool_template: Pool) -> Self {
        Self {
            config,
            pool_template,
            inner: Arc::new(InnerRouter::new()),
        }
    }

    /// Create a new Raft node and register it with the router.
    pub async fn new_raft_node(&mut self, id: NodeId) -> Result<()> {
        let log_store = InMemoryLogStore::default();
        let state_machine = IpamStateMachine::new(self.pool_template.clone());
        let network_factory = InMemoryNetworkFactory {
            source: id,
            router: self.inner.clone(),
        };

        let raft = Raft::new(
            id,
            self.config.clone(),
            network_factory,
            log_store.clone(),
            state_machine.clone(),
        )
        .await
        .context("failed to create Raft node")?;

        let node = ClusterNode {
            id,
            raft,
            log_store,
            state_machine,
        };
        let mut nodes = self.inner.nodes.lock().unwrap();
        nodes.insert(id, node);
        Ok(())
    }

    pub fn get_raft_handle(&self, node_id: &NodeId) -> Result<Raft<IpamTypeConfig>> {
        let nodes = self.inner.nodes.lock().unwrap();
        let node = nodes
            .get(node_id)
            .with_context(|| format!("node {node_id} not found"))?;
        Ok(node.raft.clone())
    }

    pub fn get_state_machine(&self, node_id: &NodeId) -> Result<Arc<IpamStateMachine>> {
        let nodes = self.inner.nodes.lock().unwrap();
        let node = nodes
            .get(node_id)
            .with_context(|| format!("node {node_id} not found"))?;
        Ok(node.state_machine.clone())
    }

    /// Metrics-based wait helper for assertions.
    pub fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Wait<IpamTypeConfig> {
        let nodes = self.inner.nodes.lock().unwrap();
        let node = nodes.get(node_id).expect("node not found in routing table");
        node.raft.wait(timeout)
    }

    /// Initialize the cluster with every registered node as a voter.
    pub async fn initialize(&self, node_id: NodeId) -> Result<()> {
        let members: BTreeMap<NodeId, BasicNode> = {
            let nodes = self.inner.nodes.lock().unwrap();
            nodes.keys().map(|id| (*id, BasicNode::default())).collect()
        };
        let raft = self.get_raft_handle(&node_id)?;
        raft.initialize(members).await?;
        Ok(())
    }

    /// Add a node to the cluster as a learner, replicating state to it.
    pub async fn add_learner(&self, leader: NodeId, target: NodeId) -> Result<()> {
        let raft = self.get_raft_handle(&leader)?;
        raft.add_learner(target, BasicNode::default(), true)
            .await
            .context("add_learner failed")?;
        Ok(())
    }

    /// Promote the given set to voters.
    pub async fn change_membership(
        &self,
        leader: NodeId,
        members: std::collections::BTreeSet<NodeId>,
    ) -> Result<()> {
        let raft = self.get_raft_handle(&leader)?;
        raft.change_membership(members, false)
            .await
            .context("change_membership failed")?;
        Ok(())
    }

    /// Current leader, skipping failed nodes.
    pub fn leader(&self) -> Option<NodeId> {
        let nodes = self.inner.nodes.lock().unwrap();
        for node in nodes.values() {
            if self.inner.is_node_failed(node.id) {
                continue;
            }
            let metrics = node.raft.metrics().borrow().clone();
            if metrics.state == openraft::ServerState::Leader {
                return Some(node.id);
            }
        }
        None
    }

    /// Propose a command through the given node.
    pub async fn propose(&self, node_id: &NodeId, request: IpamRequest) -> Result<IpamResponse> {
        let raft = self.get_raft_handle(node_id)?;
        let resp = raft
            .client_write(request)
            .await
            .context("client_write failed")?;
        Ok(resp.data)
    }

    pub fn set_network_delay(&mut self, delay_ms: u64) {
        self.inner.send_delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    /// Mark a node as failed; RPCs to and from it return Unreachable.
    pub fn fail_node(&mut self, node_id: NodeId) {
        let mut failed = self.inner.failed_nodes.lock().unwrap();
        failed.insert(node_id, true);
    }

    pub fn recover_node(&mut self, node_id: NodeId) {
        let mut failed = self.inner.failed_nodes.lock().unwrap();
        failed.insert(node_id, false);
    }
}
