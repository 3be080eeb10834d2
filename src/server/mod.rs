//! Client-facing allocation service.
//!
//! Request/response pairs carried as postcard inside u32 length frames,
//! over TCP or a Unix domain socket. Mutations run the leader path through
//! consensus; reads are served from this replica's applied state (callers
//! needing linearizable reads must route through the leader).

pub mod client;
pub mod service;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pool::{BlockInfo, PoolStats};
use crate::raft::types::NodeId;
use crate::topology::{NodeStatsDetail, TopologyConfig, TopologyPoolStats};

pub use client::ServiceClient;
pub use service::{AllocationService, ServiceServer};

/// Maximum size for one framed service message (4 MB; topology configs
/// dominate).
pub const MAX_SERVICE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Requests clients may send to the allocation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceRequest {
    /// Allocate an address for a workload. Routed through the topology
    /// pool when the node is registered there, otherwise through the
    /// node's flat-pool blocks.
    AllocateIp {
        node_id: String,
        pod_name: String,
        pod_namespace: String,
        container_id: String,
        /// Subnet purpose; defaults to `default`.
        purpose: Option<String>,
    },
    /// Release an address. Idempotent: releasing an address that is
    /// already free reports success so timeout retries converge.
    ReleaseIp {
        node_id: String,
        ip: String,
        container_id: Option<String>,
    },
    /// Assign a new block to a node (also proposed pre-emptively by the
    /// service itself when a block runs under pressure).
    AllocateBlock { node_id: String },
    /// Return an empty block.
    ReleaseBlock { node_id: String, cidr: String },
    /// Build the topology tree.
    InitTopology { config: TopologyConfig },
    /// Register a host under a TOR.
    RegisterNode {
        node_id: String,
        name: String,
        tor_id: String,
        labels: BTreeMap<String, String>,
    },
    /// Grow a TOR's pool by one subnet.
    AddSubnet {
        tor_id: String,
        cidr: String,
        purpose: String,
    },
    /// Blocks assigned to a node, with per-block pressure flags.
    GetNodeBlocks { node_id: String },
    /// Cluster-wide statistics.
    GetPoolStats,
    /// One node's topology standing.
    GetNodeStats { node_id: String },
    GetHealth,
    GetLeader,
}

/// A route pushed to the container runtime.
// No serde skip attributes here: the wire format is postcard, which is
// positional and must see every field on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub dst: String,
    pub gw: Option<String>,
}

/// Why a request failed, mirrored from the proposal error taxonomy so
/// clients can decide between redirect, retry and back-off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceErrorKind {
    /// Redirect to the hinted leader and retry.
    NotLeader { leader_hint: Option<NodeId> },
    /// Safe to retry idempotent requests.
    Timeout,
    /// The state machine rejected the command; retrying without change
    /// will fail again.
    CommandFailed,
    /// No quorum or consensus shutting down; back off.
    ConsensusUnavailable,
    /// The request itself is malformed.
    InvalidRequest,
    Internal,
}

/// Responses paired with [`ServiceRequest`] variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceResponse {
    IpAllocated {
        ip: String,
        /// Address with prefix, e.g. `10.244.1.5/24`.
        cidr: String,
        gateway: String,
        routes: Vec<RouteEntry>,
    },
    IpReleased {
        released: bool,
        message: String,
    },
    BlockAllocated {
        node_id: String,
        cidr: String,
        total: usize,
        used: usize,
        available: usize,
    },
    BlockReleased {
        node_id: String,
        cidr: String,
    },
    TopologyInitialized {
        zones: usize,
        pods: usize,
        tors: usize,
        subnets: usize,
    },
    NodeRegistered {
        node_id: String,
        name: String,
        tor_id: String,
    },
    SubnetAdded {
        tor_id: String,
        cidr: String,
        purpose: String,
    },
    NodeBlocks {
        blocks: Vec<BlockInfo>,
    },
    PoolStats {
        flat: PoolStats,
        topology: TopologyPoolStats,
    },
    NodeStats {
        detail: NodeStatsDetail,
    },
    Health {
        node_id: NodeId,
        is_leader: bool,
        leader: Option<NodeId>,
    },
    Leader {
        leader: Option<NodeId>,
    },
    Error {
        kind: ServiceErrorKind,
        message: String,
    },
}

impl ServiceResponse {
    pub fn error(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }
}
