//! Tamarack: cluster-wide IP address management.
//!
//! Assigns IPv4/IPv6 addresses to workloads across many hosts from a
//! planned address plan, and replicates every allocation decision through
//! a consensus log so no address is handed out twice and no block is
//! double-assigned.
//!
//! The layers, leaves first:
//!
//! - [`allocator`]: bitmap primitive and CIDR-scoped blocks.
//! - [`pool`]: the flat pool, a cluster CIDR cut into equal node blocks.
//! - [`topology`]: the Zone/Pod/TOR/Node tree and purpose-tagged subnets.
//! - [`raft`]: commands, the replicated state machine with full-state
//!   snapshots, and the TCP transport between replicas.
//! - [`server`]: the client-facing allocation service.
//! - [`store`], [`metrics`], [`cni`], [`config`]: the daemon's local
//!   collaborators.

/// Address allocators: bitmap, IPv4/IPv6 blocks, dual stack.
pub mod allocator;
/// CNI plugin types and command execution.
pub mod cni;
/// Daemon configuration from environment variables.
pub mod config;
/// Error taxonomy shared across layers.
pub mod error;
/// Prometheus metrics and the HTTP exporter.
pub mod metrics;
/// Flat pool: cluster CIDR partitioned into node blocks.
pub mod pool;
/// Consensus integration.
pub mod raft;
/// Client-facing allocation service.
pub mod server;
/// Container-to-IP mapping store.
pub mod store;
/// Deterministic multi-node testing support.
pub mod testing;
/// Network topology and topology-aware allocation.
pub mod topology;

pub use error::{IpamError, ProposalError};
pub use pool::Pool;
pub use raft::{IpamRequest, IpamResponse, IpamStateMachine, RaftNode};
pub use topology::TopologyPool;
