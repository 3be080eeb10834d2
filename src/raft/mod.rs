//! Consensus integration: replicated commands, state machine, transport.

pub mod network;
pub mod node;
pub mod rpc;
pub mod server;
pub mod storage;
pub mod types;

pub use network::TcpRaftNetworkFactory;
pub use node::{RaftNode, DEFAULT_PROPOSAL_TIMEOUT};
pub use server::RaftRpcServer;
pub use storage::{InMemoryLogStore, IpamState, IpamStateMachine, RedbLogStore};
pub use types::{IpamRequest, IpamResponse, IpamTypeConfig, NodeId, ResponseData};
