//! Wire protocol for Raft RPC between replicas.
//!
//! Three request/response pairs matching OpenRaft's v2 network API: Vote,
//! AppendEntries, and full-snapshot transfer. Messages are postcard-encoded
//! inside u32 length frames; the snapshot payload travels as raw bytes
//! because the snapshot cursor itself is not serializable.

use openraft::alias::VoteOf;
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, SnapshotResponse, VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};

use crate::raft::types::IpamTypeConfig;

/// Maximum size for one framed RPC message (16 MB).
///
/// Snapshots of large pools dominate; a /16 cluster's full allocation
/// state stays well under this.
pub const MAX_RPC_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Requests a replica may receive from a peer.
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpcRequest {
    /// Leader election vote.
    Vote(VoteRequest<IpamTypeConfig>),
    /// Log replication and heartbeats.
    AppendEntries(AppendEntriesRequest<IpamTypeConfig>),
    /// Full snapshot install for a follower that fell behind the log.
    Snapshot {
        vote: VoteOf<IpamTypeConfig>,
        meta: openraft::SnapshotMeta<IpamTypeConfig>,
        data: Vec<u8>,
    },
}

/// Responses paired with [`RaftRpcRequest`] variants.
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpcResponse {
    Vote(VoteResponse<IpamTypeConfig>),
    AppendEntries(AppendEntriesResponse<IpamTypeConfig>),
    Snapshot(SnapshotResponse<IpamTypeConfig>),
    /// The peer could not service the request (core shutting down,
    /// decode failure). Carried as a value so the caller can convert it
    /// into a network-layer error.
    Error(String),
}
