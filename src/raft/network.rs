//! TCP transport for Raft RPC.
//!
//! One connection per RPC keeps the client side trivial and leans on the
//! kernel for connection reuse across the small, stable peer set of an
//! IPAM control plane. Frames are u32-length-delimited postcard.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::{SinkExt, StreamExt};
use openraft::alias::VoteOf;
use openraft::error::{NetworkError, RPCError, ReplicationClosed, StreamingError, Unreachable};
use openraft::network::v2::RaftNetworkV2;
use openraft::network::{RPCOption, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::{BasicNode, OptionalSend, Snapshot};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::raft::rpc::{RaftRpcRequest, RaftRpcResponse, MAX_RPC_MESSAGE_SIZE};
use crate::raft::types::{IpamTypeConfig, NodeId};

/// Length-delimited codec sized for Raft traffic.
pub(crate) fn rpc_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_RPC_MESSAGE_SIZE)
        .new_codec()
}

/// Raft network factory over plain TCP.
///
/// Peer addresses come from configuration and may be extended at runtime
/// when membership grows.
#[derive(Clone)]
pub struct TcpRaftNetworkFactory {
    peer_addrs: Arc<RwLock<HashMap<NodeId, String>>>,
}

impl TcpRaftNetworkFactory {
    pub fn new(peer_addrs: HashMap<NodeId, String>) -> Self {
        Self {
            peer_addrs: Arc::new(RwLock::new(peer_addrs)),
        }
    }

    /// Register or replace a peer address.
    pub fn add_peer(&self, node_id: NodeId, addr: String) {
        let mut peers = self
            .peer_addrs
            .write()
            .expect("peer_addrs RwLock poisoned: a thread panicked while holding the lock");
        peers.insert(node_id, addr);
    }

    fn lookup(&self, node_id: NodeId) -> Option<String> {
        let peers = self
            .peer_addrs
            .read()
            .expect("peer_addrs RwLock poisoned: a thread panicked while holding the lock");
        peers.get(&node_id).cloned()
    }
}

impl RaftNetworkFactory<IpamTypeConfig> for TcpRaftNetworkFactory {
    type Network = TcpRaftNetwork;

    async fn new_client(&mut self, target: NodeId, _node: &BasicNode) -> Self::Network {
        TcpRaftNetwork {
            target,
            factory: self.clone(),
        }
    }
}

/// Per-target client handle.
pub struct TcpRaftNetwork {
    target: NodeId,
    factory: TcpRaftNetworkFactory,
}

impl TcpRaftNetwork {
    /// Connect, send one request, read one response.
    async fn exchange(&self, request: &RaftRpcRequest) -> Result<RaftRpcResponse, std::io::Error> {
        let addr = self.factory.lookup(self.target).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address known for raft peer {}", self.target),
            )
        })?;

        let stream = TcpStream::connect(&addr).await?;
        let mut framed = Framed::new(stream, rpc_codec());

        let bytes = postcard::to_stdvec(request)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        framed.send(bytes.into()).await?;

        let frame = framed.next().await.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection before responding",
            )
        })??;
        debug!(target = self.target, bytes = frame.len(), "raft rpc exchanged");

        postcard::from_bytes(&frame)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

impl RaftNetworkV2<IpamTypeConfig> for TcpRaftNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<IpamTypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<IpamTypeConfig>, RPCError<IpamTypeConfig>> {
        match self.exchange(&RaftRpcRequest::AppendEntries(rpc)).await {
            Ok(RaftRpcResponse::AppendEntries(resp)) => Ok(resp),
            Ok(other) => Err(RPCError::Network(NetworkError::new(&std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected raft rpc response: {other:?}"),
            )))),
            Err(err) => Err(RPCError::Unreachable(Unreachable::new(&err))),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<IpamTypeConfig>,
        _option: RPCOption,
    ) -> Result<VoteResponse<IpamTypeConfig>, RPCError<IpamTypeConfig>> {
        match self.exchange(&RaftRpcRequest::Vote(rpc)).await {
            Ok(RaftRpcResponse::Vote(resp)) => Ok(resp),
            Ok(other) => Err(RPCError::Network(NetworkError::new(&std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected raft rpc response: {other:?}"),
            )))),
            Err(err) => Err(RPCError::Unreachable(Unreachable::new(&err))),
        }
    }

    async fn full_snapshot(
        &mut self,
        vote: VoteOf<IpamTypeConfig>,
        snapshot: Snapshot<IpamTypeConfig>,
        _cancel: impl std::future::Future<Output = ReplicationClosed> + OptionalSend + 'static,
        _option: RPCOption,
    ) -> Result<SnapshotResponse<IpamTypeConfig>, StreamingError<IpamTypeConfig>> {
        let request = RaftRpcRequest::Snapshot {
            vote,
            meta: snapshot.meta,
            data: snapshot.snapshot.into_inner(),
        };
        match self.exchange(&request).await {
            Ok(RaftRpcResponse::Snapshot(resp)) => Ok(resp),
            Ok(other) => Err(StreamingError::Network(NetworkError::new(
                &std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected raft rpc response: {other:?}"),
                ),
            ))),
            Err(err) => Err(StreamingError::Unreachable(Unreachable::new(&err))),
        }
    }
}
