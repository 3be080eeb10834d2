//! Listener for incoming Raft RPC from peers.
//!
//! Accepts TCP connections, decodes length-framed postcard requests and
//! forwards them to the Raft core. One task per connection; a connection
//! may carry any number of sequential RPCs (the leader keeps one open per
//! follower in steady state).

use std::io::Cursor;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use openraft::{Raft, Snapshot};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::raft::network::rpc_codec;
use crate::raft::rpc::{RaftRpcRequest, RaftRpcResponse};
use crate::raft::types::IpamTypeConfig;

/// Handle to the spawned RPC listener.
pub struct RaftRpcServer {
    local_addr: std::net::SocketAddr,
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl RaftRpcServer {
    /// Bind `bind_addr` and start serving the given Raft core.
    pub async fn spawn(bind_addr: &str, raft: Raft<IpamTypeConfig>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind raft rpc listener on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("listener has no local addr")?;
        let cancel_token = CancellationToken::new();
        let cancel_clone = cancel_token.clone();

        let join_handle = tokio::spawn(async move {
            run_server(listener, raft, cancel_clone).await;
        });

        info!(%local_addr, "raft rpc server listening");
        Ok(Self {
            local_addr,
            join_handle,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down raft rpc server");
        self.cancel_token.cancel();
        self.join_handle.await.context("raft rpc server task panicked")?;
        Ok(())
    }
}

async fn run_server(listener: TcpListener, raft: Raft<IpamTypeConfig>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("raft rpc server received shutdown signal");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "failed to accept raft rpc connection");
                        continue;
                    }
                };
                let raft = raft.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, raft, cancel).await {
                        error!(%peer, error = %err, "raft rpc connection failed");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    raft: Raft<IpamTypeConfig>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, rpc_codec());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else {
            // Peer closed cleanly.
            return Ok(());
        };
        let frame = frame.context("failed to read raft rpc frame")?;

        let response = match postcard::from_bytes::<RaftRpcRequest>(&frame) {
            Ok(request) => dispatch(&raft, request).await,
            Err(err) => RaftRpcResponse::Error(format!("failed to decode raft rpc: {err}")),
        };

        let bytes =
            postcard::to_stdvec(&response).context("failed to serialize raft rpc response")?;
        framed.send(bytes.into()).await.context("failed to write raft rpc response")?;
    }
}

async fn dispatch(raft: &Raft<IpamTypeConfig>, request: RaftRpcRequest) -> RaftRpcResponse {
    match request {
        RaftRpcRequest::Vote(rpc) => {
            debug!("handling vote rpc");
            match raft.vote(rpc).await {
                Ok(resp) => RaftRpcResponse::Vote(resp),
                Err(err) => RaftRpcResponse::Error(err.to_string()),
            }
        }
        RaftRpcRequest::AppendEntries(rpc) => match raft.append_entries(rpc).await {
            Ok(resp) => RaftRpcResponse::AppendEntries(resp),
            Err(err) => RaftRpcResponse::Error(err.to_string()),
        },
        RaftRpcRequest::Snapshot { vote, meta, data } => {
            debug!(bytes = data.len(), "handling full snapshot rpc");
            let snapshot = Snapshot {
                meta,
                snapshot: Cursor::new(data),
            };
            match raft.install_full_snapshot(vote, snapshot).await {
                Ok(resp) => RaftRpcResponse::Snapshot(resp),
                Err(err) => RaftRpcResponse::Error(err.to_string()),
            }
        }
    }
}
