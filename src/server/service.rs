//! Allocation service handlers and listeners.
//!
//! Every mutation is proposed through the replicated state machine; the
//! handler only adds the read-side garnish (gateway, routes) and the
//! write-behind into the mapping store. A store failure after a committed
//! allocation is logged and does not un-commit the allocation.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ProposalError;
use crate::metrics::IpamMetrics;
use crate::raft::node::RaftNode;
use crate::raft::types::{IpamRequest, ResponseData};
use crate::server::{
    RouteEntry, ServiceErrorKind, ServiceRequest, ServiceResponse, MAX_SERVICE_MESSAGE_SIZE,
};
use crate::store::{IpMapping, MappingStore};
use crate::topology::{AllocationMeta, DEFAULT_PURPOSE};

pub(crate) fn service_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_SERVICE_MESSAGE_SIZE)
        .new_codec()
}

/// The service itself: consensus handle plus local collaborators.
pub struct AllocationService {
    raft: Arc<RaftNode>,
    store: Option<Arc<MappingStore>>,
    metrics: Option<Arc<IpamMetrics>>,
}

impl AllocationService {
    pub fn new(
        raft: Arc<RaftNode>,
        store: Option<Arc<MappingStore>>,
        metrics: Option<Arc<IpamMetrics>>,
    ) -> Arc<Self> {
        Arc::new(Self { raft, store, metrics })
    }

    /// Handle one request to completion.
    pub async fn handle(&self, request: ServiceRequest) -> ServiceResponse {
        debug!(?request, "handling service request");
        match request {
            ServiceRequest::AllocateIp {
                node_id,
                pod_name,
                pod_namespace,
                container_id,
                purpose,
            } => {
                self.allocate_ip(node_id, pod_name, pod_namespace, container_id, purpose)
                    .await
            }
            ServiceRequest::ReleaseIp {
                node_id,
                ip,
                container_id,
            } => self.release_ip(node_id, ip, container_id).await,
            ServiceRequest::AllocateBlock { node_id } => self.allocate_block(node_id).await,
            ServiceRequest::ReleaseBlock { node_id, cidr } => {
                self.release_block(node_id, cidr).await
            }
            ServiceRequest::InitTopology { config } => {
                match self
                    .raft
                    .propose_applied(IpamRequest::InitTopology { config })
                    .await
                {
                    Ok(resp) => match resp.data {
                        Some(ResponseData::TopologyInitialized { zones, pods, tors, subnets }) => {
                            ServiceResponse::TopologyInitialized { zones, pods, tors, subnets }
                        }
                        other => unexpected_response(other),
                    },
                    Err(err) => proposal_error(err),
                }
            }
            ServiceRequest::RegisterNode {
                node_id,
                name,
                tor_id,
                labels,
            } => {
                match self
                    .raft
                    .propose_applied(IpamRequest::RegisterNode { node_id, name, tor_id, labels })
                    .await
                {
                    Ok(resp) => match resp.data {
                        Some(ResponseData::NodeRegistered { node_id, name, tor_id }) => {
                            ServiceResponse::NodeRegistered { node_id, name, tor_id }
                        }
                        other => unexpected_response(other),
                    },
                    Err(err) => proposal_error(err),
                }
            }
            ServiceRequest::AddSubnet { tor_id, cidr, purpose } => {
                match self
                    .raft
                    .propose_applied(IpamRequest::AddSubnet { tor_id, cidr, purpose })
                    .await
                {
                    Ok(resp) => match resp.data {
                        Some(ResponseData::SubnetAdded { tor_id, cidr, purpose }) => {
                            ServiceResponse::SubnetAdded {
                                tor_id,
                                cidr: cidr.to_string(),
                                purpose,
                            }
                        }
                        other => unexpected_response(other),
                    },
                    Err(err) => proposal_error(err),
                }
            }
            ServiceRequest::GetNodeBlocks { node_id } => {
                match self.raft.state_machine().node_blocks(&node_id).await {
                    Ok(blocks) => ServiceResponse::NodeBlocks { blocks },
                    Err(err) => {
                        ServiceResponse::error(ServiceErrorKind::CommandFailed, err.to_string())
                    }
                }
            }
            ServiceRequest::GetPoolStats => {
                let sm = self.raft.state_machine();
                ServiceResponse::PoolStats {
                    flat: sm.flat_stats().await,
                    topology: sm.topology_stats().await,
                }
            }
            ServiceRequest::GetNodeStats { node_id } => {
                match self.raft.state_machine().node_stats(&node_id).await {
                    Ok(detail) => ServiceResponse::NodeStats { detail },
                    Err(err) => {
                        ServiceResponse::error(ServiceErrorKind::CommandFailed, err.to_string())
                    }
                }
            }
            ServiceRequest::GetHealth => ServiceResponse::Health {
                node_id: self.raft.node_id(),
                is_leader: self.raft.is_leader(),
                leader: self.raft.current_leader(),
            },
            ServiceRequest::GetLeader => ServiceResponse::Leader {
                leader: self.raft.current_leader(),
            },
        }
    }

    async fn allocate_ip(
        &self,
        node_id: String,
        pod_name: String,
        pod_namespace: String,
        container_id: String,
        purpose: Option<String>,
    ) -> ServiceResponse {
        let timer = self.metrics.as_ref().map(|m| m.allocation_duration.start_timer());
        let purpose = purpose.unwrap_or_else(|| DEFAULT_PURPOSE.to_string());
        let meta = AllocationMeta {
            container_id: Some(container_id.clone()),
            pod_name: Some(pod_name.clone()),
            pod_namespace: Some(pod_namespace.clone()),
        };

        // Route by whether the topology knows this node; flat-pool nodes
        // fall back to block-based allocation.
        let in_topology = self
            .raft
            .state_machine()
            .with_state(|state| state.topology.topology().node(&node_id).is_some())
            .await;

        let command = if in_topology {
            IpamRequest::AllocateIp {
                node_id: node_id.clone(),
                purpose: purpose.clone(),
                meta,
            }
        } else {
            IpamRequest::AllocateNodeIp {
                node_id: node_id.clone(),
            }
        };

        let response = match self.raft.propose_applied(command).await {
            Ok(resp) => resp,
            Err(err) => {
                if let Some(m) = &self.metrics {
                    m.ip_allocation_errors.inc();
                }
                drop(timer);
                return proposal_error(err);
            }
        };

        let (ip, prefix_len, gateway, block_cidr) = match response.data {
            Some(ResponseData::IpGrant { ip, cidr, .. }) => {
                let gateway = Ipv4Addr::from(u32::from(cidr.network()) + 1);
                (ip, cidr.prefix_len(), gateway, cidr)
            }
            Some(ResponseData::NodeIpGrant {
                ip,
                block_cidr,
                gateway,
                block_under_pressure,
                ..
            }) => {
                if block_under_pressure {
                    self.preprovision_block(node_id.clone());
                }
                (ip, block_cidr.prefix_len(), gateway, block_cidr)
            }
            other => return unexpected_response(other),
        };

        if let Some(m) = &self.metrics {
            m.ip_allocations.inc();
        }
        drop(timer);

        let cidr = format!("{ip}/{prefix_len}");
        if let Some(store) = &self.store {
            let mapping = IpMapping {
                container_id,
                pod_name,
                pod_namespace,
                node_id,
                ip: ip.to_string(),
                cidr: cidr.clone(),
                block_cidr: block_cidr.to_string(),
                allocated_at: Utc::now(),
            };
            if let Err(err) = store.save(&mapping) {
                warn!(error = %err, ip = %ip, "failed to save IP mapping; allocation stands");
            }
        }

        ServiceResponse::IpAllocated {
            ip: ip.to_string(),
            cidr,
            gateway: gateway.to_string(),
            routes: vec![RouteEntry {
                dst: "0.0.0.0/0".into(),
                gw: None,
            }],
        }
    }

    async fn release_ip(
        &self,
        node_id: String,
        ip: String,
        container_id: Option<String>,
    ) -> ServiceResponse {
        let timer = self.metrics.as_ref().map(|m| m.release_duration.start_timer());

        // Teardown paths may know only the container id; resolve the
        // address from the mapping store before proposing.
        let ip = if ip.is_empty() {
            let resolved = match (&self.store, &container_id) {
                (Some(store), Some(id)) => store.get(id).ok().flatten().map(|m| m.ip),
                _ => None,
            };
            match resolved {
                Some(ip) => ip,
                None => {
                    return ServiceResponse::IpReleased {
                        released: true,
                        message: "no address recorded for container".into(),
                    };
                }
            }
        } else {
            ip
        };

        let parsed: Ipv4Addr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                return ServiceResponse::error(
                    ServiceErrorKind::InvalidRequest,
                    format!("invalid IP address: {ip}"),
                );
            }
        };

        let in_topology = self
            .raft
            .state_machine()
            .with_state(|state| state.topology.topology().node(&node_id).is_some())
            .await;
        let command = if in_topology {
            IpamRequest::ReleaseIp {
                node_id: node_id.clone(),
                ip: parsed,
            }
        } else {
            IpamRequest::ReleaseNodeIp {
                node_id: node_id.clone(),
                ip: parsed,
            }
        };

        let result = self.raft.propose_applied(command).await;
        drop(timer);

        let response = match result {
            Ok(_) => ServiceResponse::IpReleased {
                released: true,
                message: format!("released {ip}"),
            },
            // Idempotency at the service boundary: an address that is
            // already free converges to success so timeout retries are
            // harmless. The state machine itself reported the precise
            // kind (IpNotAllocated).
            Err(ProposalError::CommandFailed { reason })
                if reason.contains("not allocated")
                    || reason.contains("already clear")
                    || reason.contains("block not found") =>
            {
                ServiceResponse::IpReleased {
                    released: true,
                    message: format!("{ip} was already released"),
                }
            }
            Err(err) => return proposal_error(err),
        };

        if let Some(m) = &self.metrics {
            m.ip_releases.inc();
        }
        if let Some(store) = &self.store {
            let key = match container_id {
                Some(id) => Some(id),
                None => store
                    .by_ip(&ip)
                    .ok()
                    .flatten()
                    .map(|mapping| mapping.container_id),
            };
            if let Some(key) = key {
                if let Err(err) = store.delete(&key) {
                    warn!(error = %err, container_id = %key, "failed to delete IP mapping");
                }
            }
        }
        response
    }

    async fn allocate_block(&self, node_id: String) -> ServiceResponse {
        match self
            .raft
            .propose_applied(IpamRequest::AllocateBlock { node_id })
            .await
        {
            Ok(resp) => match resp.data {
                Some(ResponseData::BlockGrant {
                    cidr,
                    node_id,
                    total,
                    used,
                    available,
                }) => {
                    if let Some(m) = &self.metrics {
                        m.block_allocations.inc();
                    }
                    ServiceResponse::BlockAllocated {
                        node_id,
                        cidr: cidr.to_string(),
                        total,
                        used,
                        available,
                    }
                }
                other => unexpected_response(other),
            },
            Err(err) => proposal_error(err),
        }
    }

    async fn release_block(&self, node_id: String, cidr: String) -> ServiceResponse {
        match self
            .raft
            .propose_applied(IpamRequest::ReleaseBlock { node_id, cidr: cidr.clone() })
            .await
        {
            Ok(resp) => match resp.data {
                Some(ResponseData::BlockReleased { node_id, cidr }) => {
                    if let Some(m) = &self.metrics {
                        m.block_releases.inc();
                    }
                    ServiceResponse::BlockReleased {
                        node_id,
                        cidr: cidr.to_string(),
                    }
                }
                other => unexpected_response(other),
            },
            // Idempotent like ReleaseIp: a block that is already gone is
            // a successful release.
            Err(ProposalError::CommandFailed { reason })
                if reason.contains("block not found") =>
            {
                ServiceResponse::BlockReleased { node_id, cidr }
            }
            Err(err) => proposal_error(err),
        }
    }

    /// Propose a fresh block for a node whose current block is running
    /// low. Fire-and-forget; failure only costs the pre-provisioning.
    fn preprovision_block(&self, node_id: String) {
        let raft = self.raft.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            info!(node_id = %node_id, "block under pressure, pre-provisioning another");
            match raft
                .propose_applied(IpamRequest::AllocateBlock { node_id: node_id.clone() })
                .await
            {
                Ok(_) => {
                    if let Some(m) = metrics {
                        m.block_allocations.inc();
                    }
                }
                Err(err) => {
                    warn!(node_id = %node_id, error = %err, "pre-provisioning block failed");
                }
            }
        });
    }
}

fn proposal_error(err: ProposalError) -> ServiceResponse {
    let kind = match &err {
        ProposalError::NotLeader { leader_hint } => ServiceErrorKind::NotLeader {
            leader_hint: *leader_hint,
        },
        ProposalError::Timeout { .. } => ServiceErrorKind::Timeout,
        ProposalError::CommandFailed { .. } => ServiceErrorKind::CommandFailed,
        ProposalError::ConsensusUnavailable { .. } => ServiceErrorKind::ConsensusUnavailable,
    };
    ServiceResponse::error(kind, err.to_string())
}

fn unexpected_response(data: Option<ResponseData>) -> ServiceResponse {
    error!(?data, "state machine returned a mismatched response kind");
    ServiceResponse::error(
        ServiceErrorKind::Internal,
        "state machine returned a mismatched response kind",
    )
}

/// Listeners for the allocation service.
pub struct ServiceServer {
    tcp_addr: std::net::SocketAddr,
    join_handles: Vec<JoinHandle<()>>,
    cancel_token: CancellationToken,
    socket_path: Option<PathBuf>,
}

impl ServiceServer {
    /// Bind the TCP endpoint and, when given, the Unix socket.
    pub async fn spawn(
        bind_addr: &str,
        socket_path: Option<PathBuf>,
        service: Arc<AllocationService>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind allocation service on {bind_addr}"))?;
        let tcp_addr = listener.local_addr().context("listener has no local addr")?;
        let cancel_token = CancellationToken::new();
        let mut join_handles = Vec::new();

        {
            let service = service.clone();
            let cancel = cancel_token.clone();
            join_handles.push(tokio::spawn(async move {
                run_tcp_listener(listener, service, cancel).await;
            }));
        }

        if let Some(path) = &socket_path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            // A stale socket from a previous run blocks the bind.
            let _ = tokio::fs::remove_file(path).await;
            let listener = UnixListener::bind(path)
                .with_context(|| format!("failed to bind unix socket {}", path.display()))?;
            let service = service.clone();
            let cancel = cancel_token.clone();
            join_handles.push(tokio::spawn(async move {
                run_unix_listener(listener, service, cancel).await;
            }));
            info!(socket = %path.display(), "allocation service unix socket ready");
        }

        info!(%tcp_addr, "allocation service listening");
        Ok(Self {
            tcp_addr,
            join_handles,
            cancel_token,
            socket_path,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.tcp_addr
    }

    /// Stop accepting and drain connection tasks.
    pub async fn shutdown(self) {
        info!("shutting down allocation service");
        self.cancel_token.cancel();
        for handle in self.join_handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "allocation service task panicked");
            }
        }
        if let Some(path) = self.socket_path {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

async fn run_tcp_listener(
    listener: TcpListener,
    service: Arc<AllocationService>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let service = service.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_stream(stream, service, cancel).await {
                                debug!(error = %err, "service connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "failed to accept service connection"),
                }
            }
        }
    }
}

async fn run_unix_listener(
    listener: UnixListener,
    service: Arc<AllocationService>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let service = service.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_stream(stream, service, cancel).await {
                                debug!(error = %err, "service connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "failed to accept unix connection"),
                }
            }
        }
    }
}

async fn serve_stream<S>(
    stream: S,
    service: Arc<AllocationService>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, service_codec());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else { return Ok(()) };
        let frame = frame.context("failed to read service frame")?;

        let response = match postcard::from_bytes::<ServiceRequest>(&frame) {
            Ok(request) => service.handle(request).await,
            Err(err) => ServiceResponse::error(
                ServiceErrorKind::InvalidRequest,
                format!("failed to decode request: {err}"),
            ),
        };

        let bytes = postcard::to_stdvec(&response).context("failed to serialize response")?;
        framed.send(bytes.into()).await.context("failed to write response")?;
    }
}
