//! Prometheus metrics and the HTTP exporter.
//!
//! The collector task reads pool snapshots from the locally applied state
//! on an interval; it never sits between a client and the apply path, so
//! scraping can't slow replication down.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::raft::node::RaftNode;
use crate::raft::storage::IpamStateMachine;
use crate::store::MappingStore;

/// How often the collector refreshes pool gauges.
pub const COLLECT_INTERVAL: Duration = Duration::from_secs(15);

/// All IPAM metrics, registered against one registry.
pub struct IpamMetrics {
    registry: Registry,

    pub ip_allocations: IntCounter,
    pub ip_releases: IntCounter,
    pub ip_allocation_errors: IntCounter,
    pub block_allocations: IntCounter,
    pub block_releases: IntCounter,

    pub allocation_duration: Histogram,
    pub release_duration: Histogram,

    pub available_ips: IntGaugeVec,
    pub used_ips: IntGaugeVec,
    pub total_ips: IntGaugeVec,
    pub blocks_per_node: IntGaugeVec,
    pub block_usage: GaugeVec,

    pub raft_is_leader: IntGauge,
    pub raft_term: IntGauge,
    pub raft_last_log_index: IntGauge,

    pub store_mappings: IntGauge,
}

impl IpamMetrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let ip_allocations = IntCounter::new(
            "ipam_ip_allocations_total",
            "Total number of IP allocations",
        )?;
        let ip_releases =
            IntCounter::new("ipam_ip_releases_total", "Total number of IP releases")?;
        let ip_allocation_errors = IntCounter::new(
            "ipam_ip_allocation_errors_total",
            "Total number of failed IP allocations",
        )?;
        let block_allocations = IntCounter::new(
            "ipam_block_allocations_total",
            "Total number of block allocations",
        )?;
        let block_releases =
            IntCounter::new("ipam_block_releases_total", "Total number of block releases")?;

        let allocation_duration = Histogram::with_opts(HistogramOpts::new(
            "ipam_allocation_duration_seconds",
            "IP allocation duration in seconds",
        ))?;
        let release_duration = Histogram::with_opts(HistogramOpts::new(
            "ipam_release_duration_seconds",
            "IP release duration in seconds",
        ))?;

        let available_ips = IntGaugeVec::new(
            Opts::new("ipam_available_ips", "Available IPs per node"),
            &["node_id"],
        )?;
        let used_ips = IntGaugeVec::new(
            Opts::new("ipam_used_ips", "Used IPs per node"),
            &["node_id"],
        )?;
        let total_ips = IntGaugeVec::new(
            Opts::new("ipam_total_ips", "Total IPs per node"),
            &["node_id"],
        )?;
        let blocks_per_node = IntGaugeVec::new(
            Opts::new("ipam_blocks_per_node", "Blocks assigned per node"),
            &["node_id"],
        )?;
        let block_usage = GaugeVec::new(
            Opts::new("ipam_block_usage", "Usage ratio per block"),
            &["node_id", "cidr"],
        )?;

        let raft_is_leader = IntGauge::new(
            "ipam_raft_is_leader",
            "1 when this replica is the consensus leader",
        )?;
        let raft_term = IntGauge::new("ipam_raft_term", "Current raft term")?;
        let raft_last_log_index =
            IntGauge::new("ipam_raft_last_log_index", "Last raft log index")?;

        let store_mappings = IntGauge::new(
            "ipam_store_mappings",
            "Container-to-IP mappings in the local store",
        )?;

        registry.register(Box::new(ip_allocations.clone()))?;
        registry.register(Box::new(ip_releases.clone()))?;
        registry.register(Box::new(ip_allocation_errors.clone()))?;
        registry.register(Box::new(block_allocations.clone()))?;
        registry.register(Box::new(block_releases.clone()))?;
        registry.register(Box::new(allocation_duration.clone()))?;
        registry.register(Box::new(release_duration.clone()))?;
        registry.register(Box::new(available_ips.clone()))?;
        registry.register(Box::new(used_ips.clone()))?;
        registry.register(Box::new(total_ips.clone()))?;
        registry.register(Box::new(blocks_per_node.clone()))?;
        registry.register(Box::new(block_usage.clone()))?;
        registry.register(Box::new(raft_is_leader.clone()))?;
        registry.register(Box::new(raft_term.clone()))?;
        registry.register(Box::new(raft_last_log_index.clone()))?;
        registry.register(Box::new(store_mappings.clone()))?;

        Ok(Arc::new(Self {
            registry,
            ip_allocations,
            ip_releases,
            ip_allocation_errors,
            block_allocations,
            block_releases,
            allocation_duration,
            release_duration,
            available_ips,
            used_ips,
            total_ips,
            blocks_per_node,
            block_usage,
            raft_is_leader,
            raft_term,
            raft_last_log_index,
            store_mappings,
        }))
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %err, "failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Periodic gauge refresher. Reads bounded snapshots of applied state.
pub struct MetricsCollector {
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl MetricsCollector {
    pub fn spawn(
        metrics: Arc<IpamMetrics>,
        state_machine: Arc<IpamStateMachine>,
        raft: Option<Arc<RaftNode>>,
        store: Option<Arc<MappingStore>>,
        interval: Duration,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let cancel = cancel_token.clone();

        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        collect_once(&metrics, &state_machine, raft.as_deref(), store.as_deref()).await;
                    }
                }
            }
        });

        Self {
            join_handle,
            cancel_token,
        }
    }

    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        if let Err(err) = self.join_handle.await {
            warn!(error = %err, "metrics collector task panicked");
        }
    }
}

async fn collect_once(
    metrics: &IpamMetrics,
    state_machine: &IpamStateMachine,
    raft: Option<&RaftNode>,
    store: Option<&MappingStore>,
) {
    let stats = state_machine.flat_stats().await;
    for (node_id, node) in &stats.node_stats {
        metrics
            .available_ips
            .with_label_values(&[node_id])
            .set(node.available_ips as i64);
        metrics
            .used_ips
            .with_label_values(&[node_id])
            .set(node.used_ips as i64);
        metrics
            .total_ips
            .with_label_values(&[node_id])
            .set(node.total_ips as i64);
        metrics
            .blocks_per_node
            .with_label_values(&[node_id])
            .set(node.blocks as i64);
    }

    let blocks = state_machine
        .with_state(|state| {
            stats
                .node_stats
                .keys()
                .filter_map(|node| state.flat.node_blocks(node).ok())
                .flatten()
                .collect::<Vec<_>>()
        })
        .await;
    for block in blocks {
        let usage = if block.total == 0 {
            0.0
        } else {
            block.used as f64 / block.total as f64
        };
        metrics
            .block_usage
            .with_label_values(&[&block.node_id, &block.cidr.to_string()])
            .set(usage);
    }

    if let Some(raft) = raft {
        let raft_metrics = raft.metrics();
        metrics.raft_is_leader.set(i64::from(raft.is_leader()));
        metrics.raft_term.set(raft_metrics.current_term as i64);
        metrics
            .raft_last_log_index
            .set(raft_metrics.last_log_index.unwrap_or(0) as i64);
    }

    if let Some(store) = store {
        match store.stats() {
            Ok(stats) => metrics.store_mappings.set(stats.total_mappings as i64),
            Err(err) => warn!(error = %err, "failed to read store stats"),
        }
    }
}

/// HTTP exporter serving `/metrics` and `/healthz`.
pub struct MetricsServer {
    local_addr: std::net::SocketAddr,
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl MetricsServer {
    pub async fn spawn(bind_addr: &str, metrics: Arc<IpamMetrics>) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel_token = CancellationToken::new();
        let cancel = cancel_token.clone();

        let app = Router::new()
            .route("/metrics", get(serve_metrics))
            .route("/healthz", get(serve_healthz))
            .with_state(metrics);

        let join_handle = tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %err, "metrics server failed");
            }
        });

        info!(%local_addr, "metrics server listening");
        Ok(Self {
            local_addr,
            join_handle,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        if let Err(err) = self.join_handle.await {
            warn!(error = %err, "metrics server task panicked");
        }
    }
}

async fn serve_metrics(State(metrics): State<Arc<IpamMetrics>>) -> (StatusCode, String) {
    (StatusCode::OK, metrics.render())
}

async fn serve_healthz() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    #[test]
    fn counters_show_up_in_render() {
        let metrics = IpamMetrics::new().unwrap();
        metrics.ip_allocations.inc();
        metrics.ip_allocations.inc();
        metrics.available_ips.with_label_values(&["n1"]).set(254);

        let body = metrics.render();
        assert!(body.contains("ipam_ip_allocations_total 2"));
        assert!(body.contains("ipam_available_ips{node_id=\"n1\"} 254"));
    }

    #[tokio::test]
    async fn collector_reads_pool_snapshot_without_blocking_apply() {
        let metrics = IpamMetrics::new().unwrap();
        let sm = IpamStateMachine::new(Pool::new("10.244.0.0/16", 24).unwrap());

        collect_once(&metrics, &sm, None, None).await;
        let body = metrics.render();
        assert!(body.contains("ipam_ip_allocations_total"));
        assert!(!body.contains("node_id=\"n1\""));
    }
}
