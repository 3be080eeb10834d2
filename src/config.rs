//! Daemon configuration.
//!
//! Single source of truth for every tunable, loaded from environment
//! variables with sensible defaults and validated up front. Flags on the
//! binaries override the environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::raft::types::NodeId;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("invalid value for {key}: {value} ({reason})"))]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let value = env_or(key, default);
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
        reason: err.to_string(),
    })
}

/// Address-plan configuration for the flat pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Cluster-wide CIDR carved into node blocks, e.g. `10.244.0.0/16`.
    pub cluster_cidr: String,
    /// Prefix length of each node block, e.g. `24`.
    pub block_prefix: u8,
}

impl PoolConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            cluster_cidr: env_or("IPAM_CLUSTER_CIDR", "10.244.0.0/16"),
            block_prefix: env_parse("IPAM_BLOCK_PREFIX", "24")?,
        })
    }
}

/// Consensus configuration for this replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// This replica's id; unique across the cluster.
    pub node_id: NodeId,
    /// Bind address for raft peer RPC, e.g. `0.0.0.0:4710`.
    pub bind_addr: String,
    /// Peer id → address map, `1=host-a:4710,2=host-b:4710`.
    pub peers: HashMap<NodeId, String>,
    /// Bootstrap a fresh single-node cluster when set.
    pub bootstrap: bool,
    /// Wall-clock budget for commit + apply of one proposal.
    pub proposal_timeout: Duration,
}

impl RaftConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let peers_raw = env_or("IPAM_RAFT_PEERS", "");
        Ok(Self {
            node_id: env_parse("IPAM_NODE_ID", "1")?,
            bind_addr: env_or("IPAM_RAFT_BIND", "0.0.0.0:4710"),
            peers: parse_peers(&peers_raw)?,
            bootstrap: env_parse("IPAM_RAFT_BOOTSTRAP", "false")?,
            proposal_timeout: Duration::from_millis(env_parse(
                "IPAM_PROPOSAL_TIMEOUT_MS",
                "10000",
            )?),
        })
    }
}

fn parse_peers(raw: &str) -> Result<HashMap<NodeId, String>, ConfigError> {
    let mut peers = HashMap::new();
    for part in raw.split(',').filter(|p| !p.is_empty()) {
        let (id, addr) = part.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: "IPAM_RAFT_PEERS".into(),
            value: raw.to_string(),
            reason: format!("expected id=addr, got {part}"),
        })?;
        let id: NodeId = id.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: "IPAM_RAFT_PEERS".into(),
            value: raw.to_string(),
            reason: format!("peer id {id} is not a number"),
        })?;
        peers.insert(id, addr.trim().to_string());
    }
    Ok(peers)
}

/// Client-facing allocation service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// TCP bind address, e.g. `0.0.0.0:4720`.
    pub bind_addr: String,
    /// Unix domain socket path for same-host clients (CNI shim, CLI).
    pub socket_path: PathBuf,
}

impl ServiceConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: env_or("IPAM_SERVICE_BIND", "0.0.0.0:4720"),
            socket_path: PathBuf::from(env_or(
                "IPAM_SERVICE_SOCKET",
                "/run/tamarack/ipam.sock",
            )),
        })
    }
}

/// Local storage paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the mapping database.
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            data_dir: PathBuf::from(env_or("IPAM_DATA_DIR", "/var/lib/tamarack")),
        })
    }

    pub fn mapping_db_path(&self) -> PathBuf {
        self.data_dir.join("mappings.redb")
    }

    pub fn raft_log_path(&self) -> PathBuf {
        self.data_dir.join("raft-log.redb")
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

impl MetricsConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: env_or("IPAM_METRICS_BIND", "0.0.0.0:9464"),
        })
    }
}

/// The complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub pool: PoolConfig,
    pub raft: RaftConfig,
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

impl DaemonConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            pool: PoolConfig::load()?,
            raft: RaftConfig::load()?,
            service: ServiceConfig::load()?,
            storage: StorageConfig::load()?,
            metrics: MetricsConfig::load()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_list_parses() {
        let peers = parse_peers("1=host-a:4710, 2=host-b:4710").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[&1], "host-a:4710");
        assert_eq!(peers[&2], "host-b:4710");

        assert!(parse_peers("").unwrap().is_empty());
        assert!(parse_peers("banana").is_err());
        assert!(parse_peers("x=host:1").is_err());
    }
}
