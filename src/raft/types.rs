//! Replicated command and response types.
//!
//! Every mutating pool operation is one [`IpamRequest`] variant. Commands
//! are fully self-describing: given an identical prior pool state, applying
//! the same command yields the same mutation and the same [`IpamResponse`]
//! on every replica. Failures travel inside the response (`success:
//! false`), never as transport errors, so the consensus layer treats them
//! as ordinary committed entries.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use openraft::{declare_raft_types, BasicNode};
use serde::{Deserialize, Serialize};

use crate::error::IpamError;
use crate::topology::{AllocationMeta, TopologyConfig};

/// Raft node identifier.
pub type NodeId = u64;

/// Commands replicated through the consensus log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpamRequest {
    /// Assign the lowest free block of the flat pool to a node.
    AllocateBlock { node_id: String },
    /// Return an empty block to the flat pool.
    ReleaseBlock { node_id: String, cidr: String },
    /// Build the zone/pod/TOR tree and its subnet pools.
    InitTopology { config: TopologyConfig },
    /// Register a host under a TOR.
    RegisterNode {
        node_id: String,
        name: String,
        tor_id: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
    /// Allocate an address through the topology pool.
    AllocateIp {
        node_id: String,
        purpose: String,
        #[serde(default)]
        meta: AllocationMeta,
    },
    /// Release an address through the topology pool.
    ReleaseIp { node_id: String, ip: Ipv4Addr },
    /// Grow a TOR's pool by one subnet.
    AddSubnet {
        tor_id: String,
        cidr: String,
        purpose: String,
    },
    /// Allocate an address from the node's flat-pool blocks, creating the
    /// node's first block (or a follow-up block) when needed.
    AllocateNodeIp { node_id: String },
    /// Release a flat-pool address back to the block that contains it.
    ReleaseNodeIp { node_id: String, ip: Ipv4Addr },
}

impl fmt::Display for IpamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpamRequest::AllocateBlock { node_id } => write!(f, "AllocateBlock({node_id})"),
            IpamRequest::ReleaseBlock { node_id, cidr } => {
                write!(f, "ReleaseBlock({node_id}, {cidr})")
            }
            IpamRequest::InitTopology { config } => {
                write!(f, "InitTopology({} zones)", config.zones.len())
            }
            IpamRequest::RegisterNode { node_id, tor_id, .. } => {
                write!(f, "RegisterNode({node_id} @ {tor_id})")
            }
            IpamRequest::AllocateIp { node_id, purpose, .. } => {
                write!(f, "AllocateIp({node_id}, {purpose})")
            }
            IpamRequest::ReleaseIp { node_id, ip } => write!(f, "ReleaseIp({node_id}, {ip})"),
            IpamRequest::AddSubnet { tor_id, cidr, purpose } => {
                write!(f, "AddSubnet({tor_id}, {cidr}, {purpose})")
            }
            IpamRequest::AllocateNodeIp { node_id } => write!(f, "AllocateNodeIp({node_id})"),
            IpamRequest::ReleaseNodeIp { node_id, ip } => {
                write!(f, "ReleaseNodeIp({node_id}, {ip})")
            }
        }
    }
}

/// Per-command success payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseData {
    BlockGrant {
        cidr: Ipv4Net,
        node_id: String,
        total: usize,
        used: usize,
        available: usize,
    },
    BlockReleased {
        node_id: String,
        cidr: Ipv4Net,
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
    IpGrant {
        ip: Ipv4Addr,
        cidr: Ipv4Net,
        node_id: String,
        purpose: String,
    },
    IpReleased {
        ip: Ipv4Addr,
        node_id: String,
    },
    SubnetAdded {
        tor_id: String,
        cidr: Ipv4Net,
        purpose: String,
    },
    NodeIpGrant {
        ip: Ipv4Addr,
        node_id: String,
        block_cidr: Ipv4Net,
        gateway: Ipv4Addr,
        /// Fewer than 20% of the granting block's addresses remain; the
        /// caller should pre-emptively propose `AllocateBlock`.
        block_under_pressure: bool,
    },
    NodeIpReleased {
        ip: Ipv4Addr,
        node_id: String,
    },
}

/// Outcome of applying one committed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamResponse {
    pub success: bool,
    pub error: Option<String>,
    pub data: Option<ResponseData>,
}

impl IpamResponse {
    pub fn ok(data: ResponseData) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn err(err: &IpamError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            data: None,
        }
    }
}

// Blank and membership entries apply successfully with no payload.
impl Default for IpamResponse {
    fn default() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }
}

declare_raft_types!(
    /// Type configuration binding IPAM commands to the consensus engine.
    pub IpamTypeConfig:
        D = IpamRequest,
        R = IpamResponse,
        NodeId = NodeId,
        Node = BasicNode,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_roundtrip_through_json() {
        let cmd = IpamRequest::AllocateIp {
            node_id: "n1".into(),
            purpose: "storage".into(),
            meta: AllocationMeta {
                container_id: Some("ctr".into()),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"allocate_ip\""));
        let back: IpamRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_string(), cmd.to_string());
    }

    #[test]
    fn unknown_command_tag_is_rejected_at_decode() {
        let err = serde_json::from_str::<IpamRequest>(r#"{"type":"defragment_pool"}"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("defragment_pool"));
    }

    #[test]
    fn error_responses_carry_the_message() {
        let resp = IpamResponse::err(&IpamError::CidrExhausted {
            cluster: "10.244.0.0/16".into(),
        });
        assert!(!resp.success);
        assert!(resp.error.as_deref().unwrap().contains("exhausted"));
        assert!(resp.data.is_none());
    }
}
