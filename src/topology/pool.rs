//! Topology-aware pool: routes allocations node → TOR → subnet pool.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{
    DuplicateSubnetSnafu, InvalidCidrSnafu, IpamError, SubnetPoolNotFoundSnafu, TorNotFoundSnafu,
};
use crate::topology::subnet::{
    Allocation, AllocationMeta, SubnetPool, SubnetPoolStats, SubnetStats,
};
use crate::topology::{Node, Pod, Topology, Tor, Zone};

/// Declarative description of a full topology, as accepted by the
/// `InitTopology` command and the operator config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub subnet_ranges: Vec<String>,
    #[serde(default)]
    pub pods: Vec<PodConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub subnet_ranges: Vec<String>,
    #[serde(default)]
    pub tors: Vec<TorConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub subnets: Vec<SubnetConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub cidr: String,
    pub purpose: String,
}

/// Pool-wide statistics for the topology variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyPoolStats {
    pub zone_count: usize,
    pub pod_count: usize,
    pub tor_count: usize,
    pub node_count: usize,
    pub total_subnets: usize,
    pub total_capacity: usize,
    pub total_used: usize,
    pub total_available: usize,
    pub tor_stats: BTreeMap<String, SubnetPoolStats>,
}

/// Detailed view of one node's allocation standing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatsDetail {
    pub node_id: String,
    pub path: String,
    pub tor_id: String,
    pub allocated_ips: usize,
    pub tor_capacity: usize,
    pub tor_used: usize,
    pub tor_available: usize,
    pub subnet_stats: BTreeMap<String, SubnetStats>,
}

/// The topology-aware pool: the tree plus one [`SubnetPool`] per TOR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyPool {
    topology: Topology,
    subnet_pools: BTreeMap<String, SubnetPool>,
    /// Every subnet CIDR in the pool, across all TORs.
    subnet_cidrs: BTreeSet<Ipv4Net>,
}

impl TopologyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the full tree from a nested description.
    ///
    /// Fails when a parent is unknown at the moment its child is
    /// introduced, or when any subnet CIDR duplicates one already in the
    /// pool. Applied through consensus, the same config either fully
    /// applies or fully fails on every replica.
    pub fn init_topology(&mut self, config: &TopologyConfig) -> Result<(), IpamError> {
        for zone_cfg in &config.zones {
            self.topology.add_zone(Zone {
                id: zone_cfg.id.clone(),
                name: zone_cfg.name.clone(),
                subnet_ranges: zone_cfg.subnet_ranges.clone(),
            })?;

            for pod_cfg in &zone_cfg.pods {
                self.topology.add_pod(Pod {
                    id: pod_cfg.id.clone(),
                    name: pod_cfg.name.clone(),
                    zone_id: zone_cfg.id.clone(),
                    subnet_ranges: pod_cfg.subnet_ranges.clone(),
                })?;

                for tor_cfg in &pod_cfg.tors {
                    self.topology.add_tor(Tor {
                        id: tor_cfg.id.clone(),
                        name: tor_cfg.name.clone(),
                        pod_id: pod_cfg.id.clone(),
                        location: tor_cfg.location.clone(),
                    })?;

                    let mut pool = SubnetPool::new(tor_cfg.id.clone());
                    for subnet_cfg in &tor_cfg.subnets {
                        let cidr = parse_subnet_cidr(&subnet_cfg.cidr)?;
                        ensure!(
                            !self.subnet_cidrs.contains(&cidr),
                            DuplicateSubnetSnafu {
                                cidr: cidr.to_string(),
                                tor_id: &tor_cfg.id
                            }
                        );
                        pool.add_subnet(cidr, subnet_cfg.purpose.clone())?;
                        self.subnet_cidrs.insert(cidr);
                    }
                    self.subnet_pools.insert(tor_cfg.id.clone(), pool);
                }
            }
        }
        Ok(())
    }

    /// Register a host under an existing TOR.
    pub fn register_node(
        &mut self,
        node_id: &str,
        name: &str,
        tor_id: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<(), IpamError> {
        self.topology.register_node(Node {
            id: node_id.to_string(),
            name: name.to_string(),
            tor_id: tor_id.to_string(),
            labels,
        })
    }

    /// Allocate an address for a workload on `node_id`, routed through the
    /// node's TOR and the requested purpose.
    pub fn allocate_ip(
        &mut self,
        node_id: &str,
        purpose: &str,
        meta: &AllocationMeta,
    ) -> Result<(Ipv4Addr, Ipv4Net), IpamError> {
        let tor_id = self.topology.node_tor(node_id)?.id.clone();
        let pool = self
            .subnet_pools
            .get_mut(&tor_id)
            .ok_or_else(|| SubnetPoolNotFoundSnafu { tor_id: &tor_id }.build())?;
        pool.allocate(node_id, purpose, meta)
    }

    /// Release an address; it returns to the same pool it came from
    /// because resolution runs node → TOR on both paths.
    pub fn release_ip(&mut self, node_id: &str, ip: Ipv4Addr) -> Result<Allocation, IpamError> {
        let tor_id = self.topology.node_tor(node_id)?.id.clone();
        let pool = self
            .subnet_pools
            .get_mut(&tor_id)
            .ok_or_else(|| SubnetPoolNotFoundSnafu { tor_id: &tor_id }.build())?;
        pool.release(ip)
    }

    /// Grow a TOR's pool by one subnet.
    pub fn add_subnet_to_tor(
        &mut self,
        tor_id: &str,
        cidr: &str,
        purpose: &str,
    ) -> Result<(), IpamError> {
        ensure!(self.topology.has_tor(tor_id), TorNotFoundSnafu { tor_id });
        let cidr = parse_subnet_cidr(cidr)?;
        ensure!(
            !self.subnet_cidrs.contains(&cidr),
            DuplicateSubnetSnafu {
                cidr: cidr.to_string(),
                tor_id
            }
        );
        let pool = self
            .subnet_pools
            .get_mut(tor_id)
            .ok_or_else(|| SubnetPoolNotFoundSnafu { tor_id }.build())?;
        pool.add_subnet(cidr, purpose)?;
        self.subnet_cidrs.insert(cidr);
        Ok(())
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn subnet_pool(&self, tor_id: &str) -> Option<&SubnetPool> {
        self.subnet_pools.get(tor_id)
    }

    pub fn node_path(&self, node_id: &str) -> Result<String, IpamError> {
        self.topology.node_path(node_id)
    }

    pub fn stats(&self) -> TopologyPoolStats {
        let topo = self.topology.stats();
        let mut stats = TopologyPoolStats {
            zone_count: topo.zone_count,
            pod_count: topo.pod_count,
            tor_count: topo.tor_count,
            node_count: topo.node_count,
            ..Default::default()
        };
        for (tor_id, pool) in &self.subnet_pools {
            let pool_stats = pool.stats();
            stats.total_subnets += pool_stats.subnet_count;
            stats.total_capacity += pool_stats.total_capacity;
            stats.total_used += pool_stats.total_used;
            stats.total_available += pool_stats.total_available;
            stats.tor_stats.insert(tor_id.clone(), pool_stats);
        }
        stats
    }

    pub fn node_stats(&self, node_id: &str) -> Result<NodeStatsDetail, IpamError> {
        let tor = self.topology.node_tor(node_id)?;
        let path = self.topology.node_path(node_id)?;
        let pool = self
            .subnet_pools
            .get(&tor.id)
            .ok_or_else(|| SubnetPoolNotFoundSnafu { tor_id: &tor.id }.build())?;
        let pool_stats = pool.stats();
        let allocated_ips = pool
            .list_allocations()
            .iter()
            .filter(|a| a.node_id == node_id)
            .count();

        Ok(NodeStatsDetail {
            node_id: node_id.to_string(),
            path,
            tor_id: tor.id.clone(),
            allocated_ips,
            tor_capacity: pool_stats.total_capacity,
            tor_used: pool_stats.total_used,
            tor_available: pool_stats.total_available,
            subnet_stats: pool_stats.subnet_stats,
        })
    }
}

fn parse_subnet_cidr(cidr: &str) -> Result<Ipv4Net, IpamError> {
    let net: Ipv4Net = cidr.parse().map_err(|err: ipnet::AddrParseError| {
        InvalidCidrSnafu {
            cidr: cidr.to_string(),
            reason: err.to_string(),
        }
        .build()
    })?;
    Ok(net.trunc())
}
