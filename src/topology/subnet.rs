//! Purpose-tagged subnets and the per-TOR subnet pool.
//!
//! A subnet is a CIDR allocator like a block, but owned by a TOR rather
//! than a node, carrying a purpose label (`default`, `storage`,
//! `management`, ...) and a side table recording who holds each address.
//!
//! Subnet selection is deterministic: candidates are walked in ascending
//! CIDR order (the pool is a `BTreeMap`), never in hash order, so every
//! replica picks the same subnet for the same committed command.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::allocator::Bitmap;
use crate::error::{
    DuplicateSubnetSnafu, IpNotAllocatedSnafu, IpamError, NoAvailableIpSnafu,
    NoSubnetForPurposeSnafu, NoUsableIpsSnafu, SubnetOverlapSnafu,
};

/// The purpose every TOR is expected to carry and the fallback target for
/// requests whose own purpose has no capacity.
pub const DEFAULT_PURPOSE: &str = "default";

/// Who holds an address. Replicated state carries no wall-clock fields;
/// timestamps are stamped at the read boundary (mapping store, listings).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub ip: Ipv4Addr,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_namespace: Option<String>,
}

/// Workload identifiers attached to an allocation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationMeta {
    pub container_id: Option<String>,
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
}

/// A purpose-tagged CIDR allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    cidr: Ipv4Net,
    purpose: String,
    capacity: usize,
    used: usize,
    bitmap: Bitmap,
    allocations: BTreeMap<Ipv4Addr, Allocation>,
}

impl Subnet {
    pub fn new(cidr: Ipv4Net, purpose: impl Into<String>) -> Result<Self, IpamError> {
        let host_bits = 32 - cidr.prefix_len() as u32;
        ensure!(
            host_bits >= 2,
            NoUsableIpsSnafu {
                cidr: cidr.to_string()
            }
        );
        let capacity = (1usize << host_bits) - 2;
        Ok(Self {
            cidr,
            purpose: purpose.into(),
            capacity,
            used: 0,
            bitmap: Bitmap::new(capacity),
            allocations: BTreeMap::new(),
        })
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    /// First usable address, conventionally the gateway.
    pub fn gateway(&self) -> Ipv4Addr {
        self.position_to_ip(0)
    }

    pub fn allocation(&self, ip: Ipv4Addr) -> Option<&Allocation> {
        self.allocations.get(&ip)
    }

    /// Allocations in ascending address order.
    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }

    fn allocate(&mut self, node_id: &str, meta: &AllocationMeta) -> Result<Ipv4Addr, IpamError> {
        let pos = self.bitmap.first_zero().ok_or_else(|| {
            NoAvailableIpSnafu {
                cidr: self.cidr.to_string(),
            }
            .build()
        })?;
        self.bitmap.set(pos)?;
        let ip = self.position_to_ip(pos);
        self.used += 1;
        self.allocations.insert(
            ip,
            Allocation {
                ip,
                node_id: node_id.to_string(),
                container_id: meta.container_id.clone(),
                pod_name: meta.pod_name.clone(),
                pod_namespace: meta.pod_namespace.clone(),
            },
        );
        Ok(ip)
    }

    fn release(&mut self, ip: Ipv4Addr) -> Result<Allocation, IpamError> {
        ensure!(
            self.allocations.contains_key(&ip),
            IpNotAllocatedSnafu {
                ip: std::net::IpAddr::V4(ip)
            }
        );
        let pos = self
            .ip_to_position(ip)
            .expect("recorded allocation lies inside the subnet");
        self.bitmap.clear(pos)?;
        self.used -= 1;
        Ok(self
            .allocations
            .remove(&ip)
            .expect("presence checked above"))
    }

    fn position_to_ip(&self, pos: usize) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.cidr.network()) + pos as u32 + 1)
    }

    fn ip_to_position(&self, ip: Ipv4Addr) -> Option<usize> {
        let offset = u32::from(ip).checked_sub(u32::from(self.cidr.network()))?;
        let pos = (offset as usize).checked_sub(1)?;
        (pos < self.capacity).then_some(pos)
    }
}

/// Per-subnet statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetStats {
    pub cidr: Ipv4Net,
    pub purpose: String,
    pub capacity: usize,
    pub used: usize,
    pub available: usize,
}

/// Aggregate statistics for one TOR's pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubnetPoolStats {
    pub tor_id: String,
    pub subnet_count: usize,
    pub total_capacity: usize,
    pub total_used: usize,
    pub total_available: usize,
    pub subnet_stats: BTreeMap<String, SubnetStats>,
}

/// All subnets belonging to one TOR, keyed and iterated by CIDR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetPool {
    tor_id: String,
    subnets: BTreeMap<Ipv4Net, Subnet>,
}

impl SubnetPool {
    pub fn new(tor_id: impl Into<String>) -> Self {
        Self {
            tor_id: tor_id.into(),
            subnets: BTreeMap::new(),
        }
    }

    pub fn tor_id(&self) -> &str {
        &self.tor_id
    }

    /// Add a subnet. Duplicate and overlapping CIDRs are rejected.
    pub fn add_subnet(
        &mut self,
        cidr: Ipv4Net,
        purpose: impl Into<String>,
    ) -> Result<(), IpamError> {
        let cidr = cidr.trunc();
        ensure!(
            !self.subnets.contains_key(&cidr),
            DuplicateSubnetSnafu {
                cidr: cidr.to_string(),
                tor_id: self.tor_id.clone()
            }
        );
        if let Some(existing) = self
            .subnets
            .keys()
            .find(|s| s.contains(&cidr) || cidr.contains(*s))
        {
            return SubnetOverlapSnafu {
                cidr: cidr.to_string(),
                existing: existing.to_string(),
                tor_id: self.tor_id.clone(),
            }
            .fail();
        }

        self.subnets.insert(cidr, Subnet::new(cidr, purpose)?);
        Ok(())
    }

    /// Allocate an address for `node_id` with the requested purpose.
    ///
    /// Selection: the first subnet in ascending CIDR order whose purpose
    /// matches and has capacity; when none exists and the purpose is not
    /// `default`, the same search runs once more against `default`.
    /// `default` requests never fall back to other purposes.
    pub fn allocate(
        &mut self,
        node_id: &str,
        purpose: &str,
        meta: &AllocationMeta,
    ) -> Result<(Ipv4Addr, Ipv4Net), IpamError> {
        let chosen = self
            .pick_subnet(purpose)
            .or_else(|| {
                if purpose != DEFAULT_PURPOSE {
                    self.pick_subnet(DEFAULT_PURPOSE)
                } else {
                    None
                }
            })
            .ok_or_else(|| {
                NoSubnetForPurposeSnafu {
                    tor_id: self.tor_id.clone(),
                    purpose,
                }
                .build()
            })?;

        let subnet = self
            .subnets
            .get_mut(&chosen)
            .expect("picked subnet exists");
        let ip = subnet.allocate(node_id, meta)?;
        Ok((ip, chosen))
    }

    /// Release an address back to the subnet that contains it.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<Allocation, IpamError> {
        let subnet = self
            .subnets
            .values_mut()
            .find(|s| s.cidr().contains(&ip))
            .ok_or_else(|| {
                IpNotAllocatedSnafu {
                    ip: std::net::IpAddr::V4(ip),
                }
                .build()
            })?;
        subnet.release(ip)
    }

    pub fn allocation(&self, ip: Ipv4Addr) -> Option<&Allocation> {
        self.subnets
            .values()
            .find(|s| s.cidr().contains(&ip))
            .and_then(|s| s.allocation(ip))
    }

    /// Subnet containing `ip`, if any.
    pub fn subnet_for(&self, ip: Ipv4Addr) -> Option<&Subnet> {
        self.subnets.values().find(|s| s.cidr().contains(&ip))
    }

    pub fn subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.values()
    }

    /// Every allocation, ordered by subnet CIDR then address.
    pub fn list_allocations(&self) -> Vec<&Allocation> {
        self.subnets
            .values()
            .flat_map(|s| s.allocations())
            .collect()
    }

    pub fn stats(&self) -> SubnetPoolStats {
        let mut stats = SubnetPoolStats {
            tor_id: self.tor_id.clone(),
            subnet_count: self.subnets.len(),
            ..Default::default()
        };
        for subnet in self.subnets.values() {
            stats.total_capacity += subnet.capacity();
            stats.total_used += subnet.used();
            stats.total_available += subnet.available();
            stats.subnet_stats.insert(
                subnet.cidr().to_string(),
                SubnetStats {
                    cidr: subnet.cidr(),
                    purpose: subnet.purpose().to_string(),
                    capacity: subnet.capacity(),
                    used: subnet.used(),
                    available: subnet.available(),
                },
            );
        }
        stats
    }

    fn pick_subnet(&self, purpose: &str) -> Option<Ipv4Net> {
        self.subnets
            .values()
            .find(|s| s.purpose() == purpose && s.available() > 0)
            .map(|s| s.cidr())
    }
}
