//! Flat pool: a cluster CIDR partitioned into equal-sized blocks that are
//! assigned to nodes on demand.
//!
//! Block numbering is by starting address, and every search walks indices
//! ascending, so identical command sequences produce identical assignments
//! on every replica. All containers are ordered; nothing here iterates a
//! hash map.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::allocator::Block;
use crate::error::{
    BlockInUseSnafu, BlockNotFoundSnafu, CidrExhaustedSnafu, InvalidCidrSnafu, IpamError,
    NodeNotFoundSnafu,
};

/// Summary of one block, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub cidr: Ipv4Net,
    pub node_id: String,
    pub total: usize,
    pub used: usize,
    pub available: usize,
    pub under_pressure: bool,
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        Self {
            cidr: block.cidr(),
            node_id: block.node_id().to_string(),
            total: block.total(),
            used: block.used(),
            available: block.available(),
            under_pressure: block.under_pressure(),
        }
    }
}

/// Per-node aggregate statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBlockStats {
    pub blocks: usize,
    pub total_ips: usize,
    pub used_ips: usize,
    pub available_ips: usize,
}

/// Pool-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_nodes: usize,
    pub total_blocks: usize,
    pub total_ips: usize,
    pub used_ips: usize,
    pub available_ips: usize,
    pub node_stats: BTreeMap<String, NodeBlockStats>,
}

/// The flat, topology-unaware pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    cluster: Ipv4Net,
    block_prefix: u8,
    /// Node id → blocks in assignment order.
    node_blocks: BTreeMap<String, Vec<Block>>,
    /// Every assigned block CIDR, for O(log n) conflict checks.
    allocated: BTreeSet<Ipv4Net>,
}

impl Pool {
    /// Create a pool that cuts `cluster_cidr` into `/block_prefix` blocks.
    pub fn new(cluster_cidr: &str, block_prefix: u8) -> Result<Self, IpamError> {
        let cluster: Ipv4Net = cluster_cidr.parse().map_err(|err: ipnet::AddrParseError| {
            InvalidCidrSnafu {
                cidr: cluster_cidr.to_string(),
                reason: err.to_string(),
            }
            .build()
        })?;
        let cluster = cluster.trunc();

        ensure!(
            block_prefix > cluster.prefix_len() && block_prefix <= 32,
            InvalidCidrSnafu {
                cidr: cluster_cidr.to_string(),
                reason: format!(
                    "block prefix /{} not inside cluster prefix /{}",
                    block_prefix,
                    cluster.prefix_len()
                ),
            }
        );

        Ok(Self {
            cluster,
            block_prefix,
            node_blocks: BTreeMap::new(),
            allocated: BTreeSet::new(),
        })
    }

    pub fn cluster_cidr(&self) -> Ipv4Net {
        self.cluster
    }

    pub fn block_prefix(&self) -> u8 {
        self.block_prefix
    }

    /// Assign the lowest-numbered free block to `node_id`.
    pub fn allocate_block_for_node(&mut self, node_id: &str) -> Result<&Block, IpamError> {
        let cidr = self.find_available_block()?;
        self.install_block(node_id, cidr)
    }

    /// Release an empty block owned by `node_id`.
    ///
    /// Releasing a CIDR the node does not own fails with `BlockNotFound`;
    /// a block with live addresses fails with `BlockInUse`.
    pub fn release_block_for_node(
        &mut self,
        node_id: &str,
        cidr: Ipv4Net,
    ) -> Result<(), IpamError> {
        let blocks = self
            .node_blocks
            .get_mut(node_id)
            .ok_or_else(|| NodeNotFoundSnafu { node_id }.build())?;

        let idx = blocks
            .iter()
            .position(|b| b.cidr() == cidr)
            .ok_or_else(|| BlockNotFoundSnafu { node_id }.build())?;

        ensure!(
            blocks[idx].is_empty(),
            BlockInUseSnafu {
                cidr: cidr.to_string(),
                used: blocks[idx].used()
            }
        );

        blocks.remove(idx);
        self.allocated.remove(&cidr);
        Ok(())
    }

    /// Blocks currently assigned to a node, in assignment order.
    pub fn node_blocks(&self, node_id: &str) -> Result<Vec<BlockInfo>, IpamError> {
        let blocks = self
            .node_blocks
            .get(node_id)
            .ok_or_else(|| NodeNotFoundSnafu { node_id }.build())?;
        Ok(blocks.iter().map(BlockInfo::from).collect())
    }

    /// Allocate an address for a workload on `node_id`.
    ///
    /// Walks the node's blocks in assignment order and takes the first
    /// free position; assigns a fresh block when the node has none or all
    /// are full. Returns the address and the block it came from.
    pub fn allocate_ip_for_node(
        &mut self,
        node_id: &str,
    ) -> Result<(Ipv4Addr, BlockInfo), IpamError> {
        if self.node_blocks.get(node_id).is_none_or(|b| b.is_empty()) {
            let cidr = self.find_available_block()?;
            self.install_block(node_id, cidr)?;
        }

        let blocks = self
            .node_blocks
            .get_mut(node_id)
            .expect("node has at least one block");
        for block in blocks.iter_mut() {
            if !block.is_full() {
                let ip = block.allocate()?;
                return Ok((ip, BlockInfo::from(&*block)));
            }
        }

        // Every existing block is full; grow by one and allocate from it.
        let cidr = self.find_available_block()?;
        self.install_block(node_id, cidr)?;
        let blocks = self
            .node_blocks
            .get_mut(node_id)
            .expect("node has at least one block");
        let block = blocks
            .last_mut()
            .expect("freshly installed block");
        let ip = block.allocate()?;
        Ok((ip, BlockInfo::from(&*block)))
    }

    /// Return an address to whichever of the node's blocks contains it.
    pub fn release_ip(&mut self, ip: Ipv4Addr, node_id: &str) -> Result<(), IpamError> {
        let blocks = self
            .node_blocks
            .get_mut(node_id)
            .ok_or_else(|| NodeNotFoundSnafu { node_id }.build())?;

        for block in blocks.iter_mut() {
            if block.cidr().contains(&ip) {
                return block.release(ip);
            }
        }
        BlockNotFoundSnafu { node_id }.fail()
    }

    /// Pool-wide statistics. Iterates every block; intended for the read
    /// path, not the apply path.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total_nodes: self.node_blocks.len(),
            total_blocks: self.allocated.len(),
            ..Default::default()
        };

        for (node_id, blocks) in &self.node_blocks {
            let mut node = NodeBlockStats {
                blocks: blocks.len(),
                ..Default::default()
            };
            for block in blocks {
                node.total_ips += block.total();
                node.used_ips += block.used();
                node.available_ips += block.available();
            }
            stats.total_ips += node.total_ips;
            stats.used_ips += node.used_ips;
            stats.available_ips += node.available_ips;
            stats.node_stats.insert(node_id.clone(), node);
        }
        stats
    }

    /// Number of blocks the cluster CIDR can hold.
    pub fn capacity_blocks(&self) -> u64 {
        1u64 << (self.block_prefix - self.cluster.prefix_len())
    }

    /// Lowest-numbered block CIDR not yet assigned.
    fn find_available_block(&self) -> Result<Ipv4Net, IpamError> {
        let base = u32::from(self.cluster.network());
        let stride = 1u64 << (32 - self.block_prefix as u32);

        for index in 0..self.capacity_blocks() {
            let addr = Ipv4Addr::from(base + (index * stride) as u32);
            let cidr = Ipv4Net::new(addr, self.block_prefix)
                .expect("block prefix validated at construction");
            if !self.allocated.contains(&cidr) {
                return Ok(cidr);
            }
        }
        CidrExhaustedSnafu {
            cluster: self.cluster.to_string(),
        }
        .fail()
    }

    fn install_block(&mut self, node_id: &str, cidr: Ipv4Net) -> Result<&Block, IpamError> {
        let block = Block::new(cidr, node_id)?;
        self.allocated.insert(cidr);
        let blocks = self.node_blocks.entry(node_id.to_string()).or_default();
        blocks.push(block);
        Ok(blocks.last().expect("block just pushed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_assigned_lowest_first() {
        let mut pool = Pool::new("10.244.0.0/16", 24).unwrap();
        let b = pool.allocate_block_for_node("n1").unwrap();
        assert_eq!(b.cidr().to_string(), "10.244.0.0/24");
        assert_eq!(b.total(), 254);

        let b = pool.allocate_block_for_node("n2").unwrap();
        assert_eq!(b.cidr().to_string(), "10.244.1.0/24");
    }

    #[test]
    fn first_ip_and_reuse_after_release() {
        let mut pool = Pool::new("10.244.0.0/16", 24).unwrap();
        pool.allocate_block_for_node("n1").unwrap();

        let (ip, _) = pool.allocate_ip_for_node("n1").unwrap();
        assert_eq!(ip, "10.244.0.1".parse::<Ipv4Addr>().unwrap());
        let (ip2, _) = pool.allocate_ip_for_node("n1").unwrap();
        assert_eq!(ip2, "10.244.0.2".parse::<Ipv4Addr>().unwrap());

        pool.release_ip(ip, "n1").unwrap();
        let (ip3, _) = pool.allocate_ip_for_node("n1").unwrap();
        assert_eq!(ip3, ip);
    }

    #[test]
    fn allocate_ip_creates_first_block_on_demand() {
        let mut pool = Pool::new("10.244.0.0/16", 24).unwrap();
        let (ip, block) = pool.allocate_ip_for_node("fresh").unwrap();
        assert_eq!(ip, "10.244.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(block.cidr.to_string(), "10.244.0.0/24");
        assert_eq!(pool.node_blocks("fresh").unwrap().len(), 1);
    }

    #[test]
    fn exhaustion_after_four_small_blocks() {
        let mut pool = Pool::new("10.244.0.0/28", 30).unwrap();
        let expected = ["10.244.0.0/30", "10.244.0.4/30", "10.244.0.8/30", "10.244.0.12/30"];
        for want in expected {
            let b = pool.allocate_block_for_node("n1").unwrap();
            assert_eq!(b.cidr().to_string(), want);
        }
        assert!(matches!(
            pool.allocate_block_for_node("n1"),
            Err(IpamError::CidrExhausted { .. })
        ));
        // Exhaustion is sticky until a release.
        assert!(matches!(
            pool.allocate_block_for_node("n2"),
            Err(IpamError::CidrExhausted { .. })
        ));
        pool.release_block_for_node("n1", "10.244.0.4/30".parse().unwrap())
            .unwrap();
        let b = pool.allocate_block_for_node("n2").unwrap();
        assert_eq!(b.cidr().to_string(), "10.244.0.4/30");
    }

    #[test]
    fn rolls_to_new_block_when_full() {
        let mut pool = Pool::new("10.244.0.0/28", 30).unwrap();
        // /30 blocks hold two addresses each.
        let (a, _) = pool.allocate_ip_for_node("n1").unwrap();
        let (b, _) = pool.allocate_ip_for_node("n1").unwrap();
        let (c, info) = pool.allocate_ip_for_node("n1").unwrap();
        assert_eq!(a, "10.244.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b, "10.244.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(c, "10.244.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(info.cidr.to_string(), "10.244.0.4/30");
        assert_eq!(pool.node_blocks("n1").unwrap().len(), 2);
    }

    #[test]
    fn release_block_guards() {
        let mut pool = Pool::new("10.244.0.0/16", 24).unwrap();
        pool.allocate_block_for_node("n1").unwrap();
        let cidr: Ipv4Net = "10.244.0.0/24".parse().unwrap();

        assert!(matches!(
            pool.release_block_for_node("ghost", cidr),
            Err(IpamError::NodeNotFound { .. })
        ));
        assert!(matches!(
            pool.release_block_for_node("n1", "10.244.9.0/24".parse().unwrap()),
            Err(IpamError::BlockNotFound { .. })
        ));

        let (ip, _) = pool.allocate_ip_for_node("n1").unwrap();
        assert!(matches!(
            pool.release_block_for_node("n1", cidr),
            Err(IpamError::BlockInUse { .. })
        ));

        pool.release_ip(ip, "n1").unwrap();
        pool.release_block_for_node("n1", cidr).unwrap();
        assert!(pool.node_blocks("n1").unwrap().is_empty());
    }

    #[test]
    fn release_ip_requires_owning_block() {
        let mut pool = Pool::new("10.244.0.0/16", 24).unwrap();
        pool.allocate_block_for_node("n1").unwrap();
        assert!(matches!(
            pool.release_ip("10.250.0.1".parse().unwrap(), "n1"),
            Err(IpamError::BlockNotFound { .. })
        ));
    }

    #[test]
    fn stats_aggregate_per_node() {
        let mut pool = Pool::new("10.244.0.0/16", 24).unwrap();
        pool.allocate_block_for_node("n1").unwrap();
        pool.allocate_block_for_node("n2").unwrap();
        pool.allocate_ip_for_node("n1").unwrap();
        pool.allocate_ip_for_node("n1").unwrap();
        pool.allocate_ip_for_node("n2").unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.total_blocks, 2);
        assert_eq!(stats.total_ips, 508);
        assert_eq!(stats.used_ips, 3);
        assert_eq!(stats.available_ips, 505);
        assert_eq!(stats.node_stats["n1"].used_ips, 2);
        assert_eq!(stats.node_stats["n2"].used_ips, 1);
    }

    #[test]
    fn snapshot_roundtrip_preserves_assignments() {
        let mut pool = Pool::new("10.244.0.0/16", 24).unwrap();
        pool.allocate_block_for_node("n1").unwrap();
        let (ip, _) = pool.allocate_ip_for_node("n1").unwrap();

        let json = serde_json::to_string(&pool).unwrap();
        let mut restored: Pool = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, pool);

        // The restored pool continues from the same allocation cursor.
        restored.release_ip(ip, "n1").unwrap();
        let (again, _) = restored.allocate_ip_for_node("n1").unwrap();
        assert_eq!(again, ip);
    }
}
