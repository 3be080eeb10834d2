//! IPv4 block allocator.
//!
//! A block is a CIDR assigned to one node. The network and broadcast
//! addresses are never representable: bitmap position 0 maps to
//! `network + 1` and position `total - 1` maps to `broadcast - 1`, so a
//! /24 hands out the 254 addresses `.1` through `.254`.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::allocator::bitmap::Bitmap;
use crate::error::{
    InvalidCidrSnafu, IpNotInBlockSnafu, IpamError, NoAvailableIpSnafu, NoUsableIpsSnafu,
};

/// Fraction of a block that must remain free before the owner should
/// pre-provision another block: pressure holds when `available < total / 5`.
pub const PRESSURE_FRACTION: (usize, usize) = (1, 5);

/// A CIDR-scoped IPv4 allocator owned by a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    cidr: Ipv4Net,
    node_id: String,
    total: usize,
    used: usize,
    bitmap: Bitmap,
}

impl Block {
    /// Create an empty block for `node_id`.
    ///
    /// Fails with `NoUsableIps` when the prefix leaves fewer than one
    /// usable address after reserving network and broadcast (prefix ≥ 31).
    pub fn new(cidr: Ipv4Net, node_id: impl Into<String>) -> Result<Self, IpamError> {
        let host_bits = 32 - cidr.prefix_len() as u32;
        ensure!(
            host_bits >= 2,
            NoUsableIpsSnafu {
                cidr: cidr.to_string()
            }
        );

        let total = (1usize << host_bits) - 2;
        Ok(Self {
            cidr,
            node_id: node_id.into(),
            total,
            used: 0,
            bitmap: Bitmap::new(total),
        })
    }

    /// Parse a CIDR string and build a block from it.
    pub fn from_cidr(cidr: &str, node_id: impl Into<String>) -> Result<Self, IpamError> {
        let net: Ipv4Net = cidr.parse().map_err(|err: ipnet::AddrParseError| {
            InvalidCidrSnafu {
                cidr: cidr.to_string(),
                reason: err.to_string(),
            }
            .build()
        })?;
        Self::new(net.trunc(), node_id)
    }

    /// Hand out the lowest free address.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, IpamError> {
        let pos = self.bitmap.first_zero().ok_or_else(|| {
            NoAvailableIpSnafu {
                cidr: self.cidr.to_string(),
            }
            .build()
        })?;
        self.bitmap.set(pos)?;
        self.used += 1;
        Ok(self.position_to_ip(pos))
    }

    /// Return an address to the block.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<(), IpamError> {
        ensure!(
            self.cidr.contains(&ip),
            IpNotInBlockSnafu {
                ip: std::net::IpAddr::V4(ip),
                cidr: self.cidr.to_string()
            }
        );

        let pos = self.ip_to_position(ip).ok_or_else(|| {
            IpNotInBlockSnafu {
                ip: std::net::IpAddr::V4(ip),
                cidr: self.cidr.to_string(),
            }
            .build()
        })?;
        self.bitmap.clear(pos)?;
        self.used -= 1;
        Ok(())
    }

    /// Whether `ip` is inside this block and currently allocated.
    pub fn contains_allocated(&self, ip: Ipv4Addr) -> bool {
        if !self.cidr.contains(&ip) {
            return false;
        }
        match self.ip_to_position(ip) {
            Some(pos) => self.bitmap.is_set(pos),
            None => false,
        }
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.total - self.used
    }

    pub fn is_full(&self) -> bool {
        self.used == self.total
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Usage ratio in `[0, 1]`.
    pub fn usage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64
    }

    /// The pre-provisioning signal: fewer than 20% of addresses left.
    pub fn under_pressure(&self) -> bool {
        let (num, den) = PRESSURE_FRACTION;
        self.available() * den < self.total * num
    }

    /// First usable address, conventionally used as the gateway.
    pub fn gateway(&self) -> Ipv4Addr {
        self.position_to_ip(0)
    }

    fn position_to_ip(&self, pos: usize) -> Ipv4Addr {
        let network = u32::from(self.cidr.network());
        Ipv4Addr::from(network + pos as u32 + 1)
    }

    fn ip_to_position(&self, ip: Ipv4Addr) -> Option<usize> {
        let offset = u32::from(ip).checked_sub(u32::from(self.cidr.network()))?;
        let pos = (offset as usize).checked_sub(1)?;
        if pos >= self.total {
            // Network itself (offset 0) or the broadcast address.
            return None;
        }
        Some(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(cidr: &str) -> Block {
        Block::from_cidr(cidr, "n1").unwrap()
    }

    #[test]
    fn slash24_has_254_usable() {
        let b = block("10.244.1.0/24");
        assert_eq!(b.total(), 254);
        assert_eq!(b.available(), 254);
        assert!(b.is_empty());
    }

    #[test]
    fn prefix_31_and_32_rejected() {
        assert!(matches!(
            Block::from_cidr("10.0.0.0/31", "n1"),
            Err(IpamError::NoUsableIps { .. })
        ));
        assert!(matches!(
            Block::from_cidr("10.0.0.1/32", "n1"),
            Err(IpamError::NoUsableIps { .. })
        ));
    }

    #[test]
    fn first_allocation_is_network_plus_one() {
        let mut b = block("10.244.1.0/24");
        assert_eq!(b.allocate().unwrap(), "10.244.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b.allocate().unwrap(), "10.244.1.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b.used(), 2);
    }

    #[test]
    fn fills_to_broadcast_minus_one() {
        let mut b = block("10.0.0.0/30");
        assert_eq!(b.total(), 2);
        assert_eq!(b.allocate().unwrap(), "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b.allocate().unwrap(), "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert!(b.is_full());
        assert!(matches!(b.allocate(), Err(IpamError::NoAvailableIp { .. })));
    }

    #[test]
    fn release_reuses_lowest_hole() {
        let mut b = block("10.244.1.0/24");
        let first = b.allocate().unwrap();
        let _second = b.allocate().unwrap();
        b.release(first).unwrap();
        // first-zero picks the freed hole back up
        assert_eq!(b.allocate().unwrap(), first);
    }

    #[test]
    fn release_network_broadcast_and_foreign_ips_fail() {
        let mut b = block("10.244.1.0/24");
        assert!(matches!(
            b.release("10.244.1.0".parse().unwrap()),
            Err(IpamError::IpNotInBlock { .. })
        ));
        assert!(matches!(
            b.release("10.244.1.255".parse().unwrap()),
            Err(IpamError::IpNotInBlock { .. })
        ));
        assert!(matches!(
            b.release("10.9.9.9".parse().unwrap()),
            Err(IpamError::IpNotInBlock { .. })
        ));
    }

    #[test]
    fn release_unallocated_fails() {
        let mut b = block("10.244.1.0/24");
        assert!(matches!(
            b.release("10.244.1.7".parse().unwrap()),
            Err(IpamError::BitAlreadyClear { .. })
        ));
    }

    #[test]
    fn pressure_signal_at_twenty_percent() {
        let mut b = block("10.244.1.0/24");
        for _ in 0..204 {
            b.allocate().unwrap();
        }
        // 50 of 254 left
        assert!(b.under_pressure());

        let mut fresh = block("10.244.2.0/24");
        for _ in 0..200 {
            fresh.allocate().unwrap();
        }
        // 54 of 254 left: not yet
        assert!(!fresh.under_pressure());
    }

    #[test]
    fn contains_allocated_tracks_state() {
        let mut b = block("10.244.1.0/24");
        let ip = b.allocate().unwrap();
        assert!(b.contains_allocated(ip));
        b.release(ip).unwrap();
        assert!(!b.contains_allocated(ip));
        assert!(!b.contains_allocated("10.244.1.0".parse().unwrap()));
    }

    #[test]
    fn gateway_is_first_usable() {
        let b = block("10.244.3.0/24");
        assert_eq!(b.gateway(), "10.244.3.1".parse::<Ipv4Addr>().unwrap());
    }
}
