//! IPv6 block allocator and the dual-stack composite.
//!
//! Small prefixes (≤ 32 host bits) behave exactly like the IPv4 block: a
//! bitmap with position 0 mapped to `network + 1` and the first and last
//! addresses reserved. Larger prefixes cannot be tracked bit-per-address;
//! those fall back to sequential hand-out where `release` decrements the
//! usage counter but **cannot recycle individual addresses**; callers that
//! need recycling must size their v6 subnets at /96 or longer.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::allocator::bitmap::Bitmap;
use crate::allocator::block::Block;
use crate::error::{
    InvalidCidrSnafu, IpNotInBlockSnafu, IpamError, NoAvailableIpSnafu, NoUsableIpsSnafu,
};

/// Host-bit width above which individual-address tracking is abandoned.
const BITMAP_HOST_BITS_MAX: u32 = 32;

/// Allocation strategy, decided once at construction from the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum V6Tracking {
    /// Bitmap identical to the IPv4 scheme; positions are recyclable.
    Bitmap(Bitmap),
    /// Monotonic counter; released addresses are not reused.
    Sequential,
}

/// A CIDR-scoped IPv6 allocator owned by a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Block {
    cidr: Ipv6Net,
    node_id: String,
    total: u64,
    used: u64,
    tracking: V6Tracking,
}

impl Ipv6Block {
    /// Create an empty v6 block for `node_id`.
    pub fn new(cidr: Ipv6Net, node_id: impl Into<String>) -> Result<Self, IpamError> {
        let host_bits = 128 - cidr.prefix_len() as u32;
        ensure!(
            host_bits >= 2,
            NoUsableIpsSnafu {
                cidr: cidr.to_string()
            }
        );

        let (total, tracking) = if host_bits <= BITMAP_HOST_BITS_MAX {
            let total = (1u64 << host_bits) - 2;
            (total, V6Tracking::Bitmap(Bitmap::new(total as usize)))
        } else {
            // Practical cap: a /64 has 2^64 addresses but no consumer
            // approaches 2^32 workloads on one node.
            (1u64 << 32, V6Tracking::Sequential)
        };

        Ok(Self {
            cidr,
            node_id: node_id.into(),
            total,
            used: 0,
            tracking,
        })
    }

    /// Parse a CIDR string and build a block from it.
    pub fn from_cidr(cidr: &str, node_id: impl Into<String>) -> Result<Self, IpamError> {
        let net: Ipv6Net = cidr.parse().map_err(|err: ipnet::AddrParseError| {
            InvalidCidrSnafu {
                cidr: cidr.to_string(),
                reason: err.to_string(),
            }
            .build()
        })?;
        Self::new(net.trunc(), node_id)
    }

    /// Hand out the next address.
    ///
    /// Bitmap blocks return the lowest free position; sequential blocks
    /// return `network + used + 1` and never look back.
    pub fn allocate(&mut self) -> Result<Ipv6Addr, IpamError> {
        match &mut self.tracking {
            V6Tracking::Bitmap(bitmap) => {
                let pos = bitmap.first_zero().ok_or_else(|| {
                    NoAvailableIpSnafu {
                        cidr: self.cidr.to_string(),
                    }
                    .build()
                })?;
                bitmap.set(pos)?;
                self.used += 1;
                Ok(self.offset_to_ip(pos as u128 + 1))
            }
            V6Tracking::Sequential => {
                ensure!(
                    self.used < self.total,
                    NoAvailableIpSnafu {
                        cidr: self.cidr.to_string()
                    }
                );
                let ip = self.offset_to_ip(self.used as u128 + 1);
                self.used += 1;
                Ok(ip)
            }
        }
    }

    /// Return an address to the block.
    ///
    /// Sequential blocks only decrement the usage counter; the specific
    /// address is not made reusable.
    pub fn release(&mut self, ip: Ipv6Addr) -> Result<(), IpamError> {
        ensure!(
            self.cidr.contains(&ip),
            IpNotInBlockSnafu {
                ip: std::net::IpAddr::V6(ip),
                cidr: self.cidr.to_string()
            }
        );

        match &mut self.tracking {
            V6Tracking::Bitmap(bitmap) => {
                let offset = u128::from(ip) - u128::from(self.cidr.network());
                let pos = offset.checked_sub(1).and_then(|p| {
                    if p < self.total as u128 {
                        Some(p as usize)
                    } else {
                        None
                    }
                });
                let pos = pos.ok_or_else(|| {
                    IpNotInBlockSnafu {
                        ip: std::net::IpAddr::V6(ip),
                        cidr: self.cidr.to_string(),
                    }
                    .build()
                })?;
                bitmap.clear(pos)?;
                self.used -= 1;
                Ok(())
            }
            V6Tracking::Sequential => {
                if self.used > 0 {
                    self.used -= 1;
                }
                Ok(())
            }
        }
    }

    pub fn cidr(&self) -> Ipv6Net {
        self.cidr
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn available(&self) -> u64 {
        self.total - self.used
    }

    /// Whether this block recycles released addresses.
    pub fn recycles_addresses(&self) -> bool {
        matches!(self.tracking, V6Tracking::Bitmap(_))
    }

    fn offset_to_ip(&self, offset: u128) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.cidr.network()) + offset)
    }
}

/// One IPv4 and one IPv6 block bound to the same node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualStackBlock {
    v4: Block,
    v6: Ipv6Block,
    node_id: String,
}

impl DualStackBlock {
    pub fn new(
        v4_cidr: &str,
        v6_cidr: &str,
        node_id: impl Into<String>,
    ) -> Result<Self, IpamError> {
        let node_id = node_id.into();
        let v4 = Block::from_cidr(v4_cidr, node_id.clone())?;
        let v6 = Ipv6Block::from_cidr(v6_cidr, node_id.clone())?;
        Ok(Self { v4, v6, node_id })
    }

    /// Allocate one address from each family, all or nothing.
    ///
    /// When the v6 side fails the v4 address is rolled back before the
    /// error is returned, so a failed call leaves both blocks untouched.
    pub fn allocate_dual(&mut self) -> Result<(std::net::Ipv4Addr, Ipv6Addr), IpamError> {
        let v4_ip = self.v4.allocate()?;
        match self.v6.allocate() {
            Ok(v6_ip) => Ok((v4_ip, v6_ip)),
            Err(err) => {
                // The position was just set; clearing it cannot fail.
                self.v4
                    .release(v4_ip)
                    .expect("rollback of a just-allocated v4 address");
                Err(err)
            }
        }
    }

    /// Release both addresses. Both sides are attempted; the first error
    /// wins but does not stop the other release.
    pub fn release_dual(
        &mut self,
        v4_ip: std::net::Ipv4Addr,
        v6_ip: Ipv6Addr,
    ) -> Result<(), IpamError> {
        let r4 = self.v4.release(v4_ip);
        let r6 = self.v6.release(v6_ip);
        r4?;
        r6
    }

    pub fn v4(&self) -> &Block {
        &self.v4
    }

    pub fn v6(&self) -> &Ipv6Block {
        &self.v6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_prefix_uses_bitmap_with_reservation() {
        let mut b = Ipv6Block::from_cidr("fd00::/126", "n1").unwrap();
        assert!(b.recycles_addresses());
        assert_eq!(b.total(), 2);
        assert_eq!(b.allocate().unwrap(), "fd00::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(b.allocate().unwrap(), "fd00::2".parse::<Ipv6Addr>().unwrap());
        assert!(matches!(b.allocate(), Err(IpamError::NoAvailableIp { .. })));
    }

    #[test]
    fn bitmap_path_recycles() {
        let mut b = Ipv6Block::from_cidr("fd00::/120", "n1").unwrap();
        let first = b.allocate().unwrap();
        let _second = b.allocate().unwrap();
        b.release(first).unwrap();
        assert_eq!(b.allocate().unwrap(), first);
    }

    #[test]
    fn large_prefix_is_sequential() {
        let mut b = Ipv6Block::from_cidr("fd00::/64", "n1").unwrap();
        assert!(!b.recycles_addresses());
        assert_eq!(b.total(), 1u64 << 32);

        let a = b.allocate().unwrap();
        let c = b.allocate().unwrap();
        assert_eq!(a, "fd00::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(c, "fd00::2".parse::<Ipv6Addr>().unwrap());

        // Release decrements but the address is not handed out again.
        b.release(a).unwrap();
        assert_eq!(b.used(), 1);
        let next = b.allocate().unwrap();
        assert_eq!(next, "fd00::2".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn prefix_127_rejected() {
        assert!(matches!(
            Ipv6Block::from_cidr("fd00::/127", "n1"),
            Err(IpamError::NoUsableIps { .. })
        ));
    }

    #[test]
    fn dual_stack_success_returns_both() {
        let mut dsb = DualStackBlock::new("10.0.0.0/30", "fd00::/120", "n1").unwrap();
        let (v4, v6) = dsb.allocate_dual().unwrap();
        assert_eq!(v4, "10.0.0.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(v6, "fd00::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(dsb.v4().used(), 1);
        assert_eq!(dsb.v6().used(), 1);
    }

    #[test]
    fn dual_stack_rolls_back_v4_on_v6_failure() {
        // v6 side has 2 usable addresses, v4 side has 254.
        let mut dsb = DualStackBlock::new("10.0.0.0/24", "fd00::/126", "n1").unwrap();
        dsb.allocate_dual().unwrap();
        dsb.allocate_dual().unwrap();

        let v4_used_before = dsb.v4().used();
        assert!(matches!(
            dsb.allocate_dual(),
            Err(IpamError::NoAvailableIp { .. })
        ));
        assert_eq!(dsb.v4().used(), v4_used_before);
    }

    #[test]
    fn dual_stack_release() {
        let mut dsb = DualStackBlock::new("10.0.0.0/29", "fd00::/120", "n1").unwrap();
        let (v4, v6) = dsb.allocate_dual().unwrap();
        dsb.release_dual(v4, v6).unwrap();
        assert_eq!(dsb.v4().used(), 0);
        assert_eq!(dsb.v6().used(), 0);
    }
}
