//! Crate-wide error taxonomy.
//!
//! Allocator and pool errors are values that travel through the replicated
//! state machine as response payloads, so every variant carries enough
//! context to be rendered for a client without access to local state.

use std::net::IpAddr;

use snafu::Snafu;

/// Errors raised by the allocator, pool and topology layers.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IpamError {
    /// A CIDR string failed to parse or is unusable for the operation.
    #[snafu(display("invalid CIDR {cidr}: {reason}"))]
    InvalidCidr { cidr: String, reason: String },

    /// Bitmap position outside the domain.
    #[snafu(display("position {position} out of range [0, {size})"))]
    PositionOutOfRange { position: usize, size: usize },

    /// Double-set on a bitmap bit.
    #[snafu(display("bit {position} already set"))]
    BitAlreadySet { position: usize },

    /// Double-clear on a bitmap bit.
    #[snafu(display("bit {position} already clear"))]
    BitAlreadyClear { position: usize },

    /// The prefix leaves no usable host addresses.
    #[snafu(display("CIDR {cidr} has no usable IPs"))]
    NoUsableIps { cidr: String },

    /// Every position in the block is taken.
    #[snafu(display("no available IP in block {cidr}"))]
    NoAvailableIp { cidr: String },

    /// The cluster CIDR has no unassigned block left.
    #[snafu(display("cluster CIDR {cluster} exhausted"))]
    CidrExhausted { cluster: String },

    /// A block with this CIDR already exists in the pool.
    #[snafu(display("block {cidr} already allocated"))]
    DuplicateBlock { cidr: String },

    /// A subnet with this CIDR already exists in the pool.
    #[snafu(display("subnet {cidr} already exists in pool of TOR {tor_id}"))]
    DuplicateSubnet { cidr: String, tor_id: String },

    /// A new subnet overlaps an existing one.
    #[snafu(display("subnet {cidr} overlaps {existing} in pool of TOR {tor_id}"))]
    SubnetOverlap {
        cidr: String,
        existing: String,
        tor_id: String,
    },

    #[snafu(display("zone {zone_id} already exists"))]
    DuplicateZone { zone_id: String },

    #[snafu(display("pod {pod_id} already exists"))]
    DuplicatePod { pod_id: String },

    #[snafu(display("TOR {tor_id} already exists"))]
    DuplicateTor { tor_id: String },

    /// Node re-registration.
    #[snafu(display("node {node_id} already registered"))]
    DuplicateNode { node_id: String },

    #[snafu(display("zone {zone_id} not found"))]
    ZoneNotFound { zone_id: String },

    #[snafu(display("pod {pod_id} not found"))]
    PodNotFound { pod_id: String },

    #[snafu(display("TOR {tor_id} not found"))]
    TorNotFound { tor_id: String },

    #[snafu(display("node {node_id} not found"))]
    NodeNotFound { node_id: String },

    /// No block owned by the node matches the request.
    #[snafu(display("block not found for node {node_id}"))]
    BlockNotFound { node_id: String },

    /// A TOR exists but carries no subnet pool (topology corruption).
    #[snafu(display("subnet pool not found for TOR {tor_id}"))]
    SubnetPoolNotFound { tor_id: String },

    /// The IP does not fall inside the block's CIDR.
    #[snafu(display("IP {ip} not in block {cidr}"))]
    IpNotInBlock { ip: IpAddr, cidr: String },

    /// Release of an address with no allocation record.
    #[snafu(display("IP {ip} not allocated"))]
    IpNotAllocated { ip: IpAddr },

    /// Block release while addresses are still handed out.
    #[snafu(display("block {cidr} still has {used} allocated IPs"))]
    BlockInUse { cidr: String, used: usize },

    /// No subnet serves the requested purpose (after default fallback).
    #[snafu(display("no available subnet in pool of TOR {tor_id} for purpose {purpose}"))]
    NoSubnetForPurpose { tor_id: String, purpose: String },
}

/// Errors surfaced by the consensus front door.
///
/// Distinct from [`IpamError`]: these describe why a proposal never
/// produced a committed result, not why an applied command failed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProposalError {
    /// This replica is not the leader. `leader_hint` is the last known
    /// leader id, when one is known.
    #[snafu(display("not the leader (current leader: {leader_hint:?})"))]
    NotLeader { leader_hint: Option<u64> },

    /// The proposal did not commit and apply within the deadline. The
    /// entry may still commit later; retries are only safe for idempotent
    /// commands.
    #[snafu(display("proposal timed out after {timeout_ms} ms"))]
    Timeout { timeout_ms: u64 },

    /// The command committed and applied, but the state machine rejected it.
    #[snafu(display("command failed: {reason}"))]
    CommandFailed { reason: String },

    /// The consensus layer could not accept the proposal (no quorum,
    /// shutting down, or storage failure).
    #[snafu(display("consensus unavailable: {reason}"))]
    ConsensusUnavailable { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = IpamError::PositionOutOfRange {
            position: 300,
            size: 254,
        };
        assert_eq!(err.to_string(), "position 300 out of range [0, 254)");

        let err = IpamError::BlockInUse {
            cidr: "10.244.0.0/24".into(),
            used: 3,
        };
        assert!(err.to_string().contains("10.244.0.0/24"));
        assert!(err.to_string().contains("3"));
    }

    #[test]
    fn proposal_errors_are_distinct_kinds() {
        let timeout = ProposalError::Timeout { timeout_ms: 10_000 };
        let failed = ProposalError::CommandFailed {
            reason: "no available IP".into(),
        };
        assert!(timeout.to_string().contains("timed out"));
        assert!(failed.to_string().contains("command failed"));
    }
}
