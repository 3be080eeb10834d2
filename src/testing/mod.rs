//! Deterministic testing primitives for multi-node clusters.
//!
//! - [`router::IpamRouter`] manages in-memory Raft nodes with simulated
//!   networking (configurable delays, fail/recover switches).
//! - Assertions use OpenRaft's `Wait` metrics API instead of sleeps.
//!
//! ```ignore
//! let config = Arc::new(Config::default().validate()?);
//! let mut router = IpamRouter::new(config, Pool::new("10.244.0.0/16", 24)?);
//!
//! router.new_raft_node(0).await?;
//! router.new_raft_node(1).await?;
//! router.new_raft_node(2).await?;
//! router.initialize(0).await?;
//! router.wait(&0, timeout()).current_leader(Some(0), "leader elected").await?;
//! ```

pub mod router;

pub use router::{ClusterNode, IpamRouter};
