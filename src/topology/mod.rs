//! Physical network topology: Zone ⊇ Pod ⊇ TOR ⊇ Node.
//!
//! Storage is single-owner: each record carries only its parent id, and
//! the tree derives child listings from `parent → children` index maps it
//! owns itself. There are no back-pointers inside child records, so the
//! whole structure serializes cleanly into snapshots.

pub mod pool;
pub mod subnet;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::ensure;

pub use pool::{
    NodeStatsDetail, PodConfig, SubnetConfig, TopologyConfig, TopologyPool, TopologyPoolStats,
    TorConfig, ZoneConfig,
};
pub use subnet::{
    Allocation, AllocationMeta, Subnet, SubnetPool, SubnetPoolStats, SubnetStats, DEFAULT_PURPOSE,
};

use crate::error::{
    DuplicateNodeSnafu, DuplicatePodSnafu, DuplicateTorSnafu, DuplicateZoneSnafu, IpamError,
    NodeNotFoundSnafu, PodNotFoundSnafu, TorNotFoundSnafu, ZoneNotFoundSnafu,
};

/// An availability zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub subnet_ranges: Vec<String>,
}

/// A group of racks inside a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub zone_id: String,
    pub subnet_ranges: Vec<String>,
}

/// A top-of-rack switch. Its subnets live in the TOR's [`SubnetPool`],
/// owned by the topology pool, not duplicated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tor {
    pub id: String,
    pub name: String,
    pub pod_id: String,
    pub location: String,
}

/// A host registered under a TOR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub tor_id: String,
    pub labels: BTreeMap<String, String>,
}

/// Topology-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyStats {
    pub zone_count: usize,
    pub pod_count: usize,
    pub tor_count: usize,
    pub node_count: usize,
}

/// The tree itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    zones: BTreeMap<String, Zone>,
    pods: BTreeMap<String, Pod>,
    tors: BTreeMap<String, Tor>,
    nodes: BTreeMap<String, Node>,
    zone_pods: BTreeMap<String, BTreeSet<String>>,
    pod_tors: BTreeMap<String, BTreeSet<String>>,
    tor_nodes: BTreeMap<String, BTreeSet<String>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_zone(&mut self, zone: Zone) -> Result<(), IpamError> {
        ensure!(
            !self.zones.contains_key(&zone.id),
            DuplicateZoneSnafu { zone_id: &zone.id }
        );
        self.zone_pods.entry(zone.id.clone()).or_default();
        self.zones.insert(zone.id.clone(), zone);
        Ok(())
    }

    pub fn add_pod(&mut self, pod: Pod) -> Result<(), IpamError> {
        ensure!(
            self.zones.contains_key(&pod.zone_id),
            ZoneNotFoundSnafu { zone_id: &pod.zone_id }
        );
        ensure!(
            !self.pods.contains_key(&pod.id),
            DuplicatePodSnafu { pod_id: &pod.id }
        );
        self.zone_pods
            .entry(pod.zone_id.clone())
            .or_default()
            .insert(pod.id.clone());
        self.pod_tors.entry(pod.id.clone()).or_default();
        self.pods.insert(pod.id.clone(), pod);
        Ok(())
    }

    pub fn add_tor(&mut self, tor: Tor) -> Result<(), IpamError> {
        ensure!(
            self.pods.contains_key(&tor.pod_id),
            PodNotFoundSnafu { pod_id: &tor.pod_id }
        );
        ensure!(
            !self.tors.contains_key(&tor.id),
            DuplicateTorSnafu { tor_id: &tor.id }
        );
        self.pod_tors
            .entry(tor.pod_id.clone())
            .or_default()
            .insert(tor.id.clone());
        self.tor_nodes.entry(tor.id.clone()).or_default();
        self.tors.insert(tor.id.clone(), tor);
        Ok(())
    }

    pub fn register_node(&mut self, node: Node) -> Result<(), IpamError> {
        ensure!(
            self.tors.contains_key(&node.tor_id),
            TorNotFoundSnafu { tor_id: &node.tor_id }
        );
        ensure!(
            !self.nodes.contains_key(&node.id),
            DuplicateNodeSnafu { node_id: &node.id }
        );
        self.tor_nodes
            .entry(node.tor_id.clone())
            .or_default()
            .insert(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn zone(&self, zone_id: &str) -> Option<&Zone> {
        self.zones.get(zone_id)
    }

    pub fn pod(&self, pod_id: &str) -> Option<&Pod> {
        self.pods.get(pod_id)
    }

    pub fn tor(&self, tor_id: &str) -> Option<&Tor> {
        self.tors.get(tor_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn has_tor(&self, tor_id: &str) -> bool {
        self.tors.contains_key(tor_id)
    }

    /// The TOR a node hangs off.
    pub fn node_tor(&self, node_id: &str) -> Result<&Tor, IpamError> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| NodeNotFoundSnafu { node_id }.build())?;
        self.tors
            .get(&node.tor_id)
            .ok_or_else(|| TorNotFoundSnafu { tor_id: &node.tor_id }.build())
    }

    /// `Zone/Pod/TOR/Node` path by display names.
    pub fn node_path(&self, node_id: &str) -> Result<String, IpamError> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| NodeNotFoundSnafu { node_id }.build())?;
        let tor = self
            .tors
            .get(&node.tor_id)
            .ok_or_else(|| TorNotFoundSnafu { tor_id: &node.tor_id }.build())?;
        let pod = self
            .pods
            .get(&tor.pod_id)
            .ok_or_else(|| PodNotFoundSnafu { pod_id: &tor.pod_id }.build())?;
        let zone = self
            .zones
            .get(&pod.zone_id)
            .ok_or_else(|| ZoneNotFoundSnafu { zone_id: &pod.zone_id }.build())?;
        Ok(format!("{}/{}/{}/{}", zone.name, pod.name, tor.name, node.name))
    }

    /// Nodes registered under a TOR, ascending by id.
    pub fn nodes_of_tor(&self, tor_id: &str) -> Result<Vec<&Node>, IpamError> {
        let ids = self
            .tor_nodes
            .get(tor_id)
            .ok_or_else(|| TorNotFoundSnafu { tor_id }.build())?;
        Ok(ids.iter().filter_map(|id| self.nodes.get(id)).collect())
    }

    pub fn stats(&self) -> TopologyStats {
        TopologyStats {
            zone_count: self.zones.len(),
            pod_count: self.pods.len(),
            tor_count: self.tors.len(),
            node_count: self.nodes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tree() -> Topology {
        let mut topo = Topology::new();
        topo.add_zone(Zone {
            id: "az1".into(),
            name: "east-1a".into(),
            subnet_ranges: vec!["10.244.0.0/20".into()],
        })
        .unwrap();
        topo.add_pod(Pod {
            id: "pod1".into(),
            name: "row-7".into(),
            zone_id: "az1".into(),
            subnet_ranges: vec![],
        })
        .unwrap();
        topo.add_tor(Tor {
            id: "tor-1".into(),
            name: "tor-7-1".into(),
            pod_id: "pod1".into(),
            location: "Rack 01".into(),
        })
        .unwrap();
        topo
    }

    #[test]
    fn parents_must_exist() {
        let mut topo = Topology::new();
        assert!(matches!(
            topo.add_pod(Pod {
                id: "pod1".into(),
                name: "row".into(),
                zone_id: "nope".into(),
                subnet_ranges: vec![],
            }),
            Err(IpamError::ZoneNotFound { .. })
        ));

        let mut topo = small_tree();
        assert!(matches!(
            topo.register_node(Node {
                id: "n1".into(),
                name: "host-1".into(),
                tor_id: "tor-99".into(),
                labels: BTreeMap::new(),
            }),
            Err(IpamError::TorNotFound { .. })
        ));
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut topo = small_tree();
        let node = Node {
            id: "n1".into(),
            name: "host-1".into(),
            tor_id: "tor-1".into(),
            labels: BTreeMap::new(),
        };
        topo.register_node(node.clone()).unwrap();
        assert!(matches!(
            topo.register_node(node),
            Err(IpamError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn node_path_walks_the_chain() {
        let mut topo = small_tree();
        topo.register_node(Node {
            id: "n1".into(),
            name: "host-1".into(),
            tor_id: "tor-1".into(),
            labels: BTreeMap::new(),
        })
        .unwrap();
        assert_eq!(topo.node_path("n1").unwrap(), "east-1a/row-7/tor-7-1/host-1");
        assert!(matches!(
            topo.node_path("ghost"),
            Err(IpamError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn child_listing_is_derived_not_stored() {
        let mut topo = small_tree();
        for id in ["n2", "n1", "n3"] {
            topo.register_node(Node {
                id: id.into(),
                name: format!("host-{id}"),
                tor_id: "tor-1".into(),
                labels: BTreeMap::new(),
            })
            .unwrap();
        }
        let ids: Vec<_> = topo
            .nodes_of_tor("tor-1")
            .unwrap()
            .iter()
            .map(|n| n.id.clone())
            .collect();
        assert_eq!(ids, vec!["n1", "n2", "n3"]);

        let stats = topo.stats();
        assert_eq!(stats.zone_count, 1);
        assert_eq!(stats.node_count, 3);
    }
}
