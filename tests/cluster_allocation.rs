//! Cluster-level allocation scenarios on the in-memory router.
//!
//! These tests drive whole command sequences through real consensus
//! (election, replication, apply) and assert on the public pool state of
//! every replica.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use openraft::Config;

use tamarack::pool::Pool;
use tamarack::raft::types::{IpamRequest, NodeId, ResponseData};
use tamarack::testing::IpamRouter;
use tamarack::topology::{
    AllocationMeta, PodConfig, SubnetConfig, TopologyConfig, TorConfig, ZoneConfig,
};

fn raft_config() -> Arc<Config> {
    Arc::new(
        Config {
            heartbeat_interval: 50,
            election_timeout_min: 200,
            election_timeout_max: 400,
            ..Default::default()
        }
        .validate()
        .expect("config is valid"),
    )
}

fn timeout() -> Option<Duration> {
    Some(Duration::from_secs(10))
}

fn one_tor_topology() -> TopologyConfig {
    TopologyConfig {
        zones: vec![ZoneConfig {
            id: "az1".into(),
            name: "east-1a".into(),
            subnet_ranges: vec![],
            pods: vec![PodConfig {
                id: "pod1".into(),
                name: "row-7".into(),
                subnet_ranges: vec![],
                tors: vec![TorConfig {
                    id: "tor-1".into(),
                    name: "tor-7-1".into(),
                    location: "Rack 01".into(),
                    subnets: vec![
                        SubnetConfig {
                            cidr: "10.244.0.0/24".into(),
                            purpose: "default".into(),
                        },
                        SubnetConfig {
                            cidr: "10.244.100.0/24".into(),
                            purpose: "storage".into(),
                        },
                    ],
                }],
            }],
        }],
    }
}

fn allocate_ip(node_id: &str, purpose: &str) -> IpamRequest {
    IpamRequest::AllocateIp {
        node_id: node_id.into(),
        purpose: purpose.into(),
        meta: AllocationMeta::default(),
    }
}

async fn single_node_cluster(cluster_cidr: &str, block_prefix: u8) -> Result<IpamRouter> {
    let mut router = IpamRouter::new(
        raft_config(),
        Pool::new(cluster_cidr, block_prefix).unwrap(),
    );
    router.new_raft_node(0).await?;
    router.initialize(0).await?;
    router
        .wait(&0, timeout())
        .current_leader(0, "leader elected")
        .await?;
    Ok(router)
}

async fn three_node_cluster(cluster_cidr: &str, block_prefix: u8) -> Result<IpamRouter> {
    let mut router = IpamRouter::new(
        raft_config(),
        Pool::new(cluster_cidr, block_prefix).unwrap(),
    );
    for id in 0..3 {
        router.new_raft_node(id).await?;
    }
    router.initialize(0).await?;
    router
        .wait(&0, timeout())
        .current_leader(0, "leader elected")
        .await?;
    Ok(router)
}

async fn wait_for_new_leader(router: &IpamRouter, old: NodeId) -> Result<NodeId> {
    for _ in 0..100 {
        if let Some(leader) = router.leader() {
            if leader != old {
                return Ok(leader);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("no new leader elected within the deadline")
}

#[tokio::test]
async fn flat_pool_block_grants_replicate() -> Result<()> {
    let router = single_node_cluster("10.244.0.0/16", 24).await?;

    let resp = router
        .propose(&0, IpamRequest::AllocateBlock { node_id: "n1".into() })
        .await?;
    assert!(resp.success);
    match resp.data.unwrap() {
        ResponseData::BlockGrant { cidr, total, .. } => {
            assert_eq!(cidr.to_string(), "10.244.0.0/24");
            assert_eq!(total, 254);
        }
        other => panic!("unexpected response {other:?}"),
    }

    let sm = router.get_state_machine(&0)?;
    let blocks = sm.node_blocks("n1").await?;
    assert_eq!(blocks.len(), 1);
    Ok(())
}

#[tokio::test]
async fn exhaustion_is_sticky_until_release() -> Result<()> {
    // Four /30 blocks fit into a /28.
    let router = single_node_cluster("10.244.0.0/28", 30).await?;

    let expected = ["10.244.0.0/30", "10.244.0.4/30", "10.244.0.8/30", "10.244.0.12/30"];
    for want in expected {
        let resp = router
            .propose(&0, IpamRequest::AllocateBlock { node_id: "n1".into() })
            .await?;
        match resp.data.unwrap() {
            ResponseData::BlockGrant { cidr, .. } => assert_eq!(cidr.to_string(), want),
            other => panic!("unexpected response {other:?}"),
        }
    }

    // Fifth and every subsequent attempt fail identically until a release.
    for _ in 0..3 {
        let resp = router
            .propose(&0, IpamRequest::AllocateBlock { node_id: "n1".into() })
            .await?;
        assert!(!resp.success);
        assert!(resp.error.as_deref().unwrap().contains("exhausted"));
    }

    let resp = router
        .propose(
            &0,
            IpamRequest::ReleaseBlock {
                node_id: "n1".into(),
                cidr: "10.244.0.8/30".into(),
            },
        )
        .await?;
    assert!(resp.success);

    let resp = router
        .propose(&0, IpamRequest::AllocateBlock { node_id: "n2".into() })
        .await?;
    assert!(resp.success);
    match resp.data.unwrap() {
        ResponseData::BlockGrant { cidr, .. } => assert_eq!(cidr.to_string(), "10.244.0.8/30"),
        other => panic!("unexpected response {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn block_pressure_is_observable_in_grants() -> Result<()> {
    let router = single_node_cluster("10.244.0.0/16", 24).await?;

    let mut last_pressure = false;
    for i in 0..204 {
        let resp = router
            .propose(&0, IpamRequest::AllocateNodeIp { node_id: "n1".into() })
            .await?;
        assert!(resp.success, "allocation {i} failed");
        match resp.data.unwrap() {
            ResponseData::NodeIpGrant { block_under_pressure, .. } => {
                last_pressure = block_under_pressure;
            }
            other => panic!("unexpected response {other:?}"),
        }
    }
    // 50 of 254 left after 204 grants: under the 20% line.
    assert!(last_pressure);

    let sm = router.get_state_machine(&0)?;
    let blocks = sm.node_blocks("n1").await?;
    assert!(blocks[0].under_pressure);
    assert!(blocks[0].available * 5 < blocks[0].total);
    Ok(())
}

#[tokio::test]
async fn replay_scenario_converges_on_all_replicas() -> Result<()> {
    let router = three_node_cluster("10.244.0.0/16", 24).await?;

    router
        .propose(&0, IpamRequest::InitTopology { config: one_tor_topology() })
        .await?;
    router
        .propose(
            &0,
            IpamRequest::RegisterNode {
                node_id: "n1".into(),
                name: "host-1".into(),
                tor_id: "tor-1".into(),
                labels: BTreeMap::new(),
            },
        )
        .await?;
    for _ in 0..5 {
        let resp = router.propose(&0, allocate_ip("n1", "default")).await?;
        assert!(resp.success);
    }
    router
        .propose(
            &0,
            IpamRequest::ReleaseIp {
                node_id: "n1".into(),
                ip: "10.244.0.3".parse().unwrap(),
            },
        )
        .await?;
    let resp = router.propose(&0, allocate_ip("n1", "default")).await?;
    match resp.data.unwrap() {
        ResponseData::IpGrant { ip, .. } => assert_eq!(ip.to_string(), "10.244.0.3"),
        other => panic!("unexpected response {other:?}"),
    }

    // Wait for every replica to apply the full log, then compare the
    // serialized pool state bit for bit.
    let leader_metrics = router.get_raft_handle(&0)?.metrics().borrow().clone();
    let leader_applied = leader_metrics.last_applied.expect("leader applied entries");
    for id in 1..3 {
        router
            .wait(&id, timeout())
            .applied_index(Some(leader_applied.index()), "replica caught up")
            .await?;
    }

    let mut images = Vec::new();
    for id in 0..3 {
        let sm = router.get_state_machine(&id)?;
        images.push(sm.with_state(|state| serde_json::to_vec(state).unwrap()).await);
    }
    assert_eq!(images[0], images[1]);
    assert_eq!(images[1], images[2]);

    let sm = router.get_state_machine(&2)?;
    let stats = sm.topology_stats().await;
    assert_eq!(stats.total_used, 5);
    Ok(())
}

#[tokio::test]
async fn purpose_fallback_routes_to_default() -> Result<()> {
    let router = single_node_cluster("10.244.0.0/16", 24).await?;

    router
        .propose(&0, IpamRequest::InitTopology { config: one_tor_topology() })
        .await?;
    router
        .propose(
            &0,
            IpamRequest::RegisterNode {
                node_id: "n1".into(),
                name: "host-1".into(),
                tor_id: "tor-1".into(),
                labels: BTreeMap::new(),
            },
        )
        .await?;

    let resp = router.propose(&0, allocate_ip("n1", "storage")).await?;
    match resp.data.unwrap() {
        ResponseData::IpGrant { cidr, .. } => assert_eq!(cidr.to_string(), "10.244.100.0/24"),
        other => panic!("unexpected response {other:?}"),
    }

    let resp = router.propose(&0, allocate_ip("n1", "default")).await?;
    match resp.data.unwrap() {
        ResponseData::IpGrant { cidr, .. } => assert_eq!(cidr.to_string(), "10.244.0.0/24"),
        other => panic!("unexpected response {other:?}"),
    }

    // Unknown purpose falls back to default.
    let resp = router.propose(&0, allocate_ip("n1", "backup")).await?;
    match resp.data.unwrap() {
        ResponseData::IpGrant { cidr, .. } => assert_eq!(cidr.to_string(), "10.244.0.0/24"),
        other => panic!("unexpected response {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn release_survives_leader_change() -> Result<()> {
    let mut router = three_node_cluster("10.244.0.0/16", 24).await?;

    router
        .propose(&0, IpamRequest::InitTopology { config: one_tor_topology() })
        .await?;
    router
        .propose(
            &0,
            IpamRequest::RegisterNode {
                node_id: "n1".into(),
                name: "host-1".into(),
                tor_id: "tor-1".into(),
                labels: BTreeMap::new(),
            },
        )
        .await?;
    let resp = router.propose(&0, allocate_ip("n1", "default")).await?;
    let ip = match resp.data.unwrap() {
        ResponseData::IpGrant { ip, .. } => ip,
        other => panic!("unexpected response {other:?}"),
    };

    // Give followers a moment to apply, then take the leader down.
    let leader_metrics = router.get_raft_handle(&0)?.metrics().borrow().clone();
    let leader_applied = leader_metrics.last_applied.expect("leader applied entries");
    for id in 1..3 {
        router
            .wait(&id, timeout())
            .applied_index(Some(leader_applied.index()), "replica caught up")
            .await?;
    }
    router.fail_node(0);
    let new_leader = wait_for_new_leader(&router, 0).await?;

    // The release succeeds on the new leader...
    let resp = router
        .propose(
            &new_leader,
            IpamRequest::ReleaseIp {
                node_id: "n1".into(),
                ip,
            },
        )
        .await?;
    assert!(resp.success);

    // ...and a second release of the same address reports the precise
    // error kind (the service layer, not the state machine, is where
    // timeout-retry idempotency lives).
    let resp = router
        .propose(
            &new_leader,
            IpamRequest::ReleaseIp {
                node_id: "n1".into(),
                ip,
            },
        )
        .await?;
    assert!(!resp.success);
    assert!(resp.error.as_deref().unwrap().contains("not allocated"));
    Ok(())
}
