//! Snapshot build, install and log-compaction behavior.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use openraft::storage::RaftStateMachine;
use openraft::Config;

use tamarack::pool::Pool;
use tamarack::raft::storage::IpamStateMachine;
use tamarack::raft::types::{IpamRequest, ResponseData};
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

fn topology() -> TopologyConfig {
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
                    subnets: vec![SubnetConfig {
                        cidr: "10.244.0.0/24".into(),
                        purpose: "default".into(),
                    }],
                }],
            }],
        }],
    }
}

async fn seed_allocations(router: &IpamRouter, count: usize) -> Result<()> {
    router
        .propose(&0, IpamRequest::InitTopology { config: topology() })
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
    for _ in 0..count {
        let resp = router
            .propose(
                &0,
                IpamRequest::AllocateIp {
                    node_id: "n1".into(),
                    purpose: "default".into(),
                    meta: AllocationMeta::default(),
                },
            )
            .await?;
        assert!(resp.success);
    }
    router
        .propose(&0, IpamRequest::AllocateBlock { node_id: "flat-1".into() })
        .await?;
    Ok(())
}

#[tokio::test]
async fn snapshot_restores_every_allocation() -> Result<()> {
    let template = Pool::new("10.244.0.0/16", 24).unwrap();
    let mut router = IpamRouter::new(raft_config(), template.clone());
    router.new_raft_node(0).await?;
    router.initialize(0).await?;
    router
        .wait(&0, timeout())
        .current_leader(0, "leader elected")
        .await?;

    seed_allocations(&router, 7).await?;

    let raft = router.get_raft_handle(&0)?;
    raft.trigger().snapshot().await?;
    router
        .wait(&0, timeout())
        .metrics(|m| m.snapshot.is_some(), "snapshot built")
        .await?;

    // Pull the built snapshot and install it into a fresh state machine,
    // the way a follower restoring from transfer would.
    let mut source = router.get_state_machine(&0)?;
    let snapshot = source
        .get_current_snapshot()
        .await?
        .expect("snapshot was just built");

    let mut restored = IpamStateMachine::new(template);
    restored
        .install_snapshot(&snapshot.meta, snapshot.snapshot)
        .await?;

    let original_image = source
        .with_state(|state| serde_json::to_vec(state).unwrap())
        .await;
    let restored_image = restored
        .with_state(|state| serde_json::to_vec(state).unwrap())
        .await;
    assert_eq!(original_image, restored_image);

    // Public observables survive: allocations, blocks, stats.
    let stats = restored.topology_stats().await;
    assert_eq!(stats.total_used, 7);
    assert_eq!(stats.node_count, 1);
    assert_eq!(restored.node_blocks("flat-1").await?.len(), 1);
    let detail = restored.node_stats("n1").await?;
    assert_eq!(detail.allocated_ips, 7);

    // Installing the same snapshot again is a no-op (idempotent restore).
    let snapshot = source.get_current_snapshot().await?.unwrap();
    restored
        .install_snapshot(&snapshot.meta, snapshot.snapshot)
        .await?;
    let again = restored
        .with_state(|state| serde_json::to_vec(state).unwrap())
        .await;
    assert_eq!(again, restored_image);
    Ok(())
}

#[tokio::test]
async fn late_joiner_catches_up_through_snapshot_transfer() -> Result<()> {
    let template = Pool::new("10.244.0.0/16", 24).unwrap();
    let mut router = IpamRouter::new(raft_config(), template);
    router.new_raft_node(0).await?;
    router.initialize(0).await?;
    router
        .wait(&0, timeout())
        .current_leader(0, "leader elected")
        .await?;

    seed_allocations(&router, 5).await?;

    // Compact the log so the newcomer must take the snapshot path.
    let raft = router.get_raft_handle(&0)?;
    raft.trigger().snapshot().await?;
    router
        .wait(&0, timeout())
        .metrics(|m| m.snapshot.is_some(), "snapshot built")
        .await?;

    router.new_raft_node(1).await?;
    router.add_learner(0, 1).await?;

    let leader_metrics = router.get_raft_handle(&0)?.metrics().borrow().clone();
    let leader_applied = leader_metrics.last_applied.expect("leader applied entries");
    router
        .wait(&1, timeout())
        .applied_index(Some(leader_applied.index()), "learner caught up")
        .await?;

    let leader_image = router
        .get_state_machine(&0)?
        .with_state(|state| serde_json::to_vec(state).unwrap())
        .await;
    let learner_image = router
        .get_state_machine(&1)?
        .with_state(|state| serde_json::to_vec(state).unwrap())
        .await;
    assert_eq!(leader_image, learner_image);

    // Allocation continues from the restored cursor: the freed slot is
    // refilled first, exactly as full-log replay would.
    router
        .propose(
            &0,
            IpamRequest::ReleaseIp {
                node_id: "n1".into(),
                ip: "10.244.0.2".parse().unwrap(),
            },
        )
        .await?;
    let resp = router
        .propose(
            &0,
            IpamRequest::AllocateIp {
                node_id: "n1".into(),
                purpose: "default".into(),
                meta: AllocationMeta::default(),
            },
        )
        .await?;
    match resp.data.unwrap() {
        ResponseData::IpGrant { ip, .. } => assert_eq!(ip.to_string(), "10.244.0.2"),
        other => panic!("unexpected response {other:?}"),
    }
    Ok(())
}
