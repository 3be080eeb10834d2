//! End-to-end allocation service tests: real sockets, real consensus
//! (single replica), real mapping store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use openraft::{BasicNode, Config, Raft};

use tamarack::pool::Pool;
use tamarack::raft::network::TcpRaftNetworkFactory;
use tamarack::raft::node::RaftNode;
use tamarack::raft::storage::{InMemoryLogStore, IpamStateMachine};
use tamarack::server::{
    AllocationService, ServiceClient, ServiceErrorKind, ServiceRequest, ServiceResponse,
    ServiceServer,
};
use tamarack::store::MappingStore;

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

async fn leader_node() -> Result<Arc<RaftNode>> {
    let state_machine = IpamStateMachine::new(Pool::new("10.244.0.0/16", 24).unwrap());
    let raft = Raft::new(
        1,
        raft_config(),
        TcpRaftNetworkFactory::new(HashMap::new()),
        InMemoryLogStore::default(),
        state_machine.clone(),
    )
    .await?;
    let node = Arc::new(RaftNode::new(1, raft, state_machine));

    let mut members = BTreeMap::new();
    members.insert(1, BasicNode::default());
    node.initialize(members).await?;
    node.raft()
        .wait(Some(Duration::from_secs(10)))
        .current_leader(1, "leader elected")
        .await?;
    Ok(node)
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<MappingStore>,
    server: ServiceServer,
    client: ServiceClient,
}

async fn harness() -> Result<Harness> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(MappingStore::open(dir.path().join("mappings.redb"))?);
    let node = leader_node().await?;
    let service = AllocationService::new(node, Some(store.clone()), None);
    let socket_path = dir.path().join("ipam.sock");
    let server = ServiceServer::spawn("127.0.0.1:0", Some(socket_path), service).await?;
    let client = ServiceClient::tcp(server.local_addr().to_string());
    Ok(Harness {
        _dir: dir,
        store,
        server,
        client,
    })
}

#[tokio::test]
async fn allocate_writes_mapping_and_returns_gateway() -> Result<()> {
    let h = harness().await?;

    let response = h
        .client
        .request(ServiceRequest::AllocateIp {
            node_id: "n1".into(),
            pod_name: "web-0".into(),
            pod_namespace: "prod".into(),
            container_id: "ctr-1".into(),
            purpose: None,
        })
        .await?;

    let (ip, cidr, gateway) = match response {
        ServiceResponse::IpAllocated { ip, cidr, gateway, routes } => {
            assert_eq!(routes.len(), 1);
            assert_eq!(routes[0].dst, "0.0.0.0/0");
            (ip, cidr, gateway)
        }
        other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(ip, "10.244.0.1");
    assert_eq!(cidr, "10.244.0.1/24");
    assert_eq!(gateway, "10.244.0.1");

    let mapping = h.store.get("ctr-1")?.expect("mapping written after commit");
    assert_eq!(mapping.ip, "10.244.0.1");
    assert_eq!(mapping.node_id, "n1");
    assert_eq!(mapping.pod_name, "web-0");

    h.server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn release_is_idempotent_at_the_service_boundary() -> Result<()> {
    let h = harness().await?;

    h.client
        .request(ServiceRequest::AllocateIp {
            node_id: "n1".into(),
            pod_name: "web-0".into(),
            pod_namespace: "prod".into(),
            container_id: "ctr-1".into(),
            purpose: None,
        })
        .await?;

    for attempt in 0..2 {
        let response = h
            .client
            .request(ServiceRequest::ReleaseIp {
                node_id: "n1".into(),
                ip: "10.244.0.1".into(),
                container_id: Some("ctr-1".into()),
            })
            .await?;
        match response {
            ServiceResponse::IpReleased { released, .. } => {
                assert!(released, "attempt {attempt} should converge to success");
            }
            other => panic!("unexpected response {other:?}"),
        }
    }
    assert!(h.store.get("ctr-1")?.is_none());

    h.server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn release_by_container_id_resolves_the_address() -> Result<()> {
    let h = harness().await?;

    h.client
        .request(ServiceRequest::AllocateIp {
            node_id: "n1".into(),
            pod_name: "web-0".into(),
            pod_namespace: "prod".into(),
            container_id: "ctr-9".into(),
            purpose: None,
        })
        .await?;

    // Teardown knows only the container id (the CNI DEL path).
    let response = h
        .client
        .request(ServiceRequest::ReleaseIp {
            node_id: "n1".into(),
            ip: String::new(),
            container_id: Some("ctr-9".into()),
        })
        .await?;
    assert!(matches!(
        response,
        ServiceResponse::IpReleased { released: true, .. }
    ));

    // The address is genuinely free again.
    let response = h
        .client
        .request(ServiceRequest::AllocateIp {
            node_id: "n1".into(),
            pod_name: "web-1".into(),
            pod_namespace: "prod".into(),
            container_id: "ctr-10".into(),
            purpose: None,
        })
        .await?;
    match response {
        ServiceResponse::IpAllocated { ip, .. } => assert_eq!(ip, "10.244.0.1"),
        other => panic!("unexpected response {other:?}"),
    }

    h.server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stats_and_blocks_are_readable_over_the_socket() -> Result<()> {
    let h = harness().await?;

    for id in 0..3 {
        h.client
            .request(ServiceRequest::AllocateIp {
                node_id: "n1".into(),
                pod_name: format!("web-{id}"),
                pod_namespace: "prod".into(),
                container_id: format!("ctr-{id}"),
                purpose: None,
            })
            .await?;
    }

    let response = h.client.request(ServiceRequest::GetPoolStats).await?;
    match response {
        ServiceResponse::PoolStats { flat, .. } => {
            assert_eq!(flat.used_ips, 3);
            assert_eq!(flat.total_nodes, 1);
        }
        other => panic!("unexpected response {other:?}"),
    }

    let response = h
        .client
        .request(ServiceRequest::GetNodeBlocks { node_id: "n1".into() })
        .await?;
    match response {
        ServiceResponse::NodeBlocks { blocks } => {
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].used, 3);
            assert!(!blocks[0].under_pressure);
        }
        other => panic!("unexpected response {other:?}"),
    }

    h.server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unix_socket_serves_the_same_protocol() -> Result<()> {
    let h = harness().await?;
    let socket_path = h._dir.path().join("ipam.sock");
    let client = ServiceClient::unix(socket_path);

    let response = client.request(ServiceRequest::GetHealth).await?;
    match response {
        ServiceResponse::Health { node_id, is_leader, leader } => {
            assert_eq!(node_id, 1);
            assert!(is_leader);
            assert_eq!(leader, Some(1));
        }
        other => panic!("unexpected response {other:?}"),
    }

    h.server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn non_leader_rejects_mutations_with_a_hint() -> Result<()> {
    // An uninitialized replica is never the leader.
    let state_machine = IpamStateMachine::new(Pool::new("10.244.0.0/16", 24).unwrap());
    let raft = Raft::new(
        7,
        raft_config(),
        TcpRaftNetworkFactory::new(HashMap::new()),
        InMemoryLogStore::default(),
        state_machine.clone(),
    )
    .await?;
    let node = Arc::new(RaftNode::new(7, raft, state_machine));
    let service = AllocationService::new(node, None, None);

    let server = ServiceServer::spawn("127.0.0.1:0", None, service).await?;
    let client = ServiceClient::tcp(server.local_addr().to_string());

    let response = client
        .request(ServiceRequest::AllocateBlock { node_id: "n1".into() })
        .await?;
    match response {
        ServiceResponse::Error { kind, .. } => {
            assert!(matches!(kind, ServiceErrorKind::NotLeader { leader_hint: None }));
        }
        other => panic!("unexpected response {other:?}"),
    }

    server.shutdown().await;
    Ok(())
}
