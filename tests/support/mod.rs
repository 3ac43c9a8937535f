// tests/support/mod.rs

//! Shared harness for the multi-node integration tests: assembles a full
//! `Coordinator` (real UDP gossip socket, real AOF/snapshot directory, real
//! RESP listener) the same way `server::run` does, minus seed-parsing from
//! a config file, so a test can drive several nodes on loopback.

use hypercache::config::Config;
use hypercache::connection::ConnectionHandler;
use hypercache::core::cluster::gossip::{ClusterGossip, GossipConfig};
use hypercache::core::cluster::membership::{Node, NodeCapabilities, NodeStatus};
use hypercache::core::cluster::routing::Router;
use hypercache::core::events::{ClusterEventType, EventBus};
use hypercache::core::persistence::{Persistence, PersistenceConfig, SyncPolicy};
use hypercache::core::storage::{EvictionPolicyKind, Store, StoreConfig};
use hypercache::server::Coordinator;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

pub const CLUSTER_SECRET: &[u8] = b"integration-test-secret";

/// One bound-but-not-yet-joined test node: a coordinator plus the listener
/// to accept RESP connections on.
pub struct TestNode {
    pub coordinator: Arc<Coordinator>,
    pub resp_addr: SocketAddr,
}

/// Builds one node's full subsystem stack and starts its background tasks
/// (gossip recv loop, membership-driven router rebuild, replication
/// apply), mirroring `server::run`'s wiring without its
/// config-file/CLI concerns.
pub async fn spawn_node(node_id: &str, tmp_dir: &std::path::Path) -> TestNode {
    let store = Arc::new(Store::new(
        node_id,
        StoreConfig {
            max_memory_bytes: 64 * 1024 * 1024,
            default_ttl: None,
            eviction_policy: EvictionPolicyKind::Lru,
            filter_capacity: 4096,
            filter_false_positive_rate: 0.01,
        },
    ));

    let persistence = Arc::new(
        Persistence::open(
            PersistenceConfig {
                data_dir: tmp_dir.to_path_buf(),
                sync_policy: SyncPolicy::Never,
                max_log_size: 4 * 1024 * 1024,
                retain_logs: 2,
                compression_level: 0,
                enabled: true,
            },
            &store,
        )
        .await
        .expect("persistence opens"),
    );

    let gossip_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gossip_port = gossip_listener.local_addr().unwrap().port();
    drop(gossip_listener); // just reserving a free port number

    let resp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let resp_addr = resp_listener.local_addr().unwrap();

    let local_node = Node {
        node_id: node_id.to_string(),
        address: "127.0.0.1".to_string(),
        gossip_port,
        resp_port: resp_addr.port(),
        status: NodeStatus::Alive,
        load: 0.0,
        last_seen: Instant::now(),
        capabilities: NodeCapabilities::empty(),
        metadata: HashMap::new(),
    };
    let gossip = ClusterGossip::bind(
        local_node,
        GossipConfig {
            bind_addr: format!("127.0.0.1:{gossip_port}").parse().unwrap(),
            heartbeat_interval: Duration::from_millis(50),
            failure_detection_timeout: Duration::from_secs(5),
            reap_after: Duration::from_secs(60),
            cluster_secret: CLUSTER_SECRET.to_vec(),
        },
    )
    .await
    .expect("gossip socket binds");

    let event_bus = EventBus::new(node_id.to_string(), Arc::clone(&gossip));
    let router = Arc::new(Router::new(node_id.to_string()));
    router.rebuild(&gossip.membership().snapshot());

    let config = Arc::new(Config::default());
    let coordinator = Coordinator::for_test(
        node_id.to_string(),
        config,
        Arc::clone(&store),
        Arc::clone(&persistence),
        Arc::clone(&router),
        Arc::clone(&gossip),
        Arc::clone(&event_bus),
    );

    // A shutdown channel whose sender is intentionally leaked: these test
    // nodes run for the lifetime of the test process and are never asked
    // to shut down gracefully, but every background task still expects a
    // live receiver to select against.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    std::mem::forget(shutdown_tx.clone());

    tokio::spawn(Arc::clone(&gossip).run(shutdown_tx.subscribe()));

    let membership_gossip = Arc::clone(&gossip);
    let membership_router = Arc::clone(&router);
    let membership_bus = Arc::clone(&event_bus);
    tokio::spawn(async move {
        let mut rx = membership_gossip.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    membership_router.rebuild(&membership_gossip.membership().snapshot());
                    membership_bus.publish_membership_event(&event).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    tokio::spawn(Arc::clone(&event_bus).run_gossip_bridge(
        gossip.subscribe_user_events(),
        shutdown_tx.subscribe(),
    ));

    let replication_ctx = coordinator.execution_context();
    let replication_bus = Arc::clone(&event_bus);
    let local_node_id = node_id.to_string();
    tokio::spawn(async move {
        let mut rx = replication_bus.subscribe(Some(ClusterEventType::DataOperation)).await;
        while let Some(event) = rx.recv().await {
            if event.origin_node_id == local_node_id {
                continue;
            }
            if let hypercache::core::events::EventPayload::Data(op) = event.payload {
                hypercache::core::commands::apply_replicated(&replication_ctx, op).await;
            }
        }
    });

    let accept_coordinator = Arc::clone(&coordinator);
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = resp_listener.accept().await else {
                return;
            };
            let coordinator = Arc::clone(&accept_coordinator);
            tokio::spawn(async move {
                let _ = ConnectionHandler::new(stream, peer, coordinator).run().await;
            });
        }
    });

    TestNode { coordinator, resp_addr }
}

/// Joins every node to every other node via gossip and waits for the
/// membership tables to converge (polling, since gossip propagation is
/// asynchronous over real UDP sockets).
pub async fn join_all(nodes: &[TestNode]) {
    let addrs: Vec<SocketAddr> = nodes
        .iter()
        .map(|n| {
            let snapshot = n.coordinator.gossip.membership().snapshot();
            let local = &snapshot[&n.coordinator.node_id];
            format!("{}:{}", local.address, local.gossip_port).parse().unwrap()
        })
        .collect();

    for (i, node) in nodes.iter().enumerate() {
        let seeds: Vec<SocketAddr> = addrs
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, a)| *a)
            .collect();
        node.coordinator.gossip.join(&seeds).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let converged = nodes.iter().all(|n| {
            n.coordinator.gossip.membership().snapshot().len() == nodes.len()
        });
        if converged || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for node in nodes {
        node.coordinator
            .router
            .rebuild(&node.coordinator.gossip.membership().snapshot());
    }
}
