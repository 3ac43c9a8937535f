// tests/cluster_test.rs

//! Multi-node routing and membership scenarios driven over real loopback
//! sockets: a `MOVED` redirect to the key's actual owner, hash-tag
//! co-location surviving a redirect, and slot-table convergence after a
//! node leaves the cluster.

mod support;

use futures::{SinkExt, StreamExt};
use hypercache::core::protocol::{RespCodec, RespFrame};
use support::{join_all, spawn_node};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

async fn connect(addr: std::net::SocketAddr) -> Framed<TcpStream, RespCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, RespCodec)
}

fn set_cmd(key: &str, value: &str) -> RespFrame {
    RespFrame::Array(vec![
        RespFrame::bulk("SET"),
        RespFrame::bulk(key),
        RespFrame::bulk(value),
    ])
}

fn get_cmd(key: &str) -> RespFrame {
    RespFrame::Array(vec![RespFrame::bulk("GET"), RespFrame::bulk(key)])
}

#[tokio::test]
async fn moved_redirect_points_at_the_keys_real_owner() {
    let tmp_a = tempfile::tempdir().unwrap();
    let tmp_b = tempfile::tempdir().unwrap();
    let node_a = spawn_node("a", tmp_a.path()).await;
    let node_b = spawn_node("b", tmp_b.path()).await;
    let nodes = vec![node_a, node_b];
    join_all(&nodes).await;

    let mut foreign_key = None;
    for i in 0..10_000u32 {
        let key = format!("probe-{i}");
        if let Some(target) = nodes[0].coordinator.router.route(key.as_bytes()) {
            if target.node_id != "a" {
                foreign_key = Some((key, target.resp_addr()));
                break;
            }
        }
    }
    let (key, owner_resp_addr) = foreign_key.expect("some key routes off-node in a 2-node ring");

    let mut client = connect(nodes[0].resp_addr).await;
    client.send(get_cmd(&key)).await.unwrap();
    match client.next().await.unwrap().unwrap() {
        RespFrame::Error(msg) => {
            assert!(msg.starts_with("MOVED"), "expected MOVED, got {msg}");
            assert!(msg.contains(&owner_resp_addr), "redirect should name the real owner's address: {msg}");
        }
        other => panic!("expected a MOVED redirect, got {other:?}"),
    }
}

#[tokio::test]
async fn cross_node_routing_and_cluster_down() {
    let tmp_a = tempfile::tempdir().unwrap();
    let tmp_b = tempfile::tempdir().unwrap();
    let tmp_c = tempfile::tempdir().unwrap();
    let node_a = spawn_node("a", tmp_a.path()).await;
    let node_b = spawn_node("b", tmp_b.path()).await;
    let node_c = spawn_node("c", tmp_c.path()).await;
    let nodes = vec![node_a, node_b, node_c];
    join_all(&nodes).await;

    let resp_addrs: std::collections::HashMap<String, std::net::SocketAddr> = nodes
        .iter()
        .map(|n| (n.coordinator.node_id.clone(), n.resp_addr))
        .collect();

    // Find a key this three-node ring does NOT route to node "a", proving
    // the redirect carries a different node's real address (/§4.6).
    let mut foreign_key = None;
    for i in 0..10_000u32 {
        let key = format!("probe-{i}");
        if let Some(target) = nodes[0].coordinator.router.route(key.as_bytes()) {
            if target.node_id != "a" {
                foreign_key = Some((key, target.node_id, target.resp_addr()));
                break;
            }
        }
    }
    let (key, owner_id, owner_resp_addr) = foreign_key.expect("some key routes off-node in a 3-node ring");

    let mut client = connect(nodes[0].resp_addr).await;
    client.send(set_cmd(&key, "v1")).await.unwrap();
    match client.next().await.unwrap().unwrap() {
        RespFrame::Error(msg) => {
            assert!(msg.starts_with("MOVED"), "expected MOVED, got {msg}");
            assert!(msg.contains(&owner_resp_addr), "redirect should name the real owner's address: {msg}");
        }
        other => panic!("expected a MOVED redirect, got {other:?}"),
    }

    // The redirect target actually owns the key and serves it locally.
    let owner_addr = resp_addrs[&owner_id];
    let mut owner_client = connect(owner_addr).await;
    owner_client.send(set_cmd(&key, "v1")).await.unwrap();
    assert_eq!(owner_client.next().await.unwrap().unwrap(), RespFrame::ok());
    owner_client.send(get_cmd(&key)).await.unwrap();
    assert_eq!(owner_client.next().await.unwrap().unwrap(), RespFrame::bulk("v1"));
}

#[tokio::test]
async fn hash_tagged_keys_always_redirect_to_the_same_node() {
    let tmp_a = tempfile::tempdir().unwrap();
    let tmp_b = tempfile::tempdir().unwrap();
    let tmp_c = tempfile::tempdir().unwrap();
    let node_a = spawn_node("a", tmp_a.path()).await;
    let node_b = spawn_node("b", tmp_b.path()).await;
    let node_c = spawn_node("c", tmp_c.path()).await;
    let nodes = vec![node_a, node_b, node_c];
    join_all(&nodes).await;

    let target1 = nodes[0].coordinator.router.route(b"{session:42}.token").unwrap();
    let target2 = nodes[0].coordinator.router.route(b"{session:42}.profile").unwrap();
    assert_eq!(target1.node_id, target2.node_id, "same hash tag must co-locate");
    assert_eq!(target1.slot, target2.slot);
}

#[tokio::test]
async fn slot_table_converges_after_a_node_leaves() {
    let tmp_a = tempfile::tempdir().unwrap();
    let tmp_b = tempfile::tempdir().unwrap();
    let tmp_c = tempfile::tempdir().unwrap();
    let node_a = spawn_node("a", tmp_a.path()).await;
    let node_b = spawn_node("b", tmp_b.path()).await;
    let node_c = spawn_node("c", tmp_c.path()).await;
    let nodes = vec![node_a, node_b, node_c];
    join_all(&nodes).await;

    for slot in 0..hypercache::core::cluster::NUM_SLOTS {
        assert!(nodes[0].coordinator.router.current().owner_of_slot(slot).is_some());
    }

    // "b" announces its own departure the same way a graceful shutdown
    // would.
    nodes[1].coordinator.gossip.leave().await;

    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
    loop {
        let b_gone = nodes[0]
            .coordinator
            .router
            .current()
            .slots_of("b")
            .is_empty();
        if b_gone || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(25)).await;
    }

    let table = nodes[0].coordinator.router.current();
    assert!(table.slots_of("b").is_empty(), "a left node should own no slots");
    for slot in 0..hypercache::core::cluster::NUM_SLOTS {
        let owner = table.owner_of_slot(slot).expect("remaining nodes still cover every slot");
        assert_ne!(owner.node_id, "b");
    }
}
