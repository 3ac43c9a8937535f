// src/core/cluster/gossip.rs

//! The networked half of cluster membership: a UDP transport
//! carrying HMAC-signed, bincode-encoded envelopes, driving the pure
//! `MembershipState` state machine in `membership.rs`.
//!
//! Grounded on the teacher's `cluster/gossip.rs` (a dedicated socket-receive
//! task feeding a channel, drained by a `tokio::select!` loop that also
//! drives a gossip-interval ticker and a probe-interval ticker) and
//! `cluster/secure_gossip.rs` (HMAC-signed envelopes guarding against
//! cross-cluster or forged gossip traffic). This module keeps that shape —
//! receive task, ticker-driven send loop, signed envelopes — but replaces
//! the teacher's Redis-Cluster-specific `GossipMessage` payloads (PING/PONG
//! carrying `ClusterNode` snapshots, `FailoverAuthRequest`/`FailReport` for
//! primary failover) with/§4.3's smaller contract: membership
//! PING/ACK carrying `Node` snapshots, plus user events and request/response
//! queries for the event bus to ride on.

use super::membership::{MembershipEvent, MembershipState, Node, NodeCapabilities, NodeStatus};
use crate::core::errors::HyperCacheError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace, warn};

const UDP_BUFFER_SIZE: usize = 65_535;
const GOSSIP_FANOUT: usize = 3;
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

type HmacSha256 = Hmac<Sha256>;

pub type GossipEvent = MembershipEvent;

/// A wire-safe mirror of `Node`: `Instant` isn't serializable, so
/// `last_seen` is dropped from the wire and reset to "now" on receipt —
/// liveness is about when *we* last heard from a peer, not when the
/// gossiping node last heard from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireNode {
    node_id: String,
    address: String,
    gossip_port: u16,
    resp_port: u16,
    status: WireStatus,
    load: f64,
    capabilities: u32,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum WireStatus {
    Alive,
    Suspected,
    Dead,
    Leaving,
}

impl From<&Node> for WireNode {
    fn from(n: &Node) -> Self {
        WireNode {
            node_id: n.node_id.clone(),
            address: n.address.clone(),
            gossip_port: n.gossip_port,
            resp_port: n.resp_port,
            status: match n.status {
                NodeStatus::Alive => WireStatus::Alive,
                NodeStatus::Suspected => WireStatus::Suspected,
                NodeStatus::Dead => WireStatus::Dead,
                NodeStatus::Leaving => WireStatus::Leaving,
            },
            load: n.load,
            capabilities: n.capabilities.bits(),
            metadata: n.metadata.clone(),
        }
    }
}

impl WireNode {
    fn into_node(self) -> Node {
        Node {
            node_id: self.node_id,
            address: self.address,
            gossip_port: self.gossip_port,
            resp_port: self.resp_port,
            status: match self.status {
                WireStatus::Alive => NodeStatus::Alive,
                WireStatus::Suspected => NodeStatus::Suspected,
                WireStatus::Dead => NodeStatus::Dead,
                WireStatus::Leaving => NodeStatus::Leaving,
            },
            load: self.load,
            last_seen: Instant::now(),
            capabilities: NodeCapabilities::from_bits_truncate(self.capabilities),
            metadata: self.metadata,
        }
    }
}

/// The payload half of the gossip wire format ( membership
/// exchange plus §4.3's "the event bus may fan messages out over the
/// gossip transport" bridge).
#[derive(Debug, Clone, Serialize, Deserialize)]
enum GossipPayload {
    Ping { nodes: Vec<WireNode> },
    Ack { nodes: Vec<WireNode> },
    /// A fire-and-forget application event ( `ClusterEvent`).
    UserEvent {
        event_type: String,
        correlation_id: String,
        payload: Vec<u8>,
    },
    /// A request expecting at most one reply per recipient, collected by
    /// the caller of `query()` until `timeout` elapses.
    Query {
        query_id: u64,
        name: String,
        payload: Vec<u8>,
    },
    QueryResponse {
        query_id: u64,
        payload: Vec<u8>,
    },
}

/// The signed envelope actually placed on the wire: `sender_id` plus an
/// HMAC-SHA256 tag over the bincode-encoded payload, keyed by the shared
/// cluster secret.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    sender_id: String,
    payload: Vec<u8>,
    tag: Vec<u8>,
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

fn sign(key: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

fn verify(key: &[u8], payload: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.verify_slice(tag).is_ok()
}

pub struct GossipConfig {
    pub bind_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub failure_detection_timeout: Duration,
    pub reap_after: Duration,
    pub cluster_secret: Vec<u8>,
}

/// The running gossip subsystem for one node. Owns the UDP
/// socket and the `MembershipState`; everything else in the crate reaches
/// membership only through this handle.
/// `(event_type, correlation_id, payload)` as received off the wire, handed
/// to the event bus's bridge subscriber.
pub type RawUserEvent = (String, String, Vec<u8>);

pub struct ClusterGossip {
    socket: Arc<UdpSocket>,
    membership: Arc<MembershipState>,
    cluster_secret: Vec<u8>,
    failure_detection_timeout: Duration,
    heartbeat_interval: Duration,
    events_tx: broadcast::Sender<MembershipEvent>,
    user_events_tx: broadcast::Sender<RawUserEvent>,
    next_query_id: AtomicU64,
    pending_queries: Mutex<HashMap<u64, tokio::sync::mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ClusterGossip {
    pub async fn bind(local: Node, config: GossipConfig) -> Result<Arc<Self>, HyperCacheError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let membership = Arc::new(MembershipState::new(local, config.reap_after));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (user_events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new(ClusterGossip {
            socket: Arc::new(socket),
            membership,
            cluster_secret: config.cluster_secret,
            failure_detection_timeout: config.failure_detection_timeout,
            heartbeat_interval: config.heartbeat_interval,
            events_tx,
            user_events_tx,
            next_query_id: AtomicU64::new(1),
            pending_queries: Mutex::new(HashMap::new()),
        }))
    }

    /// The bridge the event bus subscribes to for gossip-delivered user
    /// events: `origin_node_id` travels inside the decoded
    /// payload, not this tuple, so the bus can apply its own dedup rule.
    pub fn subscribe_user_events(&self) -> broadcast::Receiver<RawUserEvent> {
        self.user_events_tx.subscribe()
    }

    pub fn membership(&self) -> &Arc<MembershipState> {
        &self.membership
    }

    pub fn local_node_id(&self) -> &str {
        &self.membership.local_node_id
    }

    /// A live feed of membership transitions ( subscription
    /// contract: `{event_type, member, timestamp}`), consumed by the
    /// coordinator to rebuild the slot table and by the event bus to bridge
    /// membership changes into `ClusterEvent`s.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events_tx.subscribe()
    }

    pub fn set_metadata(&self, metadata: HashMap<String, String>) {
        let mut local = self.membership.local_node();
        local.metadata = metadata;
        self.membership.merge(local);
    }

    /// Contacts each seed address directly with a `Ping`, seeding the local
    /// membership table from their replies.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<(), HyperCacheError> {
        for seed in seeds {
            if let Err(e) = self.send_ping(*seed).await {
                warn!(addr = %seed, error = %e, "failed to contact seed during join");
            }
        }
        Ok(())
    }

    /// Announces departure, marking itself `Leaving` so peers stop routing to it,
    /// then gossiping that state to known peers before the caller removes
    /// it from the slot table.
    pub async fn leave(&self) {
        let local_id = self.membership.local_node_id.clone();
        self.membership.mark_leaving(&local_id);
        let mut local = self.membership.local_node();
        local.status = NodeStatus::Leaving;
        self.broadcast_to_known_peers(GossipPayload::Ping {
            nodes: vec![WireNode::from(&local)],
        })
        .await;
    }

    pub async fn send_user_event(&self, event_type: &str, correlation_id: &str, payload: Vec<u8>) {
        self.broadcast_to_known_peers(GossipPayload::UserEvent {
            event_type: event_type.to_string(),
            correlation_id: correlation_id.to_string(),
            payload,
        })
        .await;
    }

    /// Sends `name`/`payload` to every known alive peer and collects
    /// replies until `timeout` elapses.
    pub async fn query(&self, name: &str, payload: Vec<u8>, timeout: Duration) -> Vec<Vec<u8>> {
        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        self.pending_queries.lock().await.insert(query_id, tx);

        self.broadcast_to_known_peers(GossipPayload::Query {
            query_id,
            name: name.to_string(),
            payload,
        })
        .await;

        let mut responses = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => {
                    match msg {
                        Some(body) => responses.push(body),
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        self.pending_queries.lock().await.remove(&query_id);
        responses
    }

    async fn broadcast_to_known_peers(&self, payload: GossipPayload) {
        let targets: Vec<SocketAddr> = self
            .membership
            .snapshot()
            .values()
            .filter(|n| n.node_id != self.membership.local_node_id)
            .filter(|n| n.status != NodeStatus::Dead)
            .filter_map(|n| n.gossip_addr().parse().ok())
            .collect();
        for addr in targets {
            if let Err(e) = self.send_envelope(addr, &payload).await {
                trace!(%addr, error = %e, "gossip send failed");
            }
        }
    }

    async fn send_ping(&self, addr: SocketAddr) -> Result<(), HyperCacheError> {
        let nodes: Vec<WireNode> = self.membership.snapshot().values().map(WireNode::from).collect();
        self.send_envelope(addr, &GossipPayload::Ping { nodes }).await
    }

    async fn send_envelope(
        &self,
        addr: SocketAddr,
        payload: &GossipPayload,
    ) -> Result<(), HyperCacheError> {
        let encoded = bincode::serde::encode_to_vec(payload, bincode_config())
            .map_err(|e| HyperCacheError::Encode(e.to_string()))?;
        let tag = sign(&self.cluster_secret, &encoded);
        let envelope = Envelope {
            sender_id: self.membership.local_node_id.clone(),
            payload: encoded,
            tag,
        };
        let bytes = bincode::serde::encode_to_vec(&envelope, bincode_config())
            .map_err(|e| HyperCacheError::Encode(e.to_string()))?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Drives the subsystem: the socket-receive loop and the periodic
    /// heartbeat/failure-detection/reap ticks, until `shutdown_rx` fires
    /// ( coordinator-driven lifecycle).
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut heartbeat_ticker = tokio::time::interval(self.heartbeat_interval);
        let failure_timeout = self.failure_detection_timeout;
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!("gossip subsystem shutting down");
                    return;
                }

                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => warn!(error = %e, "gossip socket recv failed"),
                    }
                }

                _ = heartbeat_ticker.tick() => {
                    self.tick(failure_timeout).await;
                }
            }
        }
    }

    async fn tick(&self, failure_timeout: Duration) {
        let events = self.membership.check_timeouts(failure_timeout);
        for event in events {
            let _ = self.events_tx.send(event);
        }
        for id in self.membership.reap_dead_nodes() {
            debug!(node_id = %id, "reaped dead node after grace period");
        }
        if let Err(e) = self.send_ping_to_random_peer().await {
            trace!(error = %e, "periodic gossip ping failed");
        }
    }

    async fn send_ping_to_random_peer(&self) -> Result<(), HyperCacheError> {
        let nodes = self.membership.snapshot();
        let mut peers: Vec<&Node> = nodes
            .values()
            .filter(|n| n.node_id != self.membership.local_node_id && n.status != NodeStatus::Dead)
            .collect();
        if peers.is_empty() {
            return Ok(());
        }
        peers.truncate(GOSSIP_FANOUT.min(peers.len()));
        for peer in peers {
            if let Ok(addr) = peer.gossip_addr().parse() {
                self.send_ping(addr).await?;
            }
        }
        Ok(())
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let envelope: Envelope = match bincode::serde::decode_from_slice(bytes, bincode_config()) {
            Ok((e, _)) => e,
            Err(e) => {
                trace!(%from, error = %e, "dropping malformed gossip datagram");
                return;
            }
        };
        if !verify(&self.cluster_secret, &envelope.payload, &envelope.tag) {
            warn!(%from, sender_id = %envelope.sender_id, "dropping gossip datagram with invalid signature");
            return;
        }
        let payload: GossipPayload =
            match bincode::serde::decode_from_slice(&envelope.payload, bincode_config()) {
                Ok((p, _)) => p,
                Err(e) => {
                    trace!(%from, error = %e, "dropping gossip datagram with unparsable payload");
                    return;
                }
            };

        match payload {
            GossipPayload::Ping { nodes } => {
                self.merge_and_publish(nodes);
                self.membership.mark_heartbeat(&envelope.sender_id);
                let reply_nodes: Vec<WireNode> =
                    self.membership.snapshot().values().map(WireNode::from).collect();
                let _ = self
                    .send_envelope(from, &GossipPayload::Ack { nodes: reply_nodes })
                    .await;
            }
            GossipPayload::Ack { nodes } => {
                self.merge_and_publish(nodes);
                self.membership.mark_heartbeat(&envelope.sender_id);
            }
            GossipPayload::UserEvent {
                event_type,
                correlation_id,
                payload,
            } => {
                self.membership.mark_heartbeat(&envelope.sender_id);
                let _ = self.user_events_tx.send((event_type, correlation_id, payload));
            }
            GossipPayload::Query { query_id, name, payload } => {
                self.membership.mark_heartbeat(&envelope.sender_id);
                debug!(%name, query_id, "received gossip query with no local handler registered");
                let _ = payload;
            }
            GossipPayload::QueryResponse { query_id, payload } => {
                if let Some(tx) = self.pending_queries.lock().await.get(&query_id) {
                    let _ = tx.send(payload);
                }
            }
        }
    }

    fn merge_and_publish(&self, nodes: Vec<WireNode>) {
        for wire in nodes {
            let node = wire.into_node();
            if let Some(event) = self.membership.merge(node) {
                let _ = self.events_tx.send(event);
            }
        }
    }
}
