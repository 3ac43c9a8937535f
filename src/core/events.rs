// src/core/events.rs

//! The cluster event bus: local subscribers get an event
//! immediately; the same event also rides the gossip transport so every
//! other node's subscribers see it too, with origin-based loop prevention.
//!
//! Grounded on the teacher's `core/events.rs` `EventBus` (a broadcast
//! channel fanning a single `UnitOfWork` out to the AOF writer and the
//! replication stream), generalized to shape: one bus, many
//! named topics, already-seen-once delivery instead of a fixed two
//! consumers. The gossip bridge itself is grounded on `cluster/gossip.rs`'s
//! `UserEvent` variant, added there for exactly this purpose.

use crate::core::cluster::gossip::{ClusterGossip, RawUserEvent};
use crate::core::cluster::membership::{MembershipEvent, MembershipEventType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{trace, warn};

/// The bounded channel depth handed to each subscriber (
/// "Backpressure: subscribers that fall behind drop events rather than
/// blocking the publisher").
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1_024;

/// What a `ClusterEvent` is reporting enumerated set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEventType {
    DataOperation,
    NodeJoined,
    NodeLeft,
    NodeFailed,
    TopologyChanged,
}

/// A key/value mutation carried by a `DataOperation` event (
/// "a successful local SET/DEL is published to the event bus").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataOp {
    Set {
        key: Bytes,
        value: Bytes,
        ttl_seconds: Option<i64>,
    },
    Delete {
        key: Bytes,
    },
}

/// The event body. Open question: the spec doesn't
/// prescribe a payload shape for non-data events, so topology-ish events
/// (`NodeJoined`/`NodeLeft`/`NodeFailed`/`TopologyChanged`) carry a short
/// human-readable `detail` string rather than a structured `Node` — the
/// `Node` itself is already available locally via `MembershipState`, and
/// the cross-node bridge only needs to say *that* something changed so
/// subscribers can re-read routing state, not reconstruct the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Data(DataOp),
    Topology { detail: String },
}

/// `{event_type, origin_node_id, correlation_id, timestamp, payload}`
///.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub event_type: ClusterEventType,
    pub origin_node_id: String,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: EventPayload,
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

struct Subscriber {
    filter: Option<ClusterEventType>,
    tx: mpsc::Sender<ClusterEvent>,
}

/// The local-first, gossip-bridged publish/subscribe bus.
/// Subscribers register a bounded channel and an optional event-type
/// filter; publishing dispatches locally first, then fans the event out
/// over gossip so remote nodes' subscribers see it too.
pub struct EventBus {
    local_node_id: String,
    gossip: Arc<ClusterGossip>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new(local_node_id: String, gossip: Arc<ClusterGossip>) -> Arc<Self> {
        Arc::new(EventBus {
            local_node_id,
            gossip,
            subscribers: RwLock::new(Vec::new()),
        })
    }

    /// Registers a new subscriber, optionally filtered to one event type.
    /// Per, a subscriber that falls behind has events dropped
    /// rather than blocking the publisher — callers that need every event
    /// should drain promptly.
    pub async fn subscribe(&self, filter: Option<ClusterEventType>) -> mpsc::Receiver<ClusterEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.write().await.push(Subscriber { filter, tx });
        rx
    }

    /// Publishes `event`, dispatching to local subscribers immediately and
    /// then broadcasting it over gossip so other nodes see it too (spec
    /// §4.3 "Delivery semantics: local subscribers are notified before the
    /// event is handed to the gossip transport").
    pub async fn publish(&self, event: ClusterEvent) {
        self.dispatch_local(&event).await;

        let encoded = match bincode::serde::encode_to_vec(&event, bincode_config()) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode cluster event for gossip broadcast");
                return;
            }
        };
        let name = format!("cluster-event:{:?}", event.event_type);
        self.gossip
            .send_user_event(&name, &event.correlation_id, encoded)
            .await;
    }

    /// Convenience constructor + publish for a `DataOperation` originating
    /// locally ( client write path).
    pub async fn publish_data_op(&self, op: DataOp, correlation_id: impl Into<String>) {
        self.publish(ClusterEvent {
            event_type: ClusterEventType::DataOperation,
            origin_node_id: self.local_node_id.clone(),
            correlation_id: correlation_id.into(),
            timestamp: chrono::Utc::now(),
            payload: EventPayload::Data(op),
        })
        .await;
    }

    async fn dispatch_local(&self, event: &ClusterEvent) {
        let subs = self.subscribers.read().await;
        for sub in subs.iter() {
            if let Some(filter) = sub.filter {
                if filter != event.event_type {
                    continue;
                }
            }
            if sub.tx.try_send(event.clone()).is_err() {
                trace!("event bus subscriber channel full or closed; dropping event");
            }
        }
    }

    /// Bridges inbound gossip-carried events into local dispatch, skipping
    /// anything this node itself originated — gossip fans a `UserEvent` out
    /// to every known peer, so origin comparison is the loop-prevention
    /// rule asks for. Runs for the coordinator's lifetime (spec
    /// §4.7).
    pub async fn run_gossip_bridge(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<RawUserEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                result = rx.recv() => {
                    match result {
                        Ok((_event_type, _correlation_id, payload)) => {
                            self.handle_inbound(payload).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event bus gossip bridge lagged; some remote events were dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    async fn handle_inbound(&self, payload: Vec<u8>) {
        let event: ClusterEvent = match bincode::serde::decode_from_slice(&payload, bincode_config()) {
            Ok((e, _)) => e,
            Err(e) => {
                trace!(error = %e, "dropping unparsable cluster event from gossip");
                return;
            }
        };
        if event.origin_node_id == self.local_node_id {
            return;
        }
        self.dispatch_local(&event).await;
    }

    /// Publishes a topology-change notice for a membership transition (spec
    /// §4.3's bridge from membership events into the event bus), used by
    /// the coordinator's membership-bridge task.
    pub async fn publish_membership_event(&self, membership_event: &MembershipEvent) {
        let event_type = match membership_event.event_type {
            MembershipEventType::Joined | MembershipEventType::Recovered => {
                ClusterEventType::NodeJoined
            }
            MembershipEventType::Left => ClusterEventType::NodeLeft,
            MembershipEventType::Failed => ClusterEventType::NodeFailed,
            MembershipEventType::Updated => ClusterEventType::TopologyChanged,
        };
        self.publish(ClusterEvent {
            event_type,
            origin_node_id: self.local_node_id.clone(),
            correlation_id: membership_event.member.node_id.clone(),
            timestamp: chrono::Utc::now(),
            payload: EventPayload::Topology {
                detail: format!(
                    "{:?} {}",
                    membership_event.event_type, membership_event.member.node_id
                ),
            },
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster::gossip::GossipConfig;
    use crate::core::cluster::membership::{Node, NodeCapabilities, NodeStatus};
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    fn local_node(id: &str, gossip_port: u16) -> Node {
        Node {
            node_id: id.to_string(),
            address: "127.0.0.1".to_string(),
            gossip_port,
            resp_port: gossip_port + 1,
            status: NodeStatus::Alive,
            load: 0.0,
            last_seen: Instant::now(),
            capabilities: NodeCapabilities::empty(),
            metadata: HashMap::new(),
        }
    }

    async fn bound_gossip(id: &str, port: u16) -> Arc<ClusterGossip> {
        ClusterGossip::bind(
            local_node(id, port),
            GossipConfig {
                bind_addr: format!("127.0.0.1:{port}").parse().unwrap(),
                heartbeat_interval: Duration::from_millis(50),
                failure_detection_timeout: Duration::from_secs(5),
                reap_after: Duration::from_secs(60),
                cluster_secret: b"test-secret".to_vec(),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn local_subscriber_sees_published_event_immediately() {
        let gossip = bound_gossip("a", 18901).await;
        let bus = EventBus::new("a".to_string(), gossip);
        let mut rx = bus.subscribe(None).await;

        bus.publish_data_op(
            DataOp::Set {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                ttl_seconds: None,
            },
            "corr-1",
        )
        .await;

        let event = rx.try_recv().expect("event delivered synchronously");
        assert_eq!(event.event_type, ClusterEventType::DataOperation);
        assert_eq!(event.origin_node_id, "a");
    }

    #[tokio::test]
    async fn subscriber_filter_excludes_other_event_types() {
        let gossip = bound_gossip("a", 18902).await;
        let bus = EventBus::new("a".to_string(), gossip);
        let mut rx = bus.subscribe(Some(ClusterEventType::NodeJoined)).await;

        bus.publish_data_op(DataOp::Delete { key: Bytes::from_static(b"k") }, "corr-2")
            .await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn gossip_bridge_drops_self_originated_events() {
        let gossip = bound_gossip("a", 18903).await;
        let bus = EventBus::new("a".to_string(), Arc::clone(&gossip));
        let mut rx = bus.subscribe(None).await;

        let event = ClusterEvent {
            event_type: ClusterEventType::DataOperation,
            origin_node_id: "a".to_string(),
            correlation_id: "corr-3".to_string(),
            timestamp: chrono::Utc::now(),
            payload: EventPayload::Data(DataOp::Delete { key: Bytes::from_static(b"k") }),
        };
        bus.handle_inbound(bincode::serde::encode_to_vec(&event, bincode_config()).unwrap())
            .await;

        assert!(rx.try_recv().is_err());
    }
}
