// src/core/cluster/membership.rs

//! Node identity, liveness state, and the pure state-transition logic for
//! the gossip membership protocol. The networked half (UDP
//! transport, signed wire messages, the background task) lives in
//! `gossip.rs`; this module is kept free of I/O so the alive -> suspected
//! -> dead -> removed lifecycle can be unit tested directly.
//!
//! Grounded on the teacher's `cluster/state.rs` `ClusterNode`/`NodeFlags`/
//! `ClusterState` trio: a bitflags capability set per node, a `DashMap` of
//! known nodes keyed by id, and a separate not-gossiped bookkeeping map
//! (there: `pfail_reports`; here: `suspected_since`) for detector timing.

use bitflags::bitflags;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeCapabilities: u32 {
        const NONE = 0;
        const REPLICATION = 0b0000_0001;
    }
}

impl NodeCapabilities {
    pub fn empty() -> Self {
        NodeCapabilities::NONE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Alive,
    Suspected,
    Dead,
    Leaving,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub node_id: String,
    pub address: String,
    pub gossip_port: u16,
    pub resp_port: u16,
    pub status: NodeStatus,
    pub load: f64,
    pub last_seen: Instant,
    pub capabilities: NodeCapabilities,
    /// Free-form tags gossiped alongside liveness state, updated through
    /// `Membership::set_metadata`.
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.address, self.gossip_port)
    }

    pub fn resp_addr(&self) -> String {
        format!("{}:{}", self.address, self.resp_port)
    }
}

/// The kind of change a membership subscriber is told about, per spec
/// §4.2's `{event_type, member, timestamp}` subscription contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEventType {
    Joined,
    Left,
    Failed,
    Updated,
    Recovered,
}

#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub event_type: MembershipEventType,
    pub member: Node,
    pub timestamp: Instant,
}

/// Holds the known-node table and the PFAIL-style bookkeeping needed to run
/// the SWIM alive -> suspected -> dead -> removed lifecycle. Does not touch
/// the network; `gossip.rs` drives it from received messages and timers.
pub struct MembershipState {
    pub local_node_id: String,
    nodes: DashMap<String, Node>,
    suspected_since: DashMap<String, Instant>,
    /// Time a `Dead` node is kept around (so peers can still see the
    /// transition) before being reaped entirely.
    reap_after: Duration,
    dead_since: DashMap<String, Instant>,
}

impl MembershipState {
    pub fn new(local: Node, reap_after: Duration) -> Self {
        let nodes = DashMap::new();
        nodes.insert(local.node_id.clone(), local.clone());
        MembershipState {
            local_node_id: local.node_id,
            nodes,
            suspected_since: DashMap::new(),
            reap_after,
            dead_since: DashMap::new(),
        }
    }

    pub fn local_node(&self) -> Node {
        self.nodes
            .get(&self.local_node_id)
            .expect("local node always present")
            .clone()
    }

    pub fn set_local_load(&self, load: f64) {
        if let Some(mut n) = self.nodes.get_mut(&self.local_node_id) {
            n.load = load;
        }
    }

    pub fn snapshot(&self) -> HashMap<String, Node> {
        self.nodes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    /// Inserts or updates a node learned about from a gossip message.
    /// Returns a `MembershipEvent` if this merge represents a
    /// Joined/Updated/Recovered transition worth telling subscribers about.
    pub fn merge(&self, incoming: Node) -> Option<MembershipEvent> {
        if incoming.node_id == self.local_node_id {
            return None;
        }
        match self.nodes.get(&incoming.node_id).map(|n| n.status) {
            None => {
                self.nodes.insert(incoming.node_id.clone(), incoming.clone());
                Some(MembershipEvent {
                    event_type: MembershipEventType::Joined,
                    member: incoming,
                    timestamp: Instant::now(),
                })
            }
            Some(prev_status) => {
                self.suspected_since.remove(&incoming.node_id);
                self.dead_since.remove(&incoming.node_id);
                let recovered = matches!(prev_status, NodeStatus::Suspected | NodeStatus::Dead)
                    && incoming.status == NodeStatus::Alive;
                self.nodes.insert(incoming.node_id.clone(), incoming.clone());
                if recovered {
                    Some(MembershipEvent {
                        event_type: MembershipEventType::Recovered,
                        member: incoming,
                        timestamp: Instant::now(),
                    })
                } else {
                    Some(MembershipEvent {
                        event_type: MembershipEventType::Updated,
                        member: incoming,
                        timestamp: Instant::now(),
                    })
                }
            }
        }
    }

    pub fn mark_heartbeat(&self, node_id: &str) {
        if let Some(mut n) = self.nodes.get_mut(node_id) {
            n.last_seen = Instant::now();
            if n.status != NodeStatus::Alive {
                n.status = NodeStatus::Alive;
            }
        }
        self.suspected_since.remove(node_id);
        self.dead_since.remove(node_id);
    }

    /// Sweeps every known non-local node: alive nodes silent for longer
    /// than `failure_timeout` become `Suspected`; suspected nodes silent
    /// for a further `failure_timeout` become `Dead`. Returns the resulting
    /// transition events for the caller to publish.
    pub fn check_timeouts(&self, failure_timeout: Duration) -> Vec<MembershipEvent> {
        let now = Instant::now();
        let mut events = Vec::new();
        let ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| e.key() != &self.local_node_id)
            .map(|e| e.key().clone())
            .collect();

        for id in ids {
            let Some(mut entry) = self.nodes.get_mut(&id) else {
                continue;
            };
            match entry.status {
                NodeStatus::Alive => {
                    if now.duration_since(entry.last_seen) >= failure_timeout {
                        entry.status = NodeStatus::Suspected;
                        self.suspected_since.insert(id.clone(), now);
                        events.push(MembershipEvent {
                            event_type: MembershipEventType::Failed,
                            member: entry.clone(),
                            timestamp: now,
                        });
                    }
                }
                NodeStatus::Suspected => {
                    let since = self.suspected_since.get(&id).map(|v| *v).unwrap_or(now);
                    if now.duration_since(since) >= failure_timeout {
                        entry.status = NodeStatus::Dead;
                        self.dead_since.insert(id.clone(), now);
                        events.push(MembershipEvent {
                            event_type: MembershipEventType::Failed,
                            member: entry.clone(),
                            timestamp: now,
                        });
                    }
                }
                NodeStatus::Dead => {
                    // Reaping is handled by `reap_dead_nodes`.
                }
                NodeStatus::Leaving => {}
            }
        }
        events
    }

    /// Removes nodes that have been `Dead` for longer than `reap_after`.
    /// Returns the ids removed so the caller can emit `Left` events.
    pub fn reap_dead_nodes(&self) -> Vec<String> {
        let now = Instant::now();
        let to_remove: Vec<String> = self
            .dead_since
            .iter()
            .filter(|e| now.duration_since(*e.value()) >= self.reap_after)
            .map(|e| e.key().clone())
            .collect();
        for id in &to_remove {
            self.nodes.remove(id);
            self.dead_since.remove(id);
            self.suspected_since.remove(id);
        }
        to_remove
    }

    pub fn mark_leaving(&self, node_id: &str) -> Option<Node> {
        self.nodes.get_mut(node_id).map(|mut n| {
            n.status = NodeStatus::Leaving;
            n.clone()
        })
    }

    pub fn remove(&self, node_id: &str) {
        self.nodes.remove(node_id);
        self.suspected_since.remove(node_id);
        self.dead_since.remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node {
            node_id: id.to_string(),
            address: "127.0.0.1".to_string(),
            gossip_port: 7000,
            resp_port: 6379,
            status: NodeStatus::Alive,
            load: 0.0,
            last_seen: Instant::now(),
            capabilities: NodeCapabilities::empty(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn merge_unknown_node_emits_joined() {
        let state = MembershipState::new(node("a"), Duration::from_secs(60));
        let ev = state.merge(node("b")).unwrap();
        assert_eq!(ev.event_type, MembershipEventType::Joined);
        assert!(state.get("b").is_some());
    }

    #[test]
    fn alive_to_suspected_to_dead_transition() {
        let state = MembershipState::new(node("a"), Duration::from_secs(60));
        state.merge(node("b")).unwrap();
        if let Some(mut n) = state.nodes.get_mut("b") {
            n.last_seen = Instant::now() - Duration::from_secs(10);
        }
        let events = state.check_timeouts(Duration::from_secs(5));
        assert_eq!(events.len(), 1);
        assert_eq!(state.get("b").unwrap().status, NodeStatus::Suspected);

        // Force the suspicion window to have elapsed too.
        state.suspected_since.insert("b".to_string(), Instant::now() - Duration::from_secs(10));
        let events = state.check_timeouts(Duration::from_secs(5));
        assert_eq!(events.len(), 1);
        assert_eq!(state.get("b").unwrap().status, NodeStatus::Dead);
    }

    #[test]
    fn heartbeat_recovers_suspected_node() {
        let state = MembershipState::new(node("a"), Duration::from_secs(60));
        state.merge(node("b")).unwrap();
        if let Some(mut n) = state.nodes.get_mut("b") {
            n.status = NodeStatus::Suspected;
        }
        state.mark_heartbeat("b");
        assert_eq!(state.get("b").unwrap().status, NodeStatus::Alive);
    }

    #[test]
    fn dead_nodes_reaped_after_grace_period() {
        let state = MembershipState::new(node("a"), Duration::from_millis(10));
        state.merge(node("b")).unwrap();
        if let Some(mut n) = state.nodes.get_mut("b") {
            n.status = NodeStatus::Dead;
        }
        state.dead_since.insert("b".to_string(), Instant::now() - Duration::from_secs(1));
        let reaped = state.reap_dead_nodes();
        assert_eq!(reaped, vec!["b".to_string()]);
        assert!(state.get("b").is_none());
    }
}
