// src/core/cluster/mod.rs

//! Cluster membership, gossip transport, slot hashing, and slot routing
//! (, §4.1 "Slot routing").

pub mod gossip;
pub mod membership;
pub mod routing;
pub mod slot;

pub use gossip::{ClusterGossip, GossipConfig, GossipEvent};
pub use membership::{MembershipEvent, MembershipEventType, MembershipState, Node, NodeCapabilities, NodeStatus};
pub use routing::{RouteTarget, Router, RoutingTable};
pub use slot::{hash_tag, key_slot, key_slot_bytes, NUM_SLOTS};
