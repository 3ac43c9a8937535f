// src/core/cluster/routing.rs

//! The slot table and virtual-node hash ring described in
//!
//! Grounded on the teacher's `cluster/state.rs`, which keeps a
//! `[RwLock<Option<String>>; NUM_SLOTS]` array rebuilt from a `DashMap` of
//! known nodes. This module generalizes that to the simpler, fully
//! eventually-consistent HyperCache model: no migrating/importing slots, no
//! failover-vote epochs, just "recompute the whole table from the current
//! alive set and swap it in."
//!
//! The table itself is held behind a short-lived `RwLock<Arc<RoutingTable>>`
//! so lookups clone an `Arc` under a read lock and then operate on an
//! immutable snapshot — a rebuild never blocks a lookup for longer than an
//! `Arc` clone, which is the copy-on-rebuild contract asks for.

use super::membership::{Node, NodeStatus};
use super::slot::{key_slot, NUM_SLOTS};
use crate::core::errors::HyperCacheError;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

const DEFAULT_VNODES_PER_NODE: usize = 256;
const LOOKUP_CACHE_CAPACITY: usize = 65_536;

/// An immutable, fully built routing snapshot. Replaced wholesale on every
/// membership change; never mutated in place.
#[derive(Debug, Default)]
pub struct RoutingTable {
    /// `slots[slot as usize]` is the owning node's id, or `None` if no alive
    /// node currently owns it (can happen transiently with zero alive nodes).
    slots: Vec<Option<String>>,
    /// Ascending-sorted `(hash, node_id)` virtual node ring.
    ring: Vec<(u64, String)>,
    nodes: HashMap<String, Node>,
}

impl RoutingTable {
    /// Rebuilds the table from the given node set. Slots are partitioned as
    /// evenly as possible among alive nodes, sorted by `node_id`, with any
    /// remainder going to the lowest-ID nodes.
    pub fn build(nodes: &HashMap<String, Node>, vnodes_per_node: usize) -> Self {
        let mut alive_ids: Vec<&String> = nodes
            .iter()
            .filter(|(_, n)| n.status == NodeStatus::Alive)
            .map(|(id, _)| id)
            .collect();
        alive_ids.sort();

        let mut slots = vec![None; NUM_SLOTS as usize];
        if !alive_ids.is_empty() {
            let n = alive_ids.len();
            let base = NUM_SLOTS as usize / n;
            let extra = NUM_SLOTS as usize % n;
            let mut cursor = 0usize;
            for (i, node_id) in alive_ids.iter().enumerate() {
                let share = if i < extra { base + 1 } else { base };
                for slot in cursor..cursor + share {
                    slots[slot] = Some((*node_id).clone());
                }
                cursor += share;
            }
        }

        let mut ring: Vec<(u64, String)> = Vec::with_capacity(alive_ids.len() * vnodes_per_node);
        for node_id in &alive_ids {
            for i in 0..vnodes_per_node {
                ring.push((vnode_hash(node_id, i), (*node_id).clone()));
            }
        }
        ring.sort_by_key(|(h, _)| *h);

        RoutingTable {
            slots,
            ring,
            nodes: nodes.clone(),
        }
    }

    pub fn owner_of_slot(&self, slot: u16) -> Option<&Node> {
        self.slots
            .get(slot as usize)
            .and_then(|o| o.as_ref())
            .and_then(|id| self.nodes.get(id))
    }

    pub fn slots_of(&self, node_id: &str) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, owner)| {
                if owner.as_deref() == Some(node_id) {
                    Some(slot as u16)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Returns up to `k` distinct physical node ids, walking the ring
    /// clockwise from `H(key)` and skipping non-alive nodes.
    pub fn replicas_for_key(&self, key: &[u8], k: usize) -> Vec<String> {
        if self.ring.is_empty() || k == 0 {
            return Vec::new();
        }
        let target = key_hash(key);
        let start = self
            .ring
            .partition_point(|(h, _)| *h < target)
            .min(self.ring.len().saturating_sub(1));

        let mut out = Vec::with_capacity(k);
        let len = self.ring.len();
        for i in 0..len {
            let (_, node_id) = &self.ring[(start + i) % len];
            if out.contains(node_id) {
                continue;
            }
            if self
                .nodes
                .get(node_id)
                .is_some_and(|n| n.status == NodeStatus::Alive)
            {
                out.push(node_id.clone());
            }
            if out.len() == k {
                break;
            }
        }
        out
    }
}

fn vnode_hash(node_id: &str, i: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    node_id.hash(&mut hasher);
    i.hash(&mut hasher);
    hasher.finish()
}

fn key_hash(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A fully resolved routing decision for a key-bearing command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub slot: u16,
    pub node_id: String,
    pub address: String,
    pub resp_port: u16,
}

impl RouteTarget {
    /// `"host:port"`, the form a `MOVED`/`ASK`-style redirect quotes.
    pub fn resp_addr(&self) -> String {
        format!("{}:{}", self.address, self.resp_port)
    }
}

/// The routing front-end: owns the current `RoutingTable` snapshot and a
/// bounded lookup cache contract (`route`, `replicas`,
/// `slots_of`).
pub struct Router {
    local_node_id: String,
    vnodes_per_node: usize,
    table: RwLock<Arc<RoutingTable>>,
    lookup_cache: Mutex<LruCache<Bytes, Vec<String>>>,
}

impl Router {
    pub fn new(local_node_id: String) -> Self {
        Self::with_vnodes(local_node_id, DEFAULT_VNODES_PER_NODE)
    }

    pub fn with_vnodes(local_node_id: String, vnodes_per_node: usize) -> Self {
        Router {
            local_node_id,
            vnodes_per_node,
            table: RwLock::new(Arc::new(RoutingTable::default())),
            lookup_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(LOOKUP_CACHE_CAPACITY).unwrap(),
            )),
        }
    }

    /// Rebuilds and atomically swaps in a new routing table from the given
    /// node view. Any lookup already holding the old `Arc` keeps running
    /// against it; new lookups see the new table. The lookup cache is fully
    /// invalidated
    pub fn rebuild(&self, nodes: &HashMap<String, Node>) {
        let new_table = Arc::new(RoutingTable::build(nodes, self.vnodes_per_node));
        *self.table.write() = new_table;
        self.lookup_cache.lock().clear();
    }

    pub fn current(&self) -> Arc<RoutingTable> {
        self.table.read().clone()
    }

    /// `route(key) -> (slot, node_id, address, resp_port)`. Returns `None`
    /// if no node currently owns the slot (empty cluster / transient gap).
    pub fn route(&self, key: &[u8]) -> Option<RouteTarget> {
        let slot = key_slot(key);
        let table = self.current();
        let owner = table.owner_of_slot(slot)?;
        Some(RouteTarget {
            slot,
            node_id: owner.node_id.clone(),
            address: owner.address.clone(),
            resp_port: owner.resp_port,
        })
    }

    pub fn is_local(&self, target: &RouteTarget) -> bool {
        target.node_id == self.local_node_id
    }

    /// `replicas(key, k) -> [node_id]`, bounded LRU-cached
    pub fn replicas(&self, key: &[u8], k: usize) -> Vec<String> {
        let owned = Bytes::copy_from_slice(key);
        if let Some(hit) = self.lookup_cache.lock().get(&owned) {
            return hit.clone();
        }
        let table = self.current();
        let result = table.replicas_for_key(key, k);
        self.lookup_cache.lock().put(owned, result.clone());
        result
    }

    pub fn slots_of(&self, node_id: &str) -> Vec<u16> {
        self.current().slots_of(node_id)
    }

    /// Resolves a single routing decision for a (possibly multi-key) command,
    ///: every key must hash to the same slot (`CrossSlot`
    /// otherwise), and that slot must currently have an owner (`ClusterDown`
    /// otherwise).
    pub fn route_for_keys(&self, keys: &[Bytes]) -> Result<RouteTarget, HyperCacheError> {
        let mut slots = keys.iter().map(|k| key_slot(k));
        let slot = match slots.next() {
            Some(first) => {
                if slots.any(|s| s != first) {
                    return Err(HyperCacheError::CrossSlot);
                }
                first
            }
            None => {
                return Err(HyperCacheError::ClusterDown(
                    "no keys in request".to_string(),
                ))
            }
        };

        let table = self.current();
        let owner = table.owner_of_slot(slot).ok_or_else(|| {
            HyperCacheError::ClusterDown(format!("slot {slot} has no owner"))
        })?;
        Ok(RouteTarget {
            slot,
            node_id: owner.node_id.clone(),
            address: owner.address.clone(),
            resp_port: owner.resp_port,
        })
    }
}
