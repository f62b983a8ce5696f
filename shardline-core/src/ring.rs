//! Weighted consistent-hash ring used inside a single fault domain.
//!
//! Positions are the first eight bytes of the MD5 digest read big-endian as a
//! signed 64-bit integer, ordered with signed comparison. Any component that
//! computes placements independently has to use the same construction.

use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Weight that maps to exactly `virtual_nodes_per_unit` positions.
pub const WEIGHT_UNIT: u32 = 100;

#[derive(Debug, Default, Clone)]
struct RingState {
    ring: BTreeMap<i64, String>,
    weights: HashMap<String, u32>,
    virtual_hashes: HashMap<String, Vec<i64>>,
}

impl RingState {
    fn remove(&mut self, node: &str) -> bool {
        if self.weights.remove(node).is_none() {
            return false;
        }

        for hash in self.virtual_hashes.remove(node).unwrap_or_default() {
            if self.ring.get(&hash).is_some_and(|owner| owner == node) {
                self.ring.remove(&hash);
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct HashRing {
    virtual_nodes_per_unit: u32,
    state: RwLock<RingState>,
}

impl HashRing {
    pub fn new(virtual_nodes_per_unit: u32) -> Self {
        Self {
            virtual_nodes_per_unit,
            state: RwLock::new(RingState::default()),
        }
    }

    pub fn virtual_nodes_per_unit(&self) -> u32 {
        self.virtual_nodes_per_unit
    }

    /// Number of ring positions a node of the given weight occupies.
    pub fn virtual_nodes_for(&self, weight: u32) -> usize {
        let scaled = (weight as f64 / WEIGHT_UNIT as f64) * self.virtual_nodes_per_unit as f64;
        (scaled.round() as usize).max(1)
    }

    /// Adds a node, replacing all of its positions if it is already present.
    pub fn add_node(&self, node: &str, weight: u32) {
        if node.trim().is_empty() {
            tracing::warn!("Ignoring ring member with a blank name");
            return;
        }

        let virtual_nodes = self.virtual_nodes_for(weight);
        let mut state = self.state.write();
        state.remove(node);

        let mut hashes = Vec::with_capacity(virtual_nodes);
        for index in 0..virtual_nodes {
            let hash = ring_hash(&format!("{}#{}", node, index));
            state.ring.insert(hash, node.to_string());
            hashes.push(hash);
        }

        state.weights.insert(node.to_string(), weight);
        state.virtual_hashes.insert(node.to_string(), hashes);

        tracing::debug!(
            "Added ring node {} (weight={}, virtual_nodes={})",
            node,
            weight,
            virtual_nodes
        );
    }

    /// Removes every position recorded for the node. Unknown nodes are ignored.
    pub fn remove_node(&self, node: &str) {
        if self.state.write().remove(node) {
            tracing::debug!("Removed ring node {}", node);
        }
    }

    /// Owner of the first position at or after the key's hash, wrapping to the
    /// start of the ring.
    pub fn get_node(&self, key: &str) -> Option<String> {
        let state = self.state.read();
        if state.ring.is_empty() {
            return None;
        }

        let hash = ring_hash(key);
        state
            .ring
            .range(hash..)
            .next()
            .or_else(|| state.ring.iter().next())
            .map(|(_, node)| node.clone())
    }

    /// Up to `count` distinct nodes walking clockwise from the key's position.
    pub fn get_nodes(&self, key: &str, count: usize) -> Vec<String> {
        let state = self.state.read();
        if state.ring.is_empty() || count == 0 {
            return Vec::new();
        }

        let hash = ring_hash(key);
        let mut seen = HashSet::new();
        let mut result = Vec::with_capacity(count.min(state.weights.len()));

        for node in state
            .ring
            .range(hash..)
            .chain(state.ring.range(..hash))
            .map(|(_, node)| node)
        {
            if seen.insert(node.as_str()) {
                result.push(node.clone());
                if result.len() >= count {
                    break;
                }
            }
        }

        result
    }

    pub fn contains(&self, node: &str) -> bool {
        self.state.read().weights.contains_key(node)
    }

    pub fn weight(&self, node: &str) -> Option<u32> {
        self.state.read().weights.get(node).copied()
    }

    /// Positions currently owned by the node.
    pub fn virtual_node_count(&self, node: &str) -> usize {
        self.state
            .read()
            .ring
            .values()
            .filter(|owner| owner.as_str() == node)
            .count()
    }

    pub fn position_count(&self) -> usize {
        self.state.read().ring.len()
    }

    /// Member names, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.state.read().weights.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn len(&self) -> usize {
        self.state.read().weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().weights.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.ring.clear();
        state.weights.clear();
        state.virtual_hashes.clear();
    }
}

impl Clone for HashRing {
    fn clone(&self) -> Self {
        Self {
            virtual_nodes_per_unit: self.virtual_nodes_per_unit,
            state: RwLock::new(self.state.read().clone()),
        }
    }
}

/// Ring position of a key.
pub fn ring_hash(key: &str) -> i64 {
    let digest = Md5::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}
