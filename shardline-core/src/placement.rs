//! Fault-domain aware placement.
//!
//! All rings, domain memberships and policy live in one immutable
//! [`TopologySnapshot`]. Builders assemble a replacement under `build_lock`
//! and publish it with a single pointer swap; readers never take that lock.

use crate::health::NodeHealth;
use crate::ring::HashRing;
use crate::source::ConfigSource;
use crate::{FaultDomainConfig, NodeConfig, TopologyConfig};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct TopologySnapshot {
    revision: u64,
    rings: HashMap<String, Arc<HashRing>>,
    domain_nodes: HashMap<String, BTreeSet<String>>,
    domain_configs: HashMap<String, FaultDomainConfig>,
    nodes: HashMap<String, NodeConfig>,
    active_domains: Vec<String>,
    standby_domain: Option<String>,
    replication_factor: usize,
    write_quorum: usize,
    min_healthy_nodes_per_domain: usize,
    virtual_nodes_per_unit: u32,
}

impl TopologySnapshot {
    /// Builds rings and memberships from a full topology.
    pub fn build(topology: &TopologyConfig, revision: u64) -> Self {
        let mut domain_configs = HashMap::new();
        for domain in &topology.domains {
            if domain.name.trim().is_empty() {
                tracing::warn!("Skipping fault domain entry with a blank name");
                continue;
            }
            domain_configs.insert(domain.name.clone(), domain.clone());
        }

        let mut nodes = HashMap::new();
        let mut rings: HashMap<String, HashRing> = HashMap::new();
        let mut domain_nodes: HashMap<String, BTreeSet<String>> = HashMap::new();

        for node in topology.unique_nodes() {
            if !node.enabled {
                tracing::debug!("Skipping disabled node {}", node.name);
                continue;
            }
            nodes.insert(node.name.clone(), node.clone());

            let Some(domain) = node.domain() else {
                tracing::warn!("Node {} has no fault domain, skipping placement", node.name);
                continue;
            };

            domain_nodes
                .entry(domain.to_string())
                .or_default()
                .insert(node.name.clone());
            rings
                .entry(domain.to_string())
                .or_insert_with(|| HashRing::new(topology.virtual_nodes_per_weight_unit))
                .add_node(&node.name, node.weight);
        }

        Self {
            revision,
            rings: rings
                .into_iter()
                .map(|(domain, ring)| (domain, Arc::new(ring)))
                .collect(),
            domain_nodes,
            domain_configs,
            nodes,
            active_domains: topology.active_domains.clone(),
            standby_domain: topology.standby_domain().map(str::to_string),
            replication_factor: topology.effective_replication_factor(),
            write_quorum: topology.effective_write_quorum(),
            min_healthy_nodes_per_domain: topology.min_healthy_nodes_per_domain,
            virtual_nodes_per_unit: topology.virtual_nodes_per_weight_unit,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn ring(&self, domain: &str) -> Option<&HashRing> {
        self.rings.get(domain).map(Arc::as_ref)
    }

    pub fn active_domains(&self) -> &[String] {
        &self.active_domains
    }

    pub fn standby_domain(&self) -> Option<&str> {
        self.standby_domain.as_deref()
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn write_quorum(&self) -> usize {
        self.write_quorum
    }

    pub fn domain_config(&self, domain: &str) -> Option<&FaultDomainConfig> {
        self.domain_configs.get(domain)
    }

    pub fn node_config(&self, node: &str) -> Option<&NodeConfig> {
        self.nodes.get(node)
    }

    /// Healthy members a domain should keep before standby nodes are promoted.
    pub fn min_healthy_nodes(&self, domain: &str) -> usize {
        self.domain_configs
            .get(domain)
            .and_then(|config| config.min_healthy_nodes)
            .unwrap_or(self.min_healthy_nodes_per_domain)
    }

    /// Members of a domain, sorted by name.
    pub fn nodes_in_domain(&self, domain: &str) -> Vec<String> {
        self.domain_nodes
            .get(domain)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn node_domain(&self, node: &str) -> Option<&str> {
        self.domain_nodes
            .iter()
            .find(|(_, members)| members.contains(node))
            .map(|(domain, _)| domain.as_str())
    }

    /// Active domains that accept writes, in priority order. Domains without
    /// an explicit config are write-eligible.
    pub fn writable_domains(&self) -> Vec<FaultDomainConfig> {
        self.active_domains
            .iter()
            .filter_map(|domain| match self.domain_configs.get(domain) {
                Some(config) if config.accepts_writes => Some(config.clone()),
                Some(_) => None,
                None => Some(FaultDomainConfig::implicit(domain.clone())),
            })
            .collect()
    }

    /// Every domain that is configured, active, or has members.
    pub fn known_domains(&self) -> Vec<String> {
        let mut domains: BTreeSet<String> = self.domain_nodes.keys().cloned().collect();
        domains.extend(self.domain_configs.keys().cloned());
        domains.extend(self.active_domains.iter().cloned());
        domains.extend(self.standby_domain.iter().cloned());
        domains.into_iter().collect()
    }

    pub fn is_using_fault_domains(&self) -> bool {
        self.active_domains.iter().any(|domain| {
            self.domain_nodes
                .get(domain)
                .is_some_and(|members| !members.is_empty())
        })
    }

    fn domain_summary(&self) -> String {
        let mut summary: Vec<String> = self
            .domain_nodes
            .iter()
            .map(|(domain, members)| format!("{}={} nodes", domain, members.len()))
            .collect();
        summary.sort();
        summary.join(", ")
    }
}

pub struct PlacementManager {
    source: Arc<dyn ConfigSource>,
    health: Arc<dyn NodeHealth>,
    snapshot: ArcSwap<TopologySnapshot>,
    build_lock: Mutex<()>,
}

impl PlacementManager {
    /// Creates the manager and builds the first snapshot from the source.
    pub fn new(source: Arc<dyn ConfigSource>, health: Arc<dyn NodeHealth>) -> Self {
        let manager = Self {
            source,
            health,
            snapshot: ArcSwap::from_pointee(TopologySnapshot::default()),
            build_lock: Mutex::new(()),
        };
        manager.rebuild_rings();
        manager
    }

    /// Rebuilds every domain ring from the source and publishes the result.
    pub fn rebuild_rings(&self) -> Arc<TopologySnapshot> {
        let _guard = self.build_lock.lock();
        let topology = self.source.current_topology();
        let revision = self.snapshot.load().revision + 1;

        let snapshot = Arc::new(TopologySnapshot::build(&topology, revision));
        self.snapshot.store(snapshot.clone());

        tracing::info!(
            "Rebuilt fault domain rings (revision {}): {}",
            revision,
            snapshot.domain_summary()
        );
        snapshot
    }

    /// The snapshot currently published.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot.load_full()
    }

    pub fn active_domains(&self) -> Vec<String> {
        self.snapshot.load().active_domains.clone()
    }

    pub fn standby_domain(&self) -> Option<String> {
        self.snapshot.load().standby_domain.clone()
    }

    pub fn is_standby_enabled(&self) -> bool {
        self.snapshot.load().standby_domain.is_some()
    }

    pub fn is_single_domain_mode(&self) -> bool {
        self.snapshot.load().active_domains.len() <= 1
    }

    pub fn replication_factor(&self) -> usize {
        self.snapshot.load().replication_factor
    }

    pub fn write_quorum(&self) -> usize {
        self.snapshot.load().write_quorum
    }

    pub fn writable_domains(&self) -> Vec<FaultDomainConfig> {
        self.snapshot.load().writable_domains()
    }

    /// Nodes that should receive a new chunk: at most one per write-eligible
    /// active domain, in priority order, up to the replication factor.
    /// Domains without a healthy node are skipped.
    pub fn target_nodes(&self, chunk_key: &str) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let writable = snapshot.writable_domains();
        let needed = snapshot.replication_factor.min(writable.len());

        let mut targets = Vec::with_capacity(needed);
        for domain in writable.iter().take(needed) {
            let Some(ring) = snapshot.ring(&domain.name).filter(|ring| !ring.is_empty()) else {
                tracing::debug!("Fault domain {} has no nodes", domain.name);
                continue;
            };

            match self.healthy_node_in_ring(ring, chunk_key, &domain.name) {
                Some(node) => targets.push(node),
                None => tracing::debug!("Fault domain {} has no healthy node", domain.name),
            }
        }

        targets
    }

    /// The ring-mapped node of every active domain, regardless of health.
    pub fn candidate_nodes(&self, chunk_key: &str) -> Vec<String> {
        let snapshot = self.snapshot.load();
        snapshot
            .active_domains
            .iter()
            .filter_map(|domain| snapshot.ring(domain)?.get_node(chunk_key))
            .collect()
    }

    /// Online node with the lowest load score; the earliest wins ties.
    pub fn select_best_node_for_read(&self, nodes: &[String]) -> Option<String> {
        let mut best: Option<(&String, f64)> = None;
        for node in nodes {
            if !self.health.is_node_online(node) {
                continue;
            }
            let score = self.health.node_load_score(node);
            if best.is_none_or(|(_, best_score)| score < best_score) {
                best = Some((node, score));
            }
        }

        best.map(|(node, _)| node.clone())
    }

    pub fn read_node(&self, chunk_key: &str) -> Option<String> {
        self.select_best_node_for_read(&self.candidate_nodes(chunk_key))
    }

    /// Placement inside one domain, used by rebalancing.
    pub fn target_node_in_domain(&self, chunk_key: &str, domain: &str) -> Option<String> {
        let snapshot = self.snapshot.load();
        let ring = snapshot.ring(domain).filter(|ring| !ring.is_empty())?;
        self.healthy_node_in_ring(ring, chunk_key, domain)
    }

    pub fn find_healthy_node_in_domain(&self, domain: &str) -> Option<String> {
        let snapshot = self.snapshot.load();
        snapshot
            .domain_nodes
            .get(domain)?
            .iter()
            .find(|node| self.health.is_node_online(node))
            .cloned()
    }

    pub fn count_healthy_nodes_in_domain(&self, domain: &str) -> usize {
        let snapshot = self.snapshot.load();
        snapshot
            .domain_nodes
            .get(domain)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter(|node| self.health.is_node_online(node))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn nodes_in_domain(&self, domain: &str) -> Vec<String> {
        self.snapshot.load().nodes_in_domain(domain)
    }

    pub fn healthy_nodes_in_domain(&self, domain: &str) -> Vec<String> {
        self.nodes_in_domain(domain)
            .into_iter()
            .filter(|node| self.health.is_node_online(node))
            .collect()
    }

    pub fn standby_nodes(&self) -> Vec<String> {
        let snapshot = self.snapshot.load();
        match snapshot.standby_domain.as_deref() {
            Some(domain) => snapshot.nodes_in_domain(domain),
            None => Vec::new(),
        }
    }

    pub fn healthy_standby_nodes(&self) -> Vec<String> {
        self.standby_nodes()
            .into_iter()
            .filter(|node| self.health.is_node_online(node))
            .collect()
    }

    pub fn node_domain(&self, node: &str) -> Option<String> {
        self.snapshot.load().node_domain(node).map(str::to_string)
    }

    pub fn domain_config(&self, domain: &str) -> Option<FaultDomainConfig> {
        self.snapshot.load().domain_config(domain).cloned()
    }

    /// Effective config of a placed node, including in-memory domain changes.
    pub fn node_config(&self, node: &str) -> Option<NodeConfig> {
        self.snapshot.load().node_config(node).cloned()
    }

    pub fn is_using_fault_domains(&self) -> bool {
        self.snapshot.load().is_using_fault_domains()
    }

    /// Moves a node to another fault domain (standby promotion).
    ///
    /// Only the two affected rings are rebuilt; the result is published as one
    /// snapshot so no reader sees the node in both domains or in neither. The
    /// change lasts until the next [`rebuild_rings`](Self::rebuild_rings).
    pub fn change_node_domain(&self, node: &str, new_domain: &str) -> bool {
        let new_domain = new_domain.trim();
        if new_domain.is_empty() {
            tracing::warn!("Refusing to move node {} to a blank fault domain", node);
            return false;
        }

        let _guard = self.build_lock.lock();
        let current = self.snapshot.load_full();

        let Some(config) = current.nodes.get(node) else {
            tracing::warn!("Node {} does not exist, cannot change its fault domain", node);
            return false;
        };

        let old_domain = current.node_domain(node).map(str::to_string);
        if old_domain.as_deref() == Some(new_domain) {
            tracing::debug!("Node {} is already in fault domain {}", node, new_domain);
            return true;
        }

        let mut rings = current.rings.clone();
        let mut domain_nodes = current.domain_nodes.clone();

        if let Some(old) = old_domain.as_deref() {
            if let Some(ring) = rings.get(old) {
                let ring = HashRing::clone(ring);
                ring.remove_node(node);
                if ring.is_empty() {
                    rings.remove(old);
                } else {
                    rings.insert(old.to_string(), Arc::new(ring));
                }
            }

            if let Some(members) = domain_nodes.get_mut(old) {
                members.remove(node);
                if members.is_empty() {
                    domain_nodes.remove(old);
                }
            }
        }

        let ring = rings
            .get(new_domain)
            .map(|ring| HashRing::clone(ring))
            .unwrap_or_else(|| HashRing::new(current.virtual_nodes_per_unit));
        ring.add_node(node, config.weight);
        rings.insert(new_domain.to_string(), Arc::new(ring));
        domain_nodes
            .entry(new_domain.to_string())
            .or_default()
            .insert(node.to_string());

        let mut nodes = current.nodes.clone();
        let mut updated = config.clone();
        updated.fault_domain = Some(new_domain.to_string());
        nodes.insert(node.to_string(), updated);

        let snapshot = TopologySnapshot {
            revision: current.revision + 1,
            rings,
            domain_nodes,
            domain_configs: current.domain_configs.clone(),
            nodes,
            active_domains: current.active_domains.clone(),
            standby_domain: current.standby_domain.clone(),
            replication_factor: current.replication_factor,
            write_quorum: current.write_quorum,
            min_healthy_nodes_per_domain: current.min_healthy_nodes_per_domain,
            virtual_nodes_per_unit: current.virtual_nodes_per_unit,
        };
        self.snapshot.store(Arc::new(snapshot));

        tracing::info!(
            "Node {} moved from fault domain {} to {}",
            node,
            old_domain.as_deref().unwrap_or("<none>"),
            new_domain
        );
        true
    }

    /// Ring-mapped node if online, otherwise the next online member in ring order.
    fn healthy_node_in_ring(&self, ring: &HashRing, chunk_key: &str, domain: &str) -> Option<String> {
        let primary = ring.get_node(chunk_key)?;
        if self.health.is_node_online(&primary) {
            return Some(primary);
        }

        let fallback = ring
            .get_nodes(chunk_key, ring.len())
            .into_iter()
            .find(|node| self.health.is_node_online(node));

        if let Some(fallback) = fallback.as_deref() {
            tracing::debug!(
                "Fault domain {} target {} is offline, falling back to {}",
                domain,
                primary,
                fallback
            );
        }
        fallback
    }
}
