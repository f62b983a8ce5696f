//! Shared doubles for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use object_store::ObjectStore;
use object_store::memory::InMemory;
use parking_lot::RwLock;
use shardline_core::{
    ClientFactory, FaultDomainConfig, NodeConfig, NodeHealth, Result, ShardlineError,
    StorageClient, TopologyConfig,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Nodes listed here fail their probe.
#[derive(Default)]
pub struct Network {
    down: RwLock<HashSet<String>>,
}

impl Network {
    pub fn set_down(&self, node: &str, down: bool) {
        let mut set = self.down.write();
        if down {
            set.insert(node.to_string());
        } else {
            set.remove(node);
        }
    }

    pub fn is_down(&self, node: &str) -> bool {
        self.down.read().contains(node)
    }
}

pub struct MockClient {
    name: String,
    endpoint: String,
    store: Arc<dyn ObjectStore>,
    network: Arc<Network>,
    closed: AtomicBool,
    pub close_calls: AtomicUsize,
}

impl MockClient {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl StorageClient for MockClient {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    async fn probe(&self) -> Result<()> {
        if self.network.is_down(&self.name) {
            return Err(ShardlineError::Probe {
                node: self.name.clone(),
                reason: "connection refused".to_string(),
            });
        }
        self.store.list_with_delimiter(None).await?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockFactory {
    pub network: Arc<Network>,
    pub built: AtomicUsize,
}

impl MockFactory {
    pub fn new(network: Arc<Network>) -> Self {
        Self {
            network,
            built: AtomicUsize::new(0),
        }
    }
}

impl ClientFactory for MockFactory {
    fn build(&self, node: &NodeConfig) -> Result<Arc<dyn StorageClient>> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockClient {
            name: node.name.clone(),
            endpoint: node.endpoint.clone(),
            store: Arc::new(InMemory::new()),
            network: self.network.clone(),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        }))
    }
}

/// Every node is online with the same score.
pub struct AllOnline;

impl NodeHealth for AllOnline {
    fn is_node_online(&self, _node: &str) -> bool {
        true
    }

    fn node_load_score(&self, _node: &str) -> f64 {
        0.5
    }
}

pub fn node(name: &str, domain: &str) -> NodeConfig {
    NodeConfig::new(name, format!("http://{}:9000", name)).with_domain(domain)
}

/// Three active domains of `per_domain` nodes each, plus two standby nodes.
pub fn topology(per_domain: usize) -> TopologyConfig {
    let mut nodes = Vec::new();
    for domain in ["d1", "d2", "d3"] {
        for i in 0..per_domain {
            nodes.push(node(&format!("{}-n{}", domain, i), domain));
        }
    }
    nodes.push(node("standby-1", "standby"));
    nodes.push(node("standby-2", "standby"));

    TopologyConfig {
        nodes,
        domains: vec![
            FaultDomainConfig::new("d1"),
            FaultDomainConfig::new("d2"),
            FaultDomainConfig::new("d3"),
            FaultDomainConfig::new("standby").read_only(),
        ],
        active_domains: vec!["d1".into(), "d2".into(), "d3".into()],
        replication_factor: Some(3),
        standby_domain: Some("standby".into()),
        virtual_nodes_per_weight_unit: 50,
        ..TopologyConfig::default()
    }
}
