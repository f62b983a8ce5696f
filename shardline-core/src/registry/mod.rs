//! Per-node storage clients.

mod factory;
mod s3;

pub use factory::{ClientFactory, S3ClientFactory, S3ClientFactoryBuilder};
pub use s3::S3StorageClient;

use crate::source::ConfigSource;
use crate::{NodeConfig, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures_util::future::join_all;
use object_store::ObjectStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A long-lived connection to one storage node, shared by every caller.
#[async_trait]
pub trait StorageClient: Send + Sync {
    fn node_name(&self) -> &str;

    fn store(&self) -> Arc<dyn ObjectStore>;

    /// Cheap liveness check against the node.
    async fn probe(&self) -> Result<()>;

    /// Marks the client retired. Operations already holding the store finish
    /// normally.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

struct RegistryEntry {
    config: NodeConfig,
    client: Arc<dyn StorageClient>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub node: String,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn is_online(&self) -> bool {
        self.error.is_none()
    }
}

/// What a reload did, node by node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub reused: Vec<String>,
    pub created: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    pub probes: Vec<ProbeOutcome>,
}

impl ReloadReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

pub struct ClientRegistry {
    source: Arc<dyn ConfigSource>,
    factory: Arc<dyn ClientFactory>,
    entries: ArcSwap<HashMap<String, Arc<RegistryEntry>>>,
    reload_lock: Mutex<()>,
    probe_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(source: Arc<dyn ConfigSource>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            source,
            factory,
            entries: ArcSwap::from_pointee(HashMap::new()),
            reload_lock: Mutex::new(()),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Brings the registry in line with the source's node list.
    ///
    /// Unchanged nodes keep their exact client. New and changed nodes get a
    /// fresh client; replaced and removed clients are closed once the new
    /// registry is published.
    pub async fn reload(&self) -> ReloadReport {
        let _guard = self.reload_lock.lock().await;
        let topology = self.source.current_topology();
        let previous = self.entries.load_full();

        let mut report = ReloadReport::default();
        let mut next: HashMap<String, Arc<RegistryEntry>> = HashMap::new();
        let mut created = Vec::new();

        for node in topology.unique_nodes() {
            if !node.enabled {
                tracing::debug!("Node {} is disabled, not registering a client", node.name);
                continue;
            }

            if let Some(entry) = previous.get(&node.name) {
                if entry.config == *node {
                    next.insert(node.name.clone(), entry.clone());
                    report.reused.push(node.name.clone());
                    continue;
                }
                tracing::info!("Configuration of node {} changed, rebuilding its client", node.name);
            }

            match self.factory.build(node) {
                Ok(client) => {
                    tracing::info!("Created storage client for node {} ({})", node.name, node.endpoint);
                    created.push(client.clone());
                    next.insert(
                        node.name.clone(),
                        Arc::new(RegistryEntry {
                            config: node.clone(),
                            client,
                        }),
                    );
                    report.created.push(node.name.clone());
                }
                Err(err) => {
                    tracing::error!("Failed to create storage client for node {}: {}", node.name, err);
                    report.failed.push(node.name.clone());
                }
            }
        }

        let mut retired = Vec::new();
        for (name, entry) in previous.iter() {
            match next.get(name) {
                Some(current) if Arc::ptr_eq(current, entry) => {}
                Some(_) => retired.push(entry.client.clone()),
                None => {
                    retired.push(entry.client.clone());
                    if !report.failed.contains(name) {
                        tracing::info!("Node {} removed from configuration", name);
                        report.removed.push(name.clone());
                    }
                }
            }
        }

        self.entries.store(Arc::new(next));

        for client in retired {
            close_client(client.as_ref());
        }

        report.probes = join_all(created.iter().map(|client| self.probe(client.as_ref()))).await;

        tracing::info!(
            "Storage clients reloaded: {} reused, {} created, {} removed, {} failed",
            report.reused.len(),
            report.created.len(),
            report.removed.len(),
            report.failed.len()
        );
        report
    }

    async fn probe(&self, client: &dyn StorageClient) -> ProbeOutcome {
        let node = client.node_name().to_string();
        let error = match tokio::time::timeout(self.probe_timeout, client.probe()).await {
            Ok(Ok(())) => {
                tracing::info!("Connectivity check for node {} succeeded", node);
                None
            }
            Ok(Err(err)) => {
                tracing::warn!("Connectivity check for node {} failed: {}", node, err);
                Some(err.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    "Connectivity check for node {} timed out after {:?}",
                    node,
                    self.probe_timeout
                );
                Some(format!("probe timed out after {:?}", self.probe_timeout))
            }
        };

        ProbeOutcome { node, error }
    }

    pub fn client(&self, node: &str) -> Option<Arc<dyn StorageClient>> {
        let client = self.entries.load().get(node).map(|entry| entry.client.clone());
        if client.is_none() {
            tracing::warn!("No storage client registered for node {}", node);
        }
        client
    }

    pub fn node_config(&self, node: &str) -> Option<NodeConfig> {
        let config = self.entries.load().get(node).map(|entry| entry.config.clone());
        if config.is_none() {
            tracing::warn!("No configuration registered for node {}", node);
        }
        config
    }

    /// Whether `client` is still the instance registered for `node`.
    pub fn is_current(&self, node: &str, client: &Arc<dyn StorageClient>) -> bool {
        self.entries
            .load()
            .get(node)
            .is_some_and(|entry| Arc::ptr_eq(&entry.client, client))
    }

    pub fn contains(&self, node: &str) -> bool {
        self.entries.load().contains_key(node)
    }

    pub fn clients(&self) -> HashMap<String, Arc<dyn StorageClient>> {
        self.entries
            .load()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.client.clone()))
            .collect()
    }

    pub fn node_configs(&self) -> Vec<NodeConfig> {
        let mut configs: Vec<NodeConfig> = self
            .entries
            .load()
            .values()
            .map(|entry| entry.config.clone())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Closes and drops every client.
    pub async fn cleanup(&self) {
        let _guard = self.reload_lock.lock().await;
        let previous = self.entries.swap(Arc::new(HashMap::new()));
        for entry in previous.values() {
            close_client(entry.client.as_ref());
        }
        tracing::info!("Closed {} storage clients", previous.len());
    }
}

fn close_client(client: &dyn StorageClient) {
    match client.close() {
        Ok(()) => tracing::debug!("Closed storage client for node {}", client.node_name()),
        Err(err) => tracing::warn!(
            "Failed to close storage client for node {}: {}",
            client.node_name(),
            err
        ),
    }
}
