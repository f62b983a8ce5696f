use crate::health::NodeHealth;
use crate::placement::PlacementManager;
use crate::registry::{ClientRegistry, StorageClient};
use crate::{Result, ShardlineError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct LocateChunkOperation {
    placement: Arc<PlacementManager>,
    registry: Arc<ClientRegistry>,
    health: Arc<dyn NodeHealth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkAccess {
    Write,
    Read,
}

#[derive(Debug, Clone)]
pub struct LocateChunkOperationRequest {
    pub chunk_key: String,
    pub access: ChunkAccess,
}

#[derive(Clone)]
pub struct NodeHandle {
    pub node: String,
    pub client: Arc<dyn StorageClient>,
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle").field("node", &self.node).finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocateChunkOperationResult {
    /// Write: one handle per target replica. Read: the single node to read from.
    pub nodes: Vec<NodeHandle>,
    /// Placed nodes that have no registered client.
    pub missing_clients: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum LocateChunkOperationOutcome {
    Found(LocateChunkOperationResult),
    Unavailable,
}

impl LocateChunkOperation {
    pub fn new(
        placement: Arc<PlacementManager>,
        registry: Arc<ClientRegistry>,
        health: Arc<dyn NodeHealth>,
    ) -> Self {
        Self {
            placement,
            registry,
            health,
        }
    }

    pub fn run(&self, request: LocateChunkOperationRequest) -> Result<LocateChunkOperationOutcome> {
        let LocateChunkOperationRequest { chunk_key, access } = request;
        if chunk_key.trim().is_empty() {
            return Err(ShardlineError::InvalidRequest(
                "chunk key cannot be empty".to_string(),
            ));
        }

        let result = match access {
            ChunkAccess::Write => self.locate_for_write(&chunk_key),
            ChunkAccess::Read => self.locate_for_read(&chunk_key),
        };

        if result.nodes.is_empty() {
            tracing::warn!("No reachable node for chunk {} ({:?})", chunk_key, access);
            return Ok(LocateChunkOperationOutcome::Unavailable);
        }

        Ok(LocateChunkOperationOutcome::Found(result))
    }

    fn locate_for_write(&self, chunk_key: &str) -> LocateChunkOperationResult {
        let mut nodes = Vec::new();
        let mut missing_clients = Vec::new();

        for node in self.placement.target_nodes(chunk_key) {
            match self.registry.client(&node) {
                Some(client) => nodes.push(NodeHandle { node, client }),
                None => missing_clients.push(node),
            }
        }

        LocateChunkOperationResult {
            nodes,
            missing_clients,
        }
    }

    fn locate_for_read(&self, chunk_key: &str) -> LocateChunkOperationResult {
        let candidates = self.placement.candidate_nodes(chunk_key);
        let mut missing_clients = Vec::new();

        let Some(best) = self.placement.select_best_node_for_read(&candidates) else {
            return LocateChunkOperationResult {
                nodes: Vec::new(),
                missing_clients,
            };
        };

        // Remaining online candidates by score, for when the best node has no client.
        let mut fallbacks: Vec<(f64, String)> = candidates
            .into_iter()
            .filter(|node| *node != best && self.health.is_node_online(node))
            .map(|node| (self.health.node_load_score(&node), node))
            .collect();
        fallbacks.sort_by(|a, b| a.0.total_cmp(&b.0));

        let order = std::iter::once(best).chain(fallbacks.into_iter().map(|(_, node)| node));
        for node in order {
            match self.registry.client(&node) {
                Some(client) => {
                    return LocateChunkOperationResult {
                        nodes: vec![NodeHandle { node, client }],
                        missing_clients,
                    };
                }
                None => missing_clients.push(node),
            }
        }

        LocateChunkOperationResult {
            nodes: Vec::new(),
            missing_clients,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientFactory;
    use crate::source::{ConfigSource, MemoryConfigSource};
    use crate::{NodeConfig, TopologyConfig};
    use async_trait::async_trait;
    use object_store::ObjectStore;
    use object_store::memory::InMemory;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    struct ScoreHealth(RwLock<HashMap<String, f64>>);

    impl NodeHealth for ScoreHealth {
        fn is_node_online(&self, node: &str) -> bool {
            self.0.read().contains_key(node)
        }

        fn node_load_score(&self, node: &str) -> f64 {
            self.0.read().get(node).copied().unwrap_or(f64::INFINITY)
        }
    }

    struct StubClient(String);

    #[async_trait]
    impl StorageClient for StubClient {
        fn node_name(&self) -> &str {
            &self.0
        }

        fn store(&self) -> Arc<dyn ObjectStore> {
            Arc::new(InMemory::new())
        }

        async fn probe(&self) -> Result<()> {
            Ok(())
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    /// Refuses to build clients for nodes whose endpoint says so.
    struct StubFactory;

    impl ClientFactory for StubFactory {
        fn build(&self, node: &NodeConfig) -> Result<Arc<dyn StorageClient>> {
            if node.endpoint.contains("noclient") {
                return Err(ShardlineError::ClientBuild {
                    node: node.name.clone(),
                    reason: "refused".to_string(),
                });
            }
            Ok(Arc::new(StubClient(node.name.clone())))
        }
    }

    async fn setup(scores: &[(&str, f64)], without_client: &[&str]) -> LocateChunkOperation {
        let nodes = ["a1", "b1", "c1"]
            .iter()
            .zip(["d1", "d2", "d3"])
            .map(|(name, domain)| {
                let endpoint = if without_client.contains(name) {
                    format!("http://{}-noclient:9000", name)
                } else {
                    format!("http://{}:9000", name)
                };
                NodeConfig::new(*name, endpoint).with_domain(domain)
            })
            .collect();
        let topology = TopologyConfig {
            nodes,
            active_domains: vec!["d1".into(), "d2".into(), "d3".into()],
            ..TopologyConfig::default()
        };

        let source: Arc<dyn ConfigSource> = Arc::new(MemoryConfigSource::new(topology));
        let health: Arc<dyn NodeHealth> = Arc::new(ScoreHealth(RwLock::new(
            scores
                .iter()
                .map(|(node, score)| (node.to_string(), *score))
                .collect(),
        )));
        let placement = Arc::new(PlacementManager::new(source.clone(), health.clone()));
        let registry = Arc::new(ClientRegistry::new(source, Arc::new(StubFactory)));
        registry.reload().await;

        LocateChunkOperation::new(placement, registry, health)
    }

    fn request(access: ChunkAccess) -> LocateChunkOperationRequest {
        LocateChunkOperationRequest {
            chunk_key: "chunk-42".to_string(),
            access,
        }
    }

    fn found(outcome: LocateChunkOperationOutcome) -> LocateChunkOperationResult {
        match outcome {
            LocateChunkOperationOutcome::Found(result) => result,
            LocateChunkOperationOutcome::Unavailable => panic!("chunk unavailable"),
        }
    }

    #[tokio::test]
    async fn test_write_returns_one_handle_per_domain() {
        let operation = setup(&[("a1", 0.5), ("b1", 0.5), ("c1", 0.5)], &[]).await;
        let result = found(operation.run(request(ChunkAccess::Write)).unwrap());

        let nodes: Vec<&str> = result.nodes.iter().map(|h| h.node.as_str()).collect();
        assert_eq!(nodes, vec!["a1", "b1", "c1"]);
        assert!(result.missing_clients.is_empty());
        assert_eq!(result.nodes[1].client.node_name(), "b1");
    }

    #[tokio::test]
    async fn test_write_reports_missing_clients() {
        let operation = setup(&[("a1", 0.5), ("b1", 0.5), ("c1", 0.5)], &["b1"]).await;
        let result = found(operation.run(request(ChunkAccess::Write)).unwrap());

        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.missing_clients, vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn test_read_picks_least_loaded() {
        let operation = setup(&[("a1", 0.9), ("b1", 0.1), ("c1", 0.4)], &[]).await;
        let result = found(operation.run(request(ChunkAccess::Read)).unwrap());
        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.nodes[0].node, "b1");
    }

    #[tokio::test]
    async fn test_read_falls_back_when_best_has_no_client() {
        let operation = setup(&[("a1", 0.9), ("b1", 0.1), ("c1", 0.4)], &["b1"]).await;
        let result = found(operation.run(request(ChunkAccess::Read)).unwrap());
        assert_eq!(result.nodes[0].node, "c1");
        assert_eq!(result.missing_clients, vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn test_unavailable_when_everything_is_down() {
        let operation = setup(&[], &[]).await;
        assert!(matches!(
            operation.run(request(ChunkAccess::Read)).unwrap(),
            LocateChunkOperationOutcome::Unavailable
        ));
        assert!(matches!(
            operation.run(request(ChunkAccess::Write)).unwrap(),
            LocateChunkOperationOutcome::Unavailable
        ));
    }

    #[tokio::test]
    async fn test_rejects_blank_key() {
        let operation = setup(&[], &[]).await;
        let request = LocateChunkOperationRequest {
            chunk_key: "  ".to_string(),
            access: ChunkAccess::Read,
        };
        assert!(matches!(
            operation.run(request),
            Err(ShardlineError::InvalidRequest(_))
        ));
    }
}
