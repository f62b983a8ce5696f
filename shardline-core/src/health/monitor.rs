use super::load::{LoadScorer, MetricsLoadScorer, MetricsParser, NodeMetrics};
use super::NodeHealth;
use crate::events::{EventBus, TopologyEvent, TopologyEventKind};
use crate::registry::{ClientRegistry, ReloadReport, StorageClient};
use crate::{NodeConfig, Result};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub initial_delay: Duration,
    pub probe_timeout: Duration,
    pub metrics_timeout: Duration,
    pub metrics_ttl: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            metrics_timeout: Duration::from_secs(5),
            metrics_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node: String,
    pub online: bool,
    /// Absent while offline.
    pub load_score: Option<f64>,
    pub last_error: Option<String>,
    pub metrics: Option<NodeMetrics>,
}

#[derive(Debug, Default)]
struct HealthState {
    online: HashSet<String>,
    last_error: HashMap<String, String>,
    metrics: HashMap<String, NodeMetrics>,
}

pub struct HealthMonitor {
    registry: Arc<ClientRegistry>,
    events: EventBus,
    scorer: Arc<dyn LoadScorer>,
    parser: MetricsParser,
    http: reqwest::Client,
    config: HealthMonitorConfig,
    state: RwLock<HealthState>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ClientRegistry>,
        events: EventBus,
        config: HealthMonitorConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.metrics_timeout)
            .build()?;

        Ok(Self {
            registry,
            events,
            scorer: Arc::new(MetricsLoadScorer::new(config.metrics_ttl)),
            parser: MetricsParser::new()?,
            http,
            config,
            state: RwLock::new(HealthState::default()),
        })
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn LoadScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Probes every registered node once, then refreshes load metrics of the
    /// nodes that are online.
    pub async fn check_all(&self) {
        let clients = self.registry.clients();
        let configs: HashMap<String, NodeConfig> = self
            .registry
            .node_configs()
            .into_iter()
            .map(|config| (config.name.clone(), config))
            .collect();

        if clients.is_empty() {
            self.mark_all_offline();
            return;
        }

        let probes = join_all(clients.values().map(|client| async move {
            let (node, error) = self.probe(client.as_ref()).await;
            (node, error, client)
        }))
        .await;

        // A reload may have replaced or removed clients while the probes ran.
        for (node, error, client) in probes {
            if !self.registry.is_current(&node, client) {
                tracing::debug!("Discarding health result for replaced client of node {}", node);
                continue;
            }
            self.record_probe(&node, error, configs.get(&node));
        }

        let current = self.registry.clients();
        self.prune(|node| current.contains_key(node));
        self.refresh_metrics(&configs).await;
    }

    /// Runs [`check_all`](Self::check_all) on a fixed schedule until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.run_with(shutdown, || async {}).await;
    }

    /// Like [`run`](Self::run), calling `after_pass` once each pass completes.
    pub async fn run_with<F, Fut>(&self, mut shutdown: watch::Receiver<bool>, mut after_pass: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let start = tokio::time::Instant::now() + self.config.initial_delay;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Health monitor started (interval {:?}, initial delay {:?})",
            self.config.interval,
            self.config.initial_delay
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                    after_pass().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Health monitor stopped");
    }

    /// Applies the connectivity checks of a registry reload right away, so
    /// new nodes do not wait a full interval to be classified.
    pub fn observe_reload(&self, report: &ReloadReport) {
        let configs: HashMap<String, NodeConfig> = self
            .registry
            .node_configs()
            .into_iter()
            .map(|config| (config.name.clone(), config))
            .collect();

        for probe in &report.probes {
            self.record_probe(&probe.node, probe.error.clone(), configs.get(&probe.node));
        }

        let gone: HashSet<&str> = report
            .removed
            .iter()
            .chain(report.failed.iter())
            .map(String::as_str)
            .collect();
        if !gone.is_empty() {
            self.prune(|node| !gone.contains(node));
        }
    }

    pub fn is_node_online(&self, node: &str) -> bool {
        self.state.read().online.contains(node)
    }

    /// Online nodes, sorted.
    pub fn online_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.state.read().online.iter().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn node_load_score(&self, node: &str) -> f64 {
        let state = self.state.read();
        if !state.online.contains(node) {
            return f64::INFINITY;
        }
        self.scorer.score(state.metrics.get(node))
    }

    pub fn node_metrics(&self, node: &str) -> Option<NodeMetrics> {
        self.state.read().metrics.get(node).cloned()
    }

    pub fn node_status(&self, node: &str) -> NodeStatus {
        let state = self.state.read();
        let online = state.online.contains(node);
        let metrics = state.metrics.get(node);

        NodeStatus {
            node: node.to_string(),
            online,
            load_score: online.then(|| self.scorer.score(metrics)),
            last_error: state.last_error.get(node).cloned(),
            metrics: metrics.cloned(),
        }
    }

    async fn probe(&self, client: &dyn StorageClient) -> (String, Option<String>) {
        let node = client.node_name().to_string();
        let error = match tokio::time::timeout(self.config.probe_timeout, client.probe()).await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!("probe timed out after {:?}", self.config.probe_timeout)),
        };
        (node, error)
    }

    fn record_probe(&self, node: &str, error: Option<String>, config: Option<&NodeConfig>) {
        let kind = {
            let mut state = self.state.write();
            match error {
                None => {
                    state.last_error.remove(node);
                    if !state.online.insert(node.to_string()) {
                        return;
                    }
                    tracing::info!("Node {} is online", node);
                    TopologyEventKind::NodeOnline
                }
                Some(reason) => {
                    let was_online = state.online.remove(node);
                    state.metrics.remove(node);
                    let first_failure = state
                        .last_error
                        .insert(node.to_string(), reason.clone())
                        .is_none();

                    if was_online || first_failure {
                        tracing::warn!("Node {} is offline: {}", node, reason);
                    }
                    if !was_online {
                        return;
                    }
                    TopologyEventKind::NodeOffline
                }
            }
        };

        let domain = config.and_then(|config| config.domain()).map(str::to_string);
        self.events.publish(TopologyEvent::new(node, kind, domain));
    }

    fn prune(&self, keep: impl Fn(&str) -> bool) {
        let mut state = self.state.write();
        let before = state.online.len();
        state.online.retain(|node| keep(node));
        state.last_error.retain(|node, _| keep(node));
        state.metrics.retain(|node, _| keep(node));

        let pruned = before - state.online.len();
        if pruned > 0 {
            tracing::info!("Pruned {} nodes no longer in configuration", pruned);
        }
    }

    fn mark_all_offline(&self) {
        let previous: Vec<String> = {
            let mut state = self.state.write();
            state.metrics.clear();
            state.last_error.clear();
            state.online.drain().collect()
        };

        if previous.is_empty() {
            tracing::debug!("No storage nodes configured, nothing to probe");
            return;
        }

        for node in previous {
            tracing::warn!("Node {} is offline: no longer configured", node);
            self.events.publish(TopologyEvent::new(
                node,
                TopologyEventKind::NodeOffline,
                None,
            ));
        }
    }

    async fn refresh_metrics(&self, configs: &HashMap<String, NodeConfig>) {
        let targets: Vec<(String, String)> = {
            let state = self.state.read();
            configs
                .values()
                .filter(|config| state.online.contains(&config.name))
                .filter_map(|config| Some((config.name.clone(), config.metrics_url()?)))
                .collect()
        };

        if targets.is_empty() {
            return;
        }

        let scraped = join_all(targets.iter().map(|(node, url)| async move {
            (node.as_str(), self.scrape(url).await)
        }))
        .await;

        let mut state = self.state.write();
        for (node, result) in scraped {
            match result {
                Ok(metrics) => {
                    if state.online.contains(node) {
                        state.metrics.insert(node.to_string(), metrics);
                    }
                }
                Err(err) => tracing::debug!("Failed to fetch metrics for node {}: {}", node, err),
            }
        }
    }

    async fn scrape(&self, url: &str) -> Result<NodeMetrics> {
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        self.parser.parse(&body)
    }
}

impl NodeHealth for HealthMonitor {
    fn is_node_online(&self, node: &str) -> bool {
        HealthMonitor::is_node_online(self, node)
    }

    fn node_load_score(&self, node: &str) -> f64 {
        HealthMonitor::node_load_score(self, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ConstantLoadScorer;
    use crate::registry::ClientFactory;
    use crate::source::MemoryConfigSource;
    use crate::{ShardlineError, TopologyConfig};
    use async_trait::async_trait;
    use object_store::ObjectStore;
    use object_store::memory::InMemory;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    /// Reachability is keyed by node name and can be flipped by tests.
    #[derive(Default)]
    struct Network {
        down: RwLock<HashSet<String>>,
        hang: RwLock<HashSet<String>>,
    }

    struct FakeClient {
        name: String,
        network: Arc<Network>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl StorageClient for FakeClient {
        fn node_name(&self) -> &str {
            &self.name
        }

        fn store(&self) -> Arc<dyn ObjectStore> {
            Arc::new(InMemory::new())
        }

        async fn probe(&self) -> Result<()> {
            if self.network.hang.read().contains(&self.name) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.network.down.read().contains(&self.name) {
                return Err(ShardlineError::Probe {
                    node: self.name.clone(),
                    reason: "unreachable".to_string(),
                });
            }
            Ok(())
        }

        fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct FakeFactory(Arc<Network>);

    impl ClientFactory for FakeFactory {
        fn build(&self, node: &NodeConfig) -> Result<Arc<dyn StorageClient>> {
            Ok(Arc::new(FakeClient {
                name: node.name.clone(),
                network: self.0.clone(),
                closed: AtomicBool::new(false),
            }))
        }
    }

    struct Fixture {
        source: Arc<MemoryConfigSource>,
        network: Arc<Network>,
        registry: Arc<ClientRegistry>,
        events: EventBus,
        monitor: HealthMonitor,
    }

    fn topology(names: &[&str]) -> TopologyConfig {
        TopologyConfig {
            nodes: names
                .iter()
                .map(|name| NodeConfig::new(*name, format!("http://{}:9000", name)).with_domain("d1"))
                .collect(),
            active_domains: vec!["d1".into()],
            ..TopologyConfig::default()
        }
    }

    fn fixture(names: &[&str]) -> Fixture {
        let source = Arc::new(MemoryConfigSource::new(topology(names)));
        let network = Arc::new(Network::default());
        let registry = Arc::new(
            ClientRegistry::new(source.clone(), Arc::new(FakeFactory(network.clone())))
                .with_probe_timeout(Duration::from_millis(100)),
        );
        let events = EventBus::new();
        let config = HealthMonitorConfig {
            probe_timeout: Duration::from_millis(100),
            ..HealthMonitorConfig::default()
        };
        let monitor = HealthMonitor::new(registry.clone(), events.clone(), config).unwrap();

        Fixture {
            source,
            network,
            registry,
            events,
            monitor,
        }
    }

    #[tokio::test]
    async fn test_check_all_tracks_transitions() {
        let fx = fixture(&["n1", "n2"]);
        fx.registry.reload().await;
        let mut events = fx.events.subscribe();

        fx.monitor.check_all().await;
        assert_eq!(fx.monitor.online_nodes(), vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(events.recv().await.unwrap().kind, TopologyEventKind::NodeOnline);
        assert_eq!(events.recv().await.unwrap().kind, TopologyEventKind::NodeOnline);

        fx.network.down.write().insert("n2".to_string());
        fx.monitor.check_all().await;
        assert!(fx.monitor.is_node_online("n1"));
        assert!(!fx.monitor.is_node_online("n2"));
        assert_eq!(fx.monitor.node_load_score("n2"), f64::INFINITY);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, TopologyEventKind::NodeOffline);
        assert_eq!(event.node, "n2");
        assert_eq!(event.fault_domain.as_deref(), Some("d1"));

        // Repeated failures are not new transitions.
        fx.monitor.check_all().await;
        assert!(events.try_recv().is_err());
        assert!(fx.monitor.node_status("n2").last_error.is_some());
    }

    #[tokio::test]
    async fn test_slow_probe_times_out_without_blocking_others() {
        let fx = fixture(&["fast", "slow"]);
        fx.registry.reload().await;
        fx.network.hang.write().insert("slow".to_string());

        let started = Instant::now();
        fx.monitor.check_all().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(fx.monitor.is_node_online("fast"));
        assert!(!fx.monitor.is_node_online("slow"));
    }

    #[tokio::test]
    async fn test_removed_nodes_are_pruned() {
        let fx = fixture(&["n1", "n2"]);
        fx.registry.reload().await;
        fx.monitor.check_all().await;

        fx.source.update(topology(&["n1"]));
        let report = fx.registry.reload().await;
        fx.monitor.observe_reload(&report);
        assert_eq!(fx.monitor.online_nodes(), vec!["n1".to_string()]);

        fx.source.update(TopologyConfig::default());
        fx.registry.reload().await;
        let mut events = fx.events.subscribe();
        fx.monitor.check_all().await;
        assert!(fx.monitor.online_nodes().is_empty());
        assert_eq!(events.recv().await.unwrap().kind, TopologyEventKind::NodeOffline);
    }

    #[tokio::test]
    async fn test_reload_during_check_all_keeps_new_nodes() {
        let fx = fixture(&["n1", "slow"]);
        fx.registry.reload().await;
        fx.network.hang.write().insert("slow".to_string());

        tokio::join!(fx.monitor.check_all(), async {
            tokio::task::yield_now().await;
            fx.source.update(topology(&["n1", "slow", "n2"]));
            let report = fx.registry.reload().await;
            fx.monitor.observe_reload(&report);
            assert!(fx.monitor.is_node_online("n2"));
        });

        assert!(fx.monitor.is_node_online("n1"));
        assert!(fx.monitor.is_node_online("n2"));
        assert!(!fx.monitor.is_node_online("slow"));
    }

    #[tokio::test]
    async fn test_result_of_replaced_client_is_discarded() {
        let fx = fixture(&["n1", "n2"]);
        fx.registry.reload().await;
        fx.network.hang.write().insert("n2".to_string());
        let stale = fx.registry.client("n2").unwrap();

        tokio::join!(fx.monitor.check_all(), async {
            tokio::task::yield_now().await;
            fx.network.hang.write().remove("n2");
            let mut moved = topology(&["n1", "n2"]);
            moved.nodes[1].endpoint = "http://n2-new:9000".to_string();
            fx.source.update(moved);
            let report = fx.registry.reload().await;
            fx.monitor.observe_reload(&report);
        });

        assert!(stale.is_closed());
        assert!(fx.monitor.is_node_online("n2"));
        assert!(fx.monitor.node_status("n2").last_error.is_none());
    }

    #[tokio::test]
    async fn test_observe_reload_classifies_new_nodes() {
        let fx = fixture(&["up", "dead"]);
        fx.network.down.write().insert("dead".to_string());

        let report = fx.registry.reload().await;
        fx.monitor.observe_reload(&report);

        assert!(fx.monitor.is_node_online("up"));
        assert!(!fx.monitor.is_node_online("dead"));
    }

    #[tokio::test]
    async fn test_load_score_uses_scorer() {
        let fx = fixture(&["n1"]);
        fx.registry.reload().await;
        fx.monitor.check_all().await;
        assert_eq!(fx.monitor.node_load_score("n1"), crate::health::DEFAULT_LOAD_SCORE);

        fx.monitor.state.write().metrics.insert(
            "n1".to_string(),
            NodeMetrics {
                disk_usage_percent: Some(0.0),
                inflight_requests: 0,
                waiting_requests: 0,
                fetched_at: Instant::now(),
            },
        );
        assert_eq!(fx.monitor.node_load_score("n1"), 0.0);
        assert!(fx.monitor.node_metrics("n1").is_some());

        let monitor = fixture(&["n1"]).monitor.with_scorer(Arc::new(ConstantLoadScorer(0.7)));
        monitor.state.write().online.insert("n1".to_string());
        assert_eq!(monitor.node_load_score("n1"), 0.7);
        assert_eq!(monitor.node_status("n1").load_score, Some(0.7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let fx = fixture(&["n1"]);
        fx.registry.reload().await;
        let monitor = Arc::new(fx.monitor);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let passes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let task = {
            let monitor = monitor.clone();
            let passes = passes.clone();
            tokio::spawn(async move {
                monitor
                    .run_with(shutdown_rx, || {
                        passes.fetch_add(1, Ordering::SeqCst);
                        async {}
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(monitor.is_node_online("n1"));
        assert_eq!(passes.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
