//! Wires the configuration source, registry, health monitor and placement
//! manager together and keeps them in step with topology changes.

use crate::events::EventBus;
use crate::health::{HealthMonitor, HealthMonitorConfig, LoadScorer, NodeHealth};
use crate::operations::{
    LocateChunkOperation, PromoteStandbyOperation, PromoteStandbyOperationOutcome,
    PromoteStandbyOperationRequest,
};
use crate::placement::PlacementManager;
use crate::registry::{ClientFactory, ClientRegistry, ReloadReport};
use crate::source::ConfigSource;
use crate::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};

pub struct PlacementRuntime {
    source: Arc<dyn ConfigSource>,
    placement: Arc<PlacementManager>,
    registry: Arc<ClientRegistry>,
    health: Arc<HealthMonitor>,
    events: EventBus,
    applied_revision: AtomicU64,
    apply_lock: Mutex<()>,
}

impl PlacementRuntime {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        factory: Arc<dyn ClientFactory>,
        health_config: HealthMonitorConfig,
        scorer: Option<Arc<dyn LoadScorer>>,
    ) -> Result<Self> {
        let events = EventBus::new();
        let registry = Arc::new(
            ClientRegistry::new(source.clone(), factory)
                .with_probe_timeout(health_config.probe_timeout),
        );

        let mut monitor = HealthMonitor::new(registry.clone(), events.clone(), health_config)?;
        if let Some(scorer) = scorer {
            monitor = monitor.with_scorer(scorer);
        }
        let health = Arc::new(monitor);

        let node_health: Arc<dyn NodeHealth> = health.clone();
        let placement = Arc::new(PlacementManager::new(source.clone(), node_health));

        Ok(Self {
            source,
            placement,
            registry,
            health,
            events,
            applied_revision: AtomicU64::new(0),
            apply_lock: Mutex::new(()),
        })
    }

    pub fn placement(&self) -> &Arc<PlacementManager> {
        &self.placement
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn source(&self) -> &Arc<dyn ConfigSource> {
        &self.source
    }

    /// Initial load. Same sequence as any later configuration change.
    pub async fn start(&self) -> ReloadReport {
        tracing::info!("Starting placement runtime");
        self.apply_config_change().await
    }

    /// Reloads clients, classifies new nodes, then rebuilds the rings, so
    /// placement never names a node the registry has not seen yet. Concurrent
    /// calls run one after another.
    pub async fn apply_config_change(&self) -> ReloadReport {
        let _guard = self.apply_lock.lock().await;
        let revision = *self.source.subscribe().borrow();
        self.applied_revision.store(revision, Ordering::SeqCst);

        let report = self.registry.reload().await;
        self.health.observe_reload(&report);
        self.placement.rebuild_rings();
        report
    }

    /// Applies every change published by the source until shutdown.
    pub async fn watch_config(&self, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.source.subscribe();
        let current = *changes.borrow_and_update();
        if current != self.applied_revision.load(Ordering::SeqCst) {
            tracing::info!("Topology revision {} not applied yet, reloading", current);
            self.apply_config_change().await;
        }

        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Configuration source closed, no longer watching for changes");
                        break;
                    }
                    let revision = *changes.borrow_and_update();
                    tracing::info!("Topology revision {} received, reloading", revision);
                    self.apply_config_change().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Health loop with a standby promotion pass after every probe round.
    pub async fn run_health(&self, shutdown: watch::Receiver<bool>) {
        self.health
            .run_with(shutdown, || {
                self.promote_standby();
                async {}
            })
            .await;
    }

    pub fn promote_standby(&self) -> Option<PromoteStandbyOperationOutcome> {
        let operation = PromoteStandbyOperation::new(self.placement.clone(), self.events.clone());
        match operation.run(PromoteStandbyOperationRequest::default()) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::error!("Standby promotion failed: {}", err);
                None
            }
        }
    }

    pub fn locate_chunk(&self) -> LocateChunkOperation {
        let health: Arc<dyn NodeHealth> = self.health.clone();
        LocateChunkOperation::new(self.placement.clone(), self.registry.clone(), health)
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down placement runtime");
        self.registry.cleanup().await;
    }
}
