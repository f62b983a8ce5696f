use crate::events::{EventBus, TopologyEvent, TopologyEventKind};
use crate::placement::PlacementManager;
use crate::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Clone)]
pub struct PromoteStandbyOperation {
    placement: Arc<PlacementManager>,
    events: EventBus,
}

#[derive(Debug, Clone, Default)]
pub struct PromoteStandbyOperationRequest {
    /// Restrict the pass to these domains; all active domains when empty.
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StandbyPromotion {
    pub node: String,
    pub domain: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PromoteStandbyOperationResult {
    pub promoted: Vec<StandbyPromotion>,
    pub failed: Vec<StandbyPromotion>,
    /// Domains still below their minimum, with the number of missing nodes.
    pub short: Vec<(String, usize)>,
}

#[derive(Debug, Clone)]
pub enum PromoteStandbyOperationOutcome {
    Completed(PromoteStandbyOperationResult),
    Skipped(&'static str),
}

impl PromoteStandbyOperation {
    pub fn new(placement: Arc<PlacementManager>, events: EventBus) -> Self {
        Self { placement, events }
    }

    pub fn run(
        &self,
        request: PromoteStandbyOperationRequest,
    ) -> Result<PromoteStandbyOperationOutcome> {
        if !self.placement.is_using_fault_domains() {
            return Ok(PromoteStandbyOperationOutcome::Skipped(
                "fault domains are not in use",
            ));
        }
        let Some(standby) = self.placement.standby_domain() else {
            return Ok(PromoteStandbyOperationOutcome::Skipped(
                "no standby domain configured",
            ));
        };

        let snapshot = self.placement.snapshot();
        let mut available: VecDeque<String> = self.placement.healthy_standby_nodes().into();
        let mut result = PromoteStandbyOperationResult::default();

        for domain in snapshot.active_domains() {
            if *domain == standby {
                continue;
            }
            if !request.domains.is_empty() && !request.domains.contains(domain) {
                continue;
            }

            let minimum = snapshot.min_healthy_nodes(domain);
            let healthy = self.placement.count_healthy_nodes_in_domain(domain);
            if healthy >= minimum {
                continue;
            }

            let mut deficit = minimum - healthy;
            tracing::warn!(
                "Fault domain {} has {} healthy nodes (minimum {}), promoting standby nodes",
                domain,
                healthy,
                minimum
            );

            while deficit > 0 {
                let Some(node) = available.pop_front() else {
                    break;
                };

                let promotion = StandbyPromotion {
                    node: node.clone(),
                    domain: domain.clone(),
                };
                if self.placement.change_node_domain(&node, domain) {
                    tracing::info!("Promoted standby node {} into fault domain {}", node, domain);
                    self.events.publish(TopologyEvent::new(
                        node,
                        TopologyEventKind::NodeDomainChanged,
                        Some(domain.clone()),
                    ));
                    result.promoted.push(promotion);
                    deficit -= 1;
                } else {
                    tracing::error!("Failed to promote standby node {} into {}", node, domain);
                    result.failed.push(promotion);
                }
            }

            if deficit > 0 {
                tracing::warn!(
                    "Fault domain {} is still {} healthy nodes short, no standby nodes left",
                    domain,
                    deficit
                );
                result.short.push((domain.clone(), deficit));
            }
        }

        Ok(PromoteStandbyOperationOutcome::Completed(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::NodeHealth;
    use crate::source::{ConfigSource, MemoryConfigSource};
    use crate::{FaultDomainConfig, NodeConfig, TopologyConfig};
    use parking_lot::RwLock;
    use std::collections::HashSet;

    struct SetHealth(RwLock<HashSet<String>>);

    impl NodeHealth for SetHealth {
        fn is_node_online(&self, node: &str) -> bool {
            self.0.read().contains(node)
        }

        fn node_load_score(&self, _node: &str) -> f64 {
            0.5
        }
    }

    fn node(name: &str, domain: &str) -> NodeConfig {
        NodeConfig::new(name, format!("http://{}:9000", name)).with_domain(domain)
    }

    fn setup(online: &[&str], standby: Option<&str>) -> (PromoteStandbyOperation, Arc<PlacementManager>, EventBus) {
        let topology = TopologyConfig {
            nodes: vec![
                node("a1", "d1"),
                node("b1", "d2"),
                node("s1", "standby"),
                node("s2", "standby"),
            ],
            domains: vec![FaultDomainConfig::new("standby").read_only()],
            active_domains: vec!["d1".into(), "d2".into()],
            standby_domain: standby.map(str::to_string),
            ..TopologyConfig::default()
        };
        let source: Arc<dyn ConfigSource> = Arc::new(MemoryConfigSource::new(topology));
        let health = Arc::new(SetHealth(RwLock::new(
            online.iter().map(|name| name.to_string()).collect(),
        )));
        let placement = Arc::new(PlacementManager::new(source, health));
        let events = EventBus::new();
        (
            PromoteStandbyOperation::new(placement.clone(), events.clone()),
            placement,
            events,
        )
    }

    fn completed(outcome: PromoteStandbyOperationOutcome) -> PromoteStandbyOperationResult {
        match outcome {
            PromoteStandbyOperationOutcome::Completed(result) => result,
            PromoteStandbyOperationOutcome::Skipped(reason) => panic!("skipped: {}", reason),
        }
    }

    #[test]
    fn test_promotes_into_domain_without_healthy_nodes() {
        let (operation, placement, events) = setup(&["a1", "s1", "s2"], Some("standby"));
        let mut receiver = events.subscribe();

        let result = completed(operation.run(Default::default()).unwrap());

        assert_eq!(
            result.promoted,
            vec![StandbyPromotion {
                node: "s1".to_string(),
                domain: "d2".to_string()
            }]
        );
        assert!(result.short.is_empty());
        assert_eq!(placement.node_domain("s1").as_deref(), Some("d2"));
        assert_eq!(placement.count_healthy_nodes_in_domain("d2"), 1);

        let event = receiver.try_recv().unwrap();
        assert_eq!(event.kind, TopologyEventKind::NodeDomainChanged);
        assert_eq!(event.fault_domain.as_deref(), Some("d2"));
    }

    #[test]
    fn test_healthy_domains_are_left_alone() {
        let (operation, placement, _events) = setup(&["a1", "b1", "s1"], Some("standby"));
        let result = completed(operation.run(Default::default()).unwrap());
        assert!(result.promoted.is_empty());
        assert_eq!(placement.standby_nodes().len(), 2);
    }

    #[test]
    fn test_reports_shortfall_without_standby_nodes() {
        let (operation, _placement, _events) = setup(&[], Some("standby"));
        let result = completed(operation.run(Default::default()).unwrap());
        assert!(result.promoted.is_empty());
        assert_eq!(result.short, vec![("d1".to_string(), 1), ("d2".to_string(), 1)]);
    }

    #[test]
    fn test_each_standby_node_is_used_once() {
        let (operation, placement, _events) = setup(&["s1"], Some("standby"));
        let result = completed(operation.run(Default::default()).unwrap());

        assert_eq!(result.promoted.len(), 1);
        assert_eq!(result.promoted[0].domain, "d1");
        assert_eq!(result.short, vec![("d2".to_string(), 1)]);
        assert_eq!(placement.node_domain("s1").as_deref(), Some("d1"));
    }

    #[test]
    fn test_request_limits_domains() {
        let (operation, placement, _events) = setup(&["s1", "s2"], Some("standby"));
        let request = PromoteStandbyOperationRequest {
            domains: vec!["d2".to_string()],
        };
        let result = completed(operation.run(request).unwrap());

        assert_eq!(result.promoted.len(), 1);
        assert_eq!(placement.nodes_in_domain("d1"), vec!["a1".to_string()]);
    }

    #[test]
    fn test_skipped_without_standby_domain() {
        let (operation, _placement, _events) = setup(&["s1"], None);
        assert!(matches!(
            operation.run(Default::default()).unwrap(),
            PromoteStandbyOperationOutcome::Skipped(_)
        ));
    }
}
