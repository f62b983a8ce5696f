use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyEventKind {
    NodeOnline,
    NodeOffline,
    NodeDomainChanged,
}

/// Node lifecycle change, consumed by recovery and rebalancing tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyEvent {
    pub node: String,
    pub kind: TopologyEventKind,
    pub fault_domain: Option<String>,
    pub at: DateTime<Utc>,
}

impl TopologyEvent {
    pub fn new(
        node: impl Into<String>,
        kind: TopologyEventKind,
        fault_domain: Option<String>,
    ) -> Self {
        Self {
            node: node.into(),
            kind,
            fault_domain,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TopologyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: TopologyEvent) {
        tracing::debug!(
            "Publishing topology event {:?} for node {}",
            event.kind,
            event.node
        );
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
