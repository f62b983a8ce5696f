//! Configuration sources.
//!
//! The placement layer pulls the current topology from a [`ConfigSource`] and
//! treats change notifications as opaque triggers.

use crate::TopologyConfig;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::watch;

pub trait ConfigSource: Send + Sync {
    /// The topology currently in force.
    fn current_topology(&self) -> Arc<TopologyConfig>;

    /// Receives a new revision number each time the topology changes.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// In-memory source; other sources (files, remote config services) feed it.
pub struct MemoryConfigSource {
    current: ArcSwap<TopologyConfig>,
    revision: watch::Sender<u64>,
}

impl MemoryConfigSource {
    pub fn new(initial: TopologyConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(initial),
            revision,
        }
    }

    /// Replaces the topology. Subscribers are notified only when it differs
    /// from the one in force; returns whether a change was published.
    pub fn update(&self, topology: TopologyConfig) -> bool {
        if *self.current.load_full() == topology {
            tracing::debug!("Topology unchanged; skipping change notification");
            return false;
        }

        self.current.store(Arc::new(topology));
        self.revision.send_modify(|revision| *revision += 1);
        tracing::info!("Published topology revision {}", *self.revision.borrow());
        true
    }

    /// Notifies subscribers without changing the topology.
    pub fn touch(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }
}

impl ConfigSource for MemoryConfigSource {
    fn current_topology(&self) -> Arc<TopologyConfig> {
        self.current.load_full()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
