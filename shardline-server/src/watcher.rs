use crate::config::Config;
use shardline_core::{ConfigSource, MemoryConfigSource, Result, TopologyConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Topology taken from the configuration file, re-read on a fixed interval.
/// Only the `topology` section is hot-reloaded.
pub struct FileConfigSource {
    path: String,
    inner: MemoryConfigSource,
    poll_interval: Duration,
}

impl FileConfigSource {
    pub fn new(path: impl Into<String>, initial: TopologyConfig, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            inner: MemoryConfigSource::new(initial),
            poll_interval,
        }
    }

    /// Re-reads the file. Returns whether the topology changed.
    pub fn refresh(&self) -> Result<bool> {
        let config = Config::from_file(&self.path)?;
        Ok(self.inner.update(config.topology))
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.refresh() {
                    Ok(true) => tracing::info!("Topology in {} changed", self.path),
                    Ok(false) => tracing::debug!("Topology in {} unchanged", self.path),
                    Err(e) => tracing::warn!(
                        "Ignoring configuration file {}, keeping the current topology: {}",
                        self.path,
                        e
                    ),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn current_topology(&self) -> Arc<TopologyConfig> {
        self.inner.current_topology()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.subscribe()
    }
}
