//! Node liveness and load.

mod load;
mod monitor;

pub use load::{
    ConstantLoadScorer, LoadScorer, MetricsLoadScorer, MetricsParser, NodeMetrics,
    DEFAULT_LOAD_SCORE,
};
pub use monitor::{HealthMonitor, HealthMonitorConfig, NodeStatus};

/// Read side of health tracking, as seen by placement.
pub trait NodeHealth: Send + Sync {
    fn is_node_online(&self, node: &str) -> bool;

    /// Lower is better. Offline nodes score `f64::INFINITY`.
    fn node_load_score(&self, node: &str) -> f64;
}
