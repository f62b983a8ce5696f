//! Shardline Core - fault-domain aware placement for S3-compatible storage nodes
//!
//! Decides which nodes hold the replicas of a content-addressed chunk and
//! which node serves a read, using:
//! - one weighted consistent-hash ring per fault domain
//! - health-aware fallback inside each domain
//! - immutable topology snapshots published by atomic swap
//! - one long-lived storage client per node, reused across reloads

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod operations;
pub mod placement;
pub mod registry;
pub mod ring;
pub mod runtime;
pub mod source;

pub use config::{
    DEFAULT_VIRTUAL_NODES_PER_WEIGHT_UNIT, DEFAULT_WEIGHT, FaultDomainConfig, NodeConfig,
    TopologyConfig,
};
pub use error::{Result, ShardlineError};
pub use events::{EventBus, TopologyEvent, TopologyEventKind};
pub use health::{
    ConstantLoadScorer, HealthMonitor, HealthMonitorConfig, LoadScorer, MetricsLoadScorer,
    NodeHealth, NodeMetrics, NodeStatus,
};
pub use placement::{PlacementManager, TopologySnapshot};
pub use registry::{
    ClientFactory, ClientRegistry, ProbeOutcome, ReloadReport, S3ClientFactory, S3StorageClient,
    StorageClient,
};
pub use ring::{HashRing, WEIGHT_UNIT, ring_hash};
pub use runtime::PlacementRuntime;
pub use source::{ConfigSource, MemoryConfigSource};
