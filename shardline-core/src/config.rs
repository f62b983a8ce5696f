//! Topology configuration model.
//!
//! These types are owned by the configuration source and are read-only to the
//! placement layer; every change arrives as a complete replacement.

use crate::{Result, ShardlineError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;

pub const DEFAULT_WEIGHT: u32 = 100;
pub const DEFAULT_VIRTUAL_NODES_PER_WEIGHT_UNIT: u32 = 150;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub fault_domain: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub metrics_path: Option<String>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            access_key: String::new(),
            secret_key: String::new(),
            fault_domain: None,
            weight: DEFAULT_WEIGHT,
            enabled: true,
            region: default_region(),
            bucket: default_bucket(),
            metrics_path: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.fault_domain = Some(domain.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.access_key = access_key.into();
        self.secret_key = secret_key.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_metrics_path(mut self, path: impl Into<String>) -> Self {
        self.metrics_path = Some(path.into());
        self
    }

    /// The configured fault domain, ignoring blank values.
    pub fn domain(&self) -> Option<&str> {
        self.fault_domain
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn has_name(&self) -> bool {
        !self.name.trim().is_empty()
    }

    /// Full URL of the Prometheus endpoint, if metrics scraping is configured.
    pub fn metrics_url(&self) -> Option<String> {
        let path = self
            .metrics_path
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())?;
        let base = self.endpoint.trim().trim_end_matches('/');
        if base.is_empty() {
            return None;
        }

        if path.starts_with('/') {
            Some(format!("{}{}", base, path))
        } else {
            Some(format!("{}/{}", base, path))
        }
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("fault_domain", &self.fault_domain)
            .field("weight", &self.weight)
            .field("enabled", &self.enabled)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("metrics_path", &self.metrics_path)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDomainConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub accepts_writes: bool,
    /// Informational only.
    #[serde(default = "default_replica_count")]
    pub replica_count: usize,
    /// Overrides the topology-wide minimum used by standby promotion.
    #[serde(default)]
    pub min_healthy_nodes: Option<usize>,
}

impl FaultDomainConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepts_writes: true,
            replica_count: default_replica_count(),
            min_healthy_nodes: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.accepts_writes = false;
        self
    }

    /// Config used for a domain referenced by nodes or the active list but not
    /// declared explicitly.
    pub fn implicit(name: impl Into<String>) -> Self {
        Self::new(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default, deserialize_with = "node_entries")]
    pub nodes: Vec<NodeConfig>,
    #[serde(default, deserialize_with = "domain_entries")]
    pub domains: Vec<FaultDomainConfig>,
    #[serde(default)]
    pub active_domains: Vec<String>,
    #[serde(default)]
    pub replication_factor: Option<usize>,
    #[serde(default = "default_write_quorum")]
    pub write_quorum: String,
    #[serde(default)]
    pub standby_domain: Option<String>,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes_per_weight_unit: u32,
    #[serde(default = "default_min_healthy_nodes")]
    pub min_healthy_nodes_per_domain: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            domains: Vec::new(),
            active_domains: Vec::new(),
            replication_factor: None,
            write_quorum: default_write_quorum(),
            standby_domain: None,
            virtual_nodes_per_weight_unit: default_virtual_nodes(),
            min_healthy_nodes_per_domain: default_min_healthy_nodes(),
        }
    }
}

impl TopologyConfig {
    pub fn is_single_domain_mode(&self) -> bool {
        self.active_domains.len() <= 1
    }

    pub fn standby_domain(&self) -> Option<&str> {
        self.standby_domain
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn is_standby_enabled(&self) -> bool {
        self.standby_domain().is_some()
    }

    /// Replica count actually targeted, bounded by the number of active domains.
    pub fn effective_replication_factor(&self) -> usize {
        let active = self.active_domains.len();
        if active == 0 {
            return 1;
        }

        match self.replication_factor {
            Some(factor) if factor <= active => factor.max(1),
            _ => active,
        }
    }

    /// Number of successful replica writes an upload should require.
    pub fn effective_write_quorum(&self) -> usize {
        let factor = self.effective_replication_factor();
        let auto = if factor <= 2 { factor } else { factor / 2 + 1 };

        match self.write_quorum.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => auto,
            "majority" => factor / 2 + 1,
            "all" => factor,
            other => match other.parse::<usize>() {
                Ok(parsed) => parsed.clamp(1, factor),
                Err(_) => {
                    tracing::warn!("Invalid write_quorum '{}', using 'auto'", self.write_quorum);
                    auto
                }
            },
        }
    }

    /// Named node entries in file order. The first entry for a name wins,
    /// whether or not it is enabled.
    pub fn unique_nodes(&self) -> Vec<&NodeConfig> {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !node.has_name() {
                tracing::warn!("Skipping storage node entry without a name");
                continue;
            }
            if !seen.insert(node.name.as_str()) {
                tracing::error!("Duplicate storage node name {}, keeping the first entry", node.name);
                continue;
            }
            unique.push(node);
        }
        unique
    }

    pub fn find_node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn find_domain(&self, name: &str) -> Option<&FaultDomainConfig> {
        self.domains.iter().find(|domain| domain.name == name)
    }

    /// Checks the topology as a whole. Individual bad node entries are not
    /// rejected here; consumers skip them when building their state.
    pub fn validate(&self) -> Result<()> {
        if self.active_domains.is_empty() {
            if !self.nodes.is_empty() || !self.domains.is_empty() {
                return Err(ShardlineError::Config(
                    "active_domains must list at least one domain when nodes or domains are configured"
                        .to_string(),
                ));
            }

            tracing::warn!("active_domains is not configured; storage topology is empty");
            return Ok(());
        }

        let mut seen = HashSet::new();
        for domain in &self.active_domains {
            if domain.trim().is_empty() {
                return Err(ShardlineError::Config(
                    "active_domains cannot contain a blank domain name".to_string(),
                ));
            }
            if !seen.insert(domain.as_str()) {
                return Err(ShardlineError::Config(format!(
                    "active domain '{}' is listed more than once",
                    domain
                )));
            }
        }

        if self.virtual_nodes_per_weight_unit == 0 {
            return Err(ShardlineError::Config(
                "virtual_nodes_per_weight_unit must be greater than zero".to_string(),
            ));
        }

        if self.is_single_domain_mode() {
            tracing::warn!(
                "Running in single-domain mode (domain: {}); data is not replicated across domains",
                self.active_domains[0]
            );
        }

        if let Some(factor) = self.replication_factor {
            if factor > self.active_domains.len() {
                tracing::warn!(
                    "replication_factor ({}) exceeds active domain count ({}), using {}",
                    factor,
                    self.active_domains.len(),
                    self.effective_replication_factor()
                );
            }
        }

        if let Some(standby) = self.standby_domain() {
            if self.active_domains.iter().any(|domain| domain == standby) {
                tracing::warn!(
                    "standby domain '{}' is also listed as active; it will receive normal placements",
                    standby
                );
            }
        }

        Ok(())
    }
}

fn node_entries<'de, D>(deserializer: D) -> std::result::Result<Vec<NodeConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_entries(deserializer, "node")
}

fn domain_entries<'de, D>(deserializer: D) -> std::result::Result<Vec<FaultDomainConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_entries(deserializer, "fault domain")
}

/// Decodes a list one entry at a time. A malformed entry is logged and
/// dropped; the others are kept.
fn lenient_entries<'de, D, T>(deserializer: D, kind: &str) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;

    let entries = raw
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::error!("Skipping malformed {} entry #{}: {}", kind, index, e);
                None
            }
        })
        .collect();
    Ok(entries)
}

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bucket() -> String {
    "shardline".to_string()
}

fn default_replica_count() -> usize {
    1
}

fn default_write_quorum() -> String {
    "auto".to_string()
}

fn default_virtual_nodes() -> u32 {
    DEFAULT_VIRTUAL_NODES_PER_WEIGHT_UNIT
}

fn default_min_healthy_nodes() -> usize {
    1
}
