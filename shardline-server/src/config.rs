use serde::{Deserialize, Serialize};
use shardline_core::{HealthMonitorConfig, Result, ShardlineError, TopologyConfig};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub reload: ReloadSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScorerKind {
    Metrics,
    Constant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_metrics_timeout_ms")]
    pub metrics_timeout_ms: u64,
    #[serde(default = "default_metrics_ttl_secs")]
    pub metrics_ttl_secs: u64,
    #[serde(default = "default_scorer")]
    pub scorer: ScorerKind,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            initial_delay_secs: default_initial_delay_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            metrics_timeout_ms: default_metrics_timeout_ms(),
            metrics_ttl_secs: default_metrics_ttl_secs(),
            scorer: default_scorer(),
        }
    }
}

impl HealthSettings {
    pub fn monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            interval: Duration::from_secs(self.interval_secs),
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            metrics_timeout: Duration::from_millis(self.metrics_timeout_ms),
            metrics_ttl: Duration::from_secs(self.metrics_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_allow_http")]
    pub allow_http: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            allow_http: default_allow_http(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadSettings {
    /// How often the configuration file is re-read.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8700".to_string()
}

fn default_interval_secs() -> u64 {
    30
}

fn default_initial_delay_secs() -> u64 {
    15
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_metrics_timeout_ms() -> u64 {
    5_000
}

fn default_metrics_ttl_secs() -> u64 {
    60
}

fn default_scorer() -> ScorerKind {
    ScorerKind::Metrics
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_allow_http() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("SHARDLINE").separator("__"))
            .build()
            .map_err(|e| ShardlineError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ShardlineError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.trim().is_empty() {
            return Err(ShardlineError::Config("bind_addr cannot be empty".to_string()));
        }
        if self.health.interval_secs == 0 {
            return Err(ShardlineError::Config(
                "health.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(ShardlineError::Config(
                "health.probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.reload.poll_interval_secs == 0 {
            return Err(ShardlineError::Config(
                "reload.poll_interval_secs must be greater than zero".to_string(),
            ));
        }

        self.topology.validate()
    }
}
