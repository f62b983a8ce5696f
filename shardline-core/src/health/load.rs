use crate::{Result, ShardlineError};
use regex::Regex;
use serde::Serialize;
use std::time::{Duration, Instant};

pub const DEFAULT_LOAD_SCORE: f64 = 0.5;

const DISK_WEIGHT: f64 = 0.4;
const INFLIGHT_WEIGHT: f64 = 0.35;
const WAITING_WEIGHT: f64 = 0.25;

const INFLIGHT_SATURATION: f64 = 100.0;
const WAITING_SATURATION: f64 = 50.0;

const DEFAULT_METRICS_TTL: Duration = Duration::from_secs(60);

/// Last scraped load indicators of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeMetrics {
    pub disk_usage_percent: Option<f64>,
    pub inflight_requests: u64,
    pub waiting_requests: u64,
    #[serde(skip)]
    pub fetched_at: Instant,
}

impl NodeMetrics {
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

/// Turns cached metrics into a comparable score for an online node.
pub trait LoadScorer: Send + Sync {
    fn score(&self, metrics: Option<&NodeMetrics>) -> f64;
}

/// Same score for every online node.
#[derive(Debug, Clone, Copy)]
pub struct ConstantLoadScorer(pub f64);

impl Default for ConstantLoadScorer {
    fn default() -> Self {
        Self(DEFAULT_LOAD_SCORE)
    }
}

impl LoadScorer for ConstantLoadScorer {
    fn score(&self, _metrics: Option<&NodeMetrics>) -> f64 {
        self.0
    }
}

/// Weighted blend of disk usage, in-flight and queued requests, each
/// saturating at 1.0. Missing or stale metrics score [`DEFAULT_LOAD_SCORE`].
#[derive(Debug, Clone)]
pub struct MetricsLoadScorer {
    ttl: Duration,
}

impl MetricsLoadScorer {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl Default for MetricsLoadScorer {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_TTL)
    }
}

impl LoadScorer for MetricsLoadScorer {
    fn score(&self, metrics: Option<&NodeMetrics>) -> f64 {
        let Some(metrics) = metrics.filter(|metrics| !metrics.is_expired(self.ttl)) else {
            return DEFAULT_LOAD_SCORE;
        };

        let disk = metrics
            .disk_usage_percent
            .map(|percent| (percent / 100.0).clamp(0.0, 1.0))
            .unwrap_or(0.0);
        let inflight = (metrics.inflight_requests as f64 / INFLIGHT_SATURATION).min(1.0);
        let waiting = (metrics.waiting_requests as f64 / WAITING_SATURATION).min(1.0);

        disk * DISK_WEIGHT + inflight * INFLIGHT_WEIGHT + waiting * WAITING_WEIGHT
    }
}

/// Extracts load indicators from MinIO-style Prometheus text.
///
/// Drive byte counts are summed over every drive line; request gauges are
/// summed over every API label set.
#[derive(Debug, Clone)]
pub struct MetricsParser {
    disk_used: Regex,
    disk_total: Regex,
    inflight: Regex,
    waiting: Regex,
}

const NUMBER: &str = r"([+-]?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)";

impl MetricsParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            disk_used: compile(r"minio_node_dr(?:ive|isk)_used_bytes\{[^}]*\}\s+")?,
            disk_total: compile(r"minio_node_dr(?:ive|isk)_total_bytes\{[^}]*\}\s+")?,
            inflight: compile(r"minio_s3_requests_inflight(?:_total)?\{[^}]*\}\s+")?,
            waiting: compile(r"minio_s3_requests_waiting(?:_total)?\{[^}]*\}\s+")?,
        })
    }

    pub fn parse(&self, text: &str) -> Result<NodeMetrics> {
        let used = sum_matches(&self.disk_used, text);
        let total = sum_matches(&self.disk_total, text);
        let inflight = sum_matches(&self.inflight, text);
        let waiting = sum_matches(&self.waiting, text);

        if used.is_none() && total.is_none() && inflight.is_none() && waiting.is_none() {
            return Err(ShardlineError::Metrics(
                "no recognised storage metrics in payload".to_string(),
            ));
        }

        let disk_usage_percent = match (used, total) {
            (Some(used), Some(total)) if total > 0.0 => Some(used / total * 100.0),
            _ => None,
        };

        Ok(NodeMetrics {
            disk_usage_percent,
            inflight_requests: to_count(inflight),
            waiting_requests: to_count(waiting),
            fetched_at: Instant::now(),
        })
    }
}

fn compile(prefix: &str) -> Result<Regex> {
    Regex::new(&format!(r"(?m)^{}{}", prefix, NUMBER))
        .map_err(|err| ShardlineError::Internal(format!("invalid metrics pattern: {}", err)))
}

fn sum_matches(pattern: &Regex, text: &str) -> Option<f64> {
    let mut total = None;
    for captures in pattern.captures_iter(text) {
        let Some(value) = captures.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) else {
            continue;
        };
        *total.get_or_insert(0.0) += value;
    }
    total
}

fn to_count(value: Option<f64>) -> u64 {
    value
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|value| value.round() as u64)
        .unwrap_or(0)
}
