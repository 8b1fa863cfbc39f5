use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::topology::{EventFilter, KeyExtractor, LatePolicy};
use crate::window::WindowAssigner;

/// Top-level configuration for the windowtally service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Window geometry and lateness handling.
    #[serde(default)]
    pub window: WindowConfig,

    /// Event processing configuration.
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Live update delivery configuration.
    #[serde(default)]
    pub fanout: FanoutConfig,

    /// Interactive query configuration.
    #[serde(default)]
    pub query: QueryConfig,

    /// Dead-letter sink configuration.
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Publish/query/subscribe HTTP API configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Window geometry and lateness handling.
///
/// Durations accept humantime strings (`5s`) or integer milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Window length. Default: 5s.
    #[serde(
        default = "default_window_size",
        deserialize_with = "duration_or_millis::deserialize",
        alias = "windowSize"
    )]
    pub size: Duration,

    /// Distance between window starts; equal to `size` for tumbling
    /// windows. Default: 5s.
    #[serde(
        default = "default_window_hop",
        deserialize_with = "duration_or_millis::deserialize",
        alias = "windowHop"
    )]
    pub hop: Duration,

    /// How far the watermark trails the newest event time. Default: 0s.
    #[serde(
        default = "default_allowed_lateness",
        deserialize_with = "duration_or_millis::deserialize",
        alias = "allowedLateness"
    )]
    pub allowed_lateness: Duration,

    /// Time a window is kept past its end before eviction. Default: 2s.
    #[serde(
        default = "default_grace_period",
        deserialize_with = "duration_or_millis::deserialize",
        alias = "gracePeriod"
    )]
    pub grace_period: Duration,

    /// Handling of events that touch a closed window. Default: dead_letter.
    #[serde(default)]
    pub late_policy: LatePolicy,
}

/// Event processing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyConfig {
    /// Eviction sweep interval. Default: 1s.
    #[serde(default = "default_commit_interval", with = "humantime_serde")]
    pub commit_interval: Duration,

    /// Eviction sweep interval in milliseconds; overrides `commit_interval`.
    #[serde(default, alias = "commitIntervalMs")]
    pub commit_interval_ms: Option<u64>,

    /// Number of ingestion partitions and workers. Default: 4.
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Bounded queue length per partition. Default: 4096.
    #[serde(default = "default_partition_queue_size")]
    pub partition_queue_size: usize,

    /// Event filter; `null` disables filtering. Default: duration > 0.
    #[serde(default = "default_filter")]
    pub filter: Option<FilterConfig>,

    /// Attribute holding the aggregation key. Default: "page".
    #[serde(default = "default_key_attribute")]
    pub key_attribute: String,

    /// How often to log stage counters. Default: 30s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Numeric attribute threshold filter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FilterConfig {
    /// Attribute compared against the threshold. Default: "duration".
    #[serde(default = "default_filter_attribute")]
    pub attribute: String,

    /// Events pass when the attribute is strictly greater. Default: 0.
    #[serde(default, alias = "filterPredicateThreshold")]
    pub threshold: f64,
}

/// Live update delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Pending deltas held per subscription. Default: 1024.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum concurrent subscriptions, 0 for unlimited. Default: 256.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,

    /// SSE keep-alive interval. Default: 15s.
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
}

/// Interactive query configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Per-query deadline. Default: 2s.
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Dead-letter sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterConfig {
    /// Most recent entries retained. Default: 1000.
    #[serde(default = "default_dead_letter_capacity")]
    pub capacity: usize,
}

/// Publish/query/subscribe HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_api_addr")]
    pub addr: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_window_size() -> Duration {
    Duration::from_secs(5)
}

fn default_window_hop() -> Duration {
    Duration::from_secs(5)
}

fn default_allowed_lateness() -> Duration {
    Duration::ZERO
}

fn default_grace_period() -> Duration {
    Duration::from_secs(2)
}

fn default_commit_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_partitions() -> usize {
    4
}

fn default_partition_queue_size() -> usize {
    4096
}

fn default_filter() -> Option<FilterConfig> {
    Some(FilterConfig::default())
}

fn default_filter_attribute() -> String {
    "duration".to_string()
}

fn default_key_attribute() -> String {
    "page".to_string()
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_subscribers() -> usize {
    256
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(15)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_api_addr() -> String {
    ":8080".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

/// Durations written either as humantime strings or integer milliseconds.
mod duration_or_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(humantime_serde::Serde<Duration>),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Duration::from_millis(ms),
            Raw::Text(d) => d.into_inner(),
        })
    }
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            window: WindowConfig::default(),
            topology: TopologyConfig::default(),
            fanout: FanoutConfig::default(),
            query: QueryConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            api: ApiConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: default_window_size(),
            hop: default_window_hop(),
            allowed_lateness: default_allowed_lateness(),
            grace_period: default_grace_period(),
            late_policy: LatePolicy::default(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            commit_interval: default_commit_interval(),
            commit_interval_ms: None,
            partitions: default_partitions(),
            partition_queue_size: default_partition_queue_size(),
            filter: default_filter(),
            key_attribute: default_key_attribute(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            attribute: default_filter_attribute(),
            threshold: 0.0,
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_subscribers: default_max_subscribers(),
            keep_alive: default_keep_alive(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout: default_query_timeout(),
        }
    }
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            capacity: default_dead_letter_capacity(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl WindowConfig {
    /// Builds the assigner for this geometry.
    pub fn assigner(&self) -> Result<WindowAssigner> {
        WindowAssigner::new(self.size, self.hop).context("invalid window configuration")
    }

    pub fn grace_ms(&self) -> i64 {
        i64::try_from(self.grace_period.as_millis()).unwrap_or(i64::MAX)
    }
}

impl TopologyConfig {
    /// Effective eviction interval.
    pub fn commit_interval(&self) -> Duration {
        match self.commit_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.commit_interval,
        }
    }

    pub fn event_filter(&self) -> Option<EventFilter> {
        self.filter
            .as_ref()
            .map(|f| EventFilter::new(f.attribute.clone(), f.threshold))
    }

    pub fn key_extractor(&self) -> KeyExtractor {
        KeyExtractor::new(self.key_attribute.clone())
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::from_yaml(&data)
            .with_context(|| format!("loading config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.window.assigner()?;

        if self.topology.commit_interval().is_zero() {
            bail!("topology.commit_interval must be positive");
        }

        if self.topology.partitions == 0 {
            bail!("topology.partitions must be positive");
        }

        if self.topology.partition_queue_size == 0 {
            bail!("topology.partition_queue_size must be positive");
        }

        if self.topology.key_attribute.is_empty() {
            bail!("topology.key_attribute is required");
        }

        if let Some(ref filter) = self.topology.filter {
            if filter.attribute.is_empty() {
                bail!("topology.filter.attribute is required");
            }
            if !filter.threshold.is_finite() {
                bail!("topology.filter.threshold must be finite");
            }
        }

        if self.topology.stats_interval.is_zero() {
            bail!("topology.stats_interval must be positive");
        }

        if self.fanout.queue_capacity == 0 {
            bail!("fanout.queue_capacity must be positive");
        }

        if self.query.timeout.is_zero() {
            bail!("query.timeout must be positive");
        }

        if self.dead_letter.capacity == 0 {
            bail!("dead_letter.capacity must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::window::WindowError;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.window.size, Duration::from_secs(5));
        assert_eq!(cfg.window.hop, Duration::from_secs(5));
        assert_eq!(cfg.window.grace_period, Duration::from_secs(2));
        assert_eq!(cfg.window.late_policy, LatePolicy::DeadLetter);
        assert_eq!(cfg.topology.commit_interval(), Duration::from_secs(1));
        assert_eq!(cfg.topology.filter, Some(FilterConfig::default()));
        assert_eq!(cfg.api.addr, ":8080");
        assert_eq!(cfg.health.addr, ":9090");
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_full_yaml() {
        let cfg = Config::from_yaml(
            r#"
log_level: debug
window:
  size: 10s
  hop: 5s
  allowed_lateness: 500ms
  grace_period: 1s
  late_policy: apply_open
topology:
  commit_interval: 250ms
  partitions: 10
  filter:
    attribute: latency
    threshold: 12.5
  key_attribute: path
fanout:
  queue_capacity: 8
query:
  timeout: 100ms
"#,
        )
        .unwrap();

        assert_eq!(cfg.window.hop, Duration::from_secs(5));
        assert_eq!(cfg.window.allowed_lateness, Duration::from_millis(500));
        assert_eq!(cfg.window.late_policy, LatePolicy::ApplyOpen);
        assert_eq!(cfg.topology.commit_interval(), Duration::from_millis(250));
        assert_eq!(cfg.topology.partitions, 10);
        assert_eq!(cfg.topology.key_extractor().attribute(), "path");
        assert_eq!(cfg.fanout.queue_capacity, 8);
        assert_eq!(cfg.fanout.max_subscribers, 256);

        let filter = cfg.topology.filter.unwrap();
        assert_eq!(filter.attribute, "latency");
        assert_eq!(filter.threshold, 12.5);
    }

    #[test]
    fn test_camel_case_aliases() {
        let cfg = Config::from_yaml(
            r#"
window:
  windowSize: 1m
  windowHop: 30s
  gracePeriod: 5s
topology:
  commitIntervalMs: 200
  filter:
    filterPredicateThreshold: 3
"#,
        )
        .unwrap();

        assert_eq!(cfg.window.size, Duration::from_secs(60));
        assert_eq!(cfg.window.hop, Duration::from_secs(30));
        assert_eq!(cfg.window.grace_period, Duration::from_secs(5));
        assert_eq!(cfg.topology.commit_interval(), Duration::from_millis(200));
        assert_eq!(cfg.topology.filter.unwrap().threshold, 3.0);
    }

    #[test]
    fn test_window_durations_accept_millis() {
        let cfg = Config::from_yaml(
            r#"
window:
  windowSize: 10000
  windowHop: 5000
  gracePeriod: 1500
  allowedLateness: 250
"#,
        )
        .unwrap();

        assert_eq!(cfg.window.size, Duration::from_secs(10));
        assert_eq!(cfg.window.hop, Duration::from_secs(5));
        assert_eq!(cfg.window.grace_period, Duration::from_millis(1_500));
        assert_eq!(cfg.window.allowed_lateness, Duration::from_millis(250));
        assert_eq!(cfg.window.grace_ms(), 1_500);

        assert!(Config::from_yaml("window:
  size: soon
").is_err());
    }

    #[test]
    fn test_null_filter_disables_filtering() {
        let cfg = Config::from_yaml("topology:\n  filter: null\n").unwrap();
        assert!(cfg.topology.event_filter().is_none());
    }

    #[test]
    fn test_validation_hop_exceeds_size() {
        let mut cfg = Config::default();
        cfg.window.hop = Duration::from_secs(10);

        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err.downcast_ref::<WindowError>(),
            Some(&WindowError::HopExceedsSize {
                size_ms: 5_000,
                hop_ms: 10_000
            })
        );
    }

    #[test]
    fn test_validation_zero_window() {
        let mut cfg = Config::default();
        cfg.window.size = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_zero_partitions() {
        let mut cfg = Config::default();
        cfg.topology.partitions = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("partitions"));
    }

    #[test]
    fn test_validation_zero_commit_interval() {
        let mut cfg = Config::default();
        cfg.topology.commit_interval_ms = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "window:\n  size: 2s\n  hop: 1s").unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.window.size, Duration::from_secs(2));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/windowtally.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
