use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::schema::{DataKind, FetchMechanism, Sport};

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level configuration loaded from `config.json`.
//
// It defines:
// - The data sources to poll
// - Rate-limit ceilings per origin
// - Scheduler and monitor tuning
// - Optional collaborator endpoints (storage, prediction,
//   notifier, render service)
//
// Only `sources` is required. Every other section has defaults.
//
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Data sources polled by the scheduler
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Redis storage. Falls back to in-memory storage when absent.
    pub storage: Option<StorageConfig>,

    /// Prediction service. Predictions are skipped when absent.
    pub prediction: Option<PredictionConfig>,

    /// Notification hub for processed-record updates and alerts
    pub notifier: Option<NotifierConfig>,

    /// Headless-browser / crawl service used by the
    /// `browser` and `crawl` mechanisms
    pub render_service: Option<RenderServiceConfig>,

    pub debug: Option<DebugConfig>,
}

impl Config {
    /// Reads a JSON configuration file from disk and deserializes
    /// it into the strongly typed `Config` structure.
    ///
    /// Read and parse failures both surface as `ConfigError::Load`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&data).map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(data).map_err(|e| ConfigError::Load(e.to_string()))
    }
}

// ------------------------------------------------------------
// Source configuration
// ------------------------------------------------------------
//
// Declarative description of one polled data source.
//
// Notes:
// - `priority` is an ordering hint for listings only, it never
//   changes scheduling.
// - `hints` are passed verbatim to the fetch adapter.
// - `timeout_ms` defaults to min(scheduler default, interval).
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SourceConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub url: String,

    #[serde(default = "default_mechanism")]
    pub mechanism: FetchMechanism,

    pub sport: Sport,

    pub kind: DataKind,

    #[serde(rename = "interval_secs", with = "duration_secs")]
    pub interval: Duration,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub hints: Option<Value>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default, rename = "timeout_ms", with = "opt_duration_ms")]
    pub timeout: Option<Duration>,
}

impl SourceConfig {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        sport: Sport,
        kind: DataKind,
        interval: Duration,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            url: url.into(),
            mechanism: FetchMechanism::Http,
            sport,
            kind,
            interval,
            enabled: true,
            priority: 0,
            hints: None,
            headers: HashMap::new(),
            timeout: None,
        }
    }

    pub fn with_mechanism(mut self, mechanism: FetchMechanism) -> Self {
        self.mechanism = mechanism;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }

    /// Effective fetch timeout. Never longer than the polling
    /// interval so ticks cannot pile up.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default).min(self.interval)
    }
}

// ------------------------------------------------------------
// Rate-limit configuration
// ------------------------------------------------------------
//
// Fixed-window ceilings per origin (scheme://host[:port]).
// Origins not listed here use a built-in ceiling for known
// sports APIs or `default_ceiling`.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub default_ceiling: u32,
    pub backoff_multiplier: f64,
    pub max_retries: u32,

    /// Origin (or any URL on it) -> requests per window
    pub origins: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            default_ceiling: 30,
            backoff_multiplier: 2.0,
            max_retries: 3,
            origins: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

// ------------------------------------------------------------
// Scheduler configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Default fetch timeout in milliseconds
    pub default_timeout_ms: u64,

    /// Per-subscriber event queue capacity
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            event_buffer: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

// ------------------------------------------------------------
// Monitor configuration
// ------------------------------------------------------------
//
// Tick intervals and health thresholds.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub metrics_interval_ms: u64,
    pub health_interval_secs: u64,

    /// Interval of the `[METRICS]` log line
    pub metrics_log_interval_secs: u64,

    /// How long collection errors are kept in memory
    pub error_retention_secs: u64,

    /// Hard cap on buffered collection errors
    pub max_error_buffer: usize,

    pub max_errors_per_minute: usize,
    pub min_success_rate: f64,
    pub min_sample_size: u64,

    /// Failures (with zero successes) before a source is flagged
    pub source_failure_threshold: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metrics_interval_ms: 1_000,
            health_interval_secs: 30,
            metrics_log_interval_secs: 10,
            error_retention_secs: 300,
            max_error_buffer: 1_000,
            max_errors_per_minute: 10,
            min_success_rate: 0.8,
            min_sample_size: 10,
            source_failure_threshold: 5,
        }
    }
}

impl MonitorConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn metrics_log_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_log_interval_secs.max(1))
    }

    pub fn error_retention(&self) -> Duration {
        Duration::from_secs(self.error_retention_secs)
    }
}

// ------------------------------------------------------------
// Collaborator endpoints
// ------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Redis connection URL (redis://host:port/db)
    pub redis_url: String,

    /// Key prefix for upserted entities
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PredictionConfig {
    /// Endpoint accepting POST {kind, features}
    pub url: String,

    #[serde(default = "default_collaborator_timeout_ms")]
    pub timeout_ms: u64,
}

// ------------------------------------------------------------
// Notifier configuration
// ------------------------------------------------------------
//
// Defines how processed-record updates reach the notification hub.
//
// Notes:
// - The `key` is security-sensitive and must never be committed.
// - `connections` controls parallel WebSocket connections.
// - `demo` disables sending (updates are only logged).
//
#[derive(Debug, Deserialize, Clone)]
pub struct NotifierConfig {
    pub url: String,

    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Authentication key sent during login
    /// (sent as: key=XYZ&role=collector)
    pub key: String,

    pub demo: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderServiceConfig {
    /// Endpoint accepting POST {url, mode, hints}
    pub url: String,

    /// Optional bearer token
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DebugConfig {
    /// Enables verbose notifier logging
    pub log: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn default_mechanism() -> FetchMechanism {
    FetchMechanism::Http
}

fn default_key_prefix() -> String {
    "sportsfeed".to_string()
}

fn default_collaborator_timeout_ms() -> u64 {
    5_000
}

fn default_connections() -> usize {
    1
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "sources": [{
                    "id": "espn-nfl-scores",
                    "url": "https://site.api.espn.com/apis/site/v2/sports/football/nfl/scoreboard",
                    "sport": "nfl",
                    "kind": "game_updates",
                    "interval_secs": 30
                }]
            }"#,
        )
        .unwrap();

        let src = &cfg.sources[0];
        assert_eq!(src.mechanism, FetchMechanism::Http);
        assert!(src.enabled);
        assert_eq!(src.interval, Duration::from_secs(30));
        assert_eq!(src.display_name(), "espn-nfl-scores");
        assert_eq!(cfg.rate_limits.window_secs, 60);
        assert_eq!(cfg.monitor.max_errors_per_minute, 10);
        assert!(cfg.storage.is_none());
    }

    #[test]
    fn timeout_is_capped_by_interval() {
        let src = SourceConfig::new(
            "s",
            "https://example.com",
            Sport::Nba,
            DataKind::Odds,
            Duration::from_secs(5),
        );
        assert_eq!(src.effective_timeout(Duration::from_secs(30)), Duration::from_secs(5));

        let src = src.with_timeout(Duration::from_secs(2));
        assert_eq!(src.effective_timeout(Duration::from_secs(30)), Duration::from_secs(2));
    }

    #[test]
    fn load_failures_are_config_errors() {
        let missing = Config::from_file("/nonexistent/sportsfeed/config.json");
        assert!(matches!(missing, Err(ConfigError::Load(msg)) if msg.contains("/nonexistent/sportsfeed")));

        let malformed = Config::from_json(r#"{ "sources": [ "#);
        assert!(matches!(malformed, Err(ConfigError::Load(_))));

        let wrong_shape = Config::from_json(r#"{ "sources": 5 }"#);
        assert!(matches!(wrong_shape, Err(ConfigError::Load(_))));
    }

    #[test]
    fn example_config_parses() {
        let cfg = Config::from_json(include_str!("../config.example.json")).unwrap();

        assert_eq!(cfg.sources.len(), 3);
        assert_eq!(cfg.sources[1].mechanism, FetchMechanism::Browser);
        assert_eq!(cfg.sources[1].timeout, Some(Duration::from_millis(20_000)));
        assert!(!cfg.sources[2].enabled);
        assert_eq!(cfg.rate_limits.origins["https://injuries.example.com"], 4);
        assert_eq!(cfg.notifier.unwrap().connections, 2);
    }
}
