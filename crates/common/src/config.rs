//! Client configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Remote API endpoint settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Response cache lifetimes.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Transient-failure retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Session lifecycle and persistence.
    #[serde(default)]
    pub session: SessionConfig,

    /// Sanity bounds applied to station readings.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Client-side request pacing.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://api.stations.example`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Paths that never receive a bearer credential.
    ///
    /// Entries without `*` match exactly, `*/suffix` matches any path ending
    /// in `/suffix`, and `*` elsewhere matches any run of characters.
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

/// Cache lifetimes per request class (seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Live widget readings.
    #[serde(default = "default_widget_ttl")]
    pub widget_ttl_secs: u64,

    /// Historical ranges.
    #[serde(default = "default_historical_ttl")]
    pub historical_ttl_secs: u64,

    /// Station catalog.
    #[serde(default = "default_stations_ttl")]
    pub stations_ttl_secs: u64,

    /// How often expired entries are swept in the background.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff")]
    pub backoff: BackoffStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lead time before expiry at which a refresh is attempted.
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_secs: u64,

    /// Interval of the background session check.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Encrypted session file. Empty disables persistence.
    #[serde(default = "default_vault_path")]
    pub vault_path: String,

    /// Secret the vault key is derived from. Never serialized back out.
    #[serde(default, skip_serializing)]
    pub vault_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Treat an exact 0.0 temperature or humidity as a missing sensor.
    #[serde(default = "default_true")]
    pub zero_means_absent: bool,

    #[serde(default = "default_min_temp")]
    pub min_temperature_c: f64,

    #[serde(default = "default_max_temp")]
    pub max_temperature_c: f64,

    #[serde(default = "default_min_humidity")]
    pub min_humidity_pct: f64,

    #[serde(default = "default_max_humidity")]
    pub max_humidity_pct: f64,

    #[serde(default = "default_min_pressure")]
    pub min_pressure_hpa: f64,

    #[serde(default = "default_max_pressure")]
    pub max_pressure_hpa: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_reads_per_sec")]
    pub reads_per_sec: u32,

    #[serde(default = "default_writes_per_sec")]
    pub writes_per_sec: u32,
}

impl CacheConfig {
    pub fn widget_ttl(&self) -> Duration {
        Duration::from_secs(self.widget_ttl_secs)
    }

    pub fn historical_ttl(&self) -> Duration {
        Duration::from_secs(self.historical_ttl_secs)
    }

    pub fn stations_ttl(&self) -> Duration {
        Duration::from_secs(self.stations_ttl_secs)
    }
}

impl SessionConfig {
    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "https://api.stations.example".into()
}
fn default_request_timeout() -> u64 {
    15
}
fn default_user_agent() -> String {
    "station-viewer/0.1".into()
}
fn default_public_paths() -> Vec<String> {
    vec![
        "/api/v1/auth/login".into(),
        "/api/v1/auth/refresh".into(),
        "/api/v1/auth/exchange".into(),
        "/api/v1/stations".into(),
        "*/health".into(),
        "/api/v1/public/*".into(),
    ]
}

fn default_widget_ttl() -> u64 {
    120
}
fn default_historical_ttl() -> u64 {
    3600
}
fn default_stations_ttl() -> u64 {
    86_400
}
fn default_sweep_interval() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    8000
}
fn default_backoff() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_refresh_buffer() -> u64 {
    300
}
fn default_check_interval() -> u64 {
    60
}
fn default_vault_path() -> String {
    ".station-viewer/session.vault".into()
}

fn default_min_temp() -> f64 {
    -60.0
}
fn default_max_temp() -> f64 {
    60.0
}
fn default_min_humidity() -> f64 {
    0.0
}
fn default_max_humidity() -> f64 {
    100.0
}
fn default_min_pressure() -> f64 {
    850.0
}
fn default_max_pressure() -> f64 {
    1090.0
}

fn default_reads_per_sec() -> u32 {
    20
}
fn default_writes_per_sec() -> u32 {
    5
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
            public_paths: default_public_paths(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            widget_ttl_secs: default_widget_ttl(),
            historical_ttl_secs: default_historical_ttl(),
            stations_ttl_secs: default_stations_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff: default_backoff(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_secs: default_refresh_buffer(),
            check_interval_secs: default_check_interval(),
            vault_path: default_vault_path(),
            vault_secret: String::new(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            zero_means_absent: default_true(),
            min_temperature_c: default_min_temp(),
            max_temperature_c: default_max_temp(),
            min_humidity_pct: default_min_humidity(),
            max_humidity_pct: default_max_humidity(),
            min_pressure_hpa: default_min_pressure(),
            max_pressure_hpa: default_max_pressure(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            reads_per_sec: default_reads_per_sec(),
            writes_per_sec: default_writes_per_sec(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
            validation: ValidationConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            [api]
            base_url = "https://staging.stations.example"

            [retry]
            backoff = "linear"
        "#;
        let cfg: ClientConfig = toml::from_str(raw).expect("config should parse");
        assert_eq!(cfg.api.base_url, "https://staging.stations.example");
        assert_eq!(cfg.api.request_timeout_secs, 15);
        assert_eq!(cfg.retry.backoff, BackoffStrategy::Linear);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.cache.widget_ttl(), Duration::from_secs(120));
        assert_eq!(cfg.session.refresh_buffer(), Duration::from_secs(300));
    }

    #[test]
    fn test_vault_secret_is_not_serialized() {
        let mut cfg = ClientConfig::default();
        cfg.session.vault_secret = "do-not-leak".into();
        let out = serde_json::to_string(&cfg).unwrap();
        assert!(!out.contains("do-not-leak"));
    }
}
