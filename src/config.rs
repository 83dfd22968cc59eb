//! Configuration loader: merges env vars, .env file, and config.toml.

use common::config::ClientConfig;
use common::Error;
use std::path::Path;

fn parse_positive_u64(raw: &str, env_name: &str) -> Result<u64, Error> {
    match raw.trim().parse::<u64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(Error::Config(format!("{env_name} must be an integer > 0"))),
    }
}

fn validate_config(config: &ClientConfig) -> Result<(), Error> {
    let mut issues: Vec<String> = Vec::new();

    let base_url = config.api.base_url.trim();
    if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
        issues.push("api.base_url must start with http:// or https://".into());
    }
    if config.api.request_timeout_secs == 0 {
        issues.push("api.request_timeout_secs must be > 0".into());
    }

    if config.cache.widget_ttl_secs == 0 {
        issues.push("cache.widget_ttl_secs must be > 0".into());
    }
    if config.cache.historical_ttl_secs == 0 {
        issues.push("cache.historical_ttl_secs must be > 0".into());
    }
    if config.cache.stations_ttl_secs == 0 {
        issues.push("cache.stations_ttl_secs must be > 0".into());
    }
    if config.cache.sweep_interval_secs == 0 {
        issues.push("cache.sweep_interval_secs must be > 0".into());
    }

    if config.retry.max_attempts == 0 {
        issues.push("retry.max_attempts must be >= 1".into());
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        issues.push("retry.base_delay_ms must be <= retry.max_delay_ms".into());
    }

    if config.session.check_interval_secs == 0 {
        issues.push("session.check_interval_secs must be > 0".into());
    }

    let v = &config.validation;
    if v.min_temperature_c >= v.max_temperature_c {
        issues.push("validation.min_temperature_c must be < validation.max_temperature_c".into());
    }
    if v.min_humidity_pct >= v.max_humidity_pct {
        issues.push("validation.min_humidity_pct must be < validation.max_humidity_pct".into());
    }
    if v.min_pressure_hpa >= v.max_pressure_hpa {
        issues.push("validation.min_pressure_hpa must be < validation.max_pressure_hpa".into());
    }

    if config.rate_limit.reads_per_sec == 0 {
        issues.push("rate_limit.reads_per_sec must be > 0".into());
    }
    if config.rate_limit.writes_per_sec == 0 {
        issues.push("rate_limit.writes_per_sec must be > 0".into());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid config:\n - {}",
            issues.join("\n - ")
        )))
    }
}

/// Environment variables take priority over config.toml.
fn apply_env_overrides(
    config: &mut ClientConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), Error> {
    if let Some(url) = var("STATION_API_URL") {
        config.api.base_url = url.trim().to_string();
    }
    if let Some(secret) = var("STATION_VAULT_KEY") {
        config.session.vault_secret = secret;
    }
    if let Some(path) = var("STATION_VAULT_PATH") {
        config.session.vault_path = path.trim().to_string();
    }
    if let Some(raw) = var("STATION_REFRESH_BUFFER_SECS") {
        config.session.refresh_buffer_secs = parse_positive_u64(&raw, "STATION_REFRESH_BUFFER_SECS")?;
    }
    if let Some(raw) = var("STATION_RETRY_ATTEMPTS") {
        let attempts = parse_positive_u64(&raw, "STATION_RETRY_ATTEMPTS")?;
        config.retry.max_attempts = u32::try_from(attempts)
            .map_err(|_| Error::Config("STATION_RETRY_ATTEMPTS is too large".into()))?;
    }
    if let Some(raw) = var("STATION_WIDGET_TTL_SECS") {
        config.cache.widget_ttl_secs = parse_positive_u64(&raw, "STATION_WIDGET_TTL_SECS")?;
    }
    if let Some(raw) = var("STATION_HISTORICAL_TTL_SECS") {
        config.cache.historical_ttl_secs = parse_positive_u64(&raw, "STATION_HISTORICAL_TTL_SECS")?;
    }
    Ok(())
}

fn load_from(
    config_path: &Path,
    var: impl Fn(&str) -> Option<String>,
) -> Result<ClientConfig, Error> {
    let mut config = ClientConfig::default();

    if config_path.exists() {
        let contents = std::fs::read_to_string(config_path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", config_path.display(), e)))?;
        config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", config_path.display(), e)))?;
    }

    apply_env_overrides(&mut config, var)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load client configuration from environment and optional config file.
pub fn load_config() -> Result<ClientConfig, Error> {
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }
    load_from(Path::new("config.toml"), |name| std::env::var(name).ok())
}
