//! # Configuration Management
//!
//! Configuration structures for the usage analytics engine, loaded from TOML
//! with environment overrides for deployment-specific values.

use crate::error::{AnalyticsError, Result};
use chrono::FixedOffset;
use counter_store::date::zone_from_offset;
use counter_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Overrides `storage.database_url`
pub const ENV_DATABASE_URL: &str = "ANALYTICS_DATABASE_URL";
/// Overrides `time.utc_offset_secs`
pub const ENV_UTC_OFFSET_SECS: &str = "ANALYTICS_UTC_OFFSET_SECS";

/// Main configuration for the analytics engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Counter store configuration
    pub storage: StoreConfig,
    /// Date normalisation
    pub time: TimeConfig,
    /// Local event dispatch
    pub ingestion: IngestionConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Date normalisation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    /// Fixed offset from UTC used for every date boundary and hour-of-day
    pub utc_offset_secs: i32,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self { utc_offset_secs: 8 * 3600 }
    }
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Events processed concurrently by the local dispatcher
    pub max_concurrent_events: usize,
    /// Bounded queue size in front of the dispatcher
    pub queue_capacity: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self { max_concurrent_events: 64, queue_capacity: 10_000 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

impl AnalyticsConfig {
    /// Load configuration from file, apply environment overrides and validate
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AnalyticsConfig = toml::from_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.storage.database_url = url;
        }
        if let Some(offset) = lookup(ENV_UTC_OFFSET_SECS) {
            self.time.utc_offset_secs = offset.trim().parse().map_err(|_| {
                AnalyticsError::config(format!("{ENV_UTC_OFFSET_SECS} is not an integer: {offset}"))
            })?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.storage.validate().map_err(AnalyticsError::config)?;

        if zone_from_offset(self.time.utc_offset_secs).is_none() {
            return Err(AnalyticsError::config(format!(
                "utc_offset_secs out of range: {}",
                self.time.utc_offset_secs
            )));
        }
        if self.ingestion.max_concurrent_events == 0 {
            return Err(AnalyticsError::config("max_concurrent_events must be greater than 0"));
        }
        if self.ingestion.queue_capacity == 0 {
            return Err(AnalyticsError::config("queue_capacity must be greater than 0"));
        }
        Ok(())
    }

    /// Time zone used for date normalisation
    pub fn zone(&self) -> Result<FixedOffset> {
        zone_from_offset(self.time.utc_offset_secs).ok_or_else(|| {
            AnalyticsError::config(format!(
                "utc_offset_secs out of range: {}",
                self.time.utc_offset_secs
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use counter_store::BackendKind;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = AnalyticsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.zone().unwrap().local_minus_utc(), 8 * 3600);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("analytics.toml");

        let mut config = AnalyticsConfig::default();
        config.storage.backend = BackendKind::Postgres;
        config.ingestion.max_concurrent_events = 8;
        config.save_to_file(&path).unwrap();

        let loaded = AnalyticsConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.storage.backend, BackendKind::Postgres);
        assert_eq!(loaded.ingestion.max_concurrent_events, 8);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("analytics.toml");
        std::fs::write(&path, "[time]\nutc_offset_secs = 0\n").unwrap();

        let loaded = AnalyticsConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.time.utc_offset_secs, 0);
        assert_eq!(loaded.ingestion.queue_capacity, 10_000);
    }

    #[test]
    fn test_overrides() {
        let mut config = AnalyticsConfig::default();
        config
            .apply_overrides(|key| match key {
                ENV_DATABASE_URL => Some("postgresql://db/analytics".to_string()),
                ENV_UTC_OFFSET_SECS => Some("-18000".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.storage.database_url, "postgresql://db/analytics");
        assert_eq!(config.time.utc_offset_secs, -18_000);

        let bad = config.apply_overrides(|key| {
            (key == ENV_UTC_OFFSET_SECS).then(|| "eight".to_string())
        });
        assert!(matches!(bad, Err(AnalyticsError::Config(_))));
    }

    #[test]
    fn test_rejects_out_of_range_offset() {
        let mut config = AnalyticsConfig::default();
        config.time.utc_offset_secs = 90_000;
        assert!(config.validate().is_err());
    }
}
