//! Configuration for the counter store

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which backend holds the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local dashmap store, lost on exit
    Memory,
    /// PostgreSQL, shared across processes
    Postgres,
}

/// Configuration for the counter store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection
    pub backend: BackendKind,

    /// PostgreSQL connection string (postgres backend only)
    pub database_url: String,

    /// Maximum pooled connections
    pub max_connections: u32,

    /// Deadline for a single storage call
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            database_url: "postgresql://localhost/usage_analytics".to_string(),
            max_connections: 16,
            operation_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Per-call storage timeout
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.operation_timeout_ms == 0 {
            return Err("operation_timeout_ms must be greater than 0".to_string());
        }

        if self.backend == BackendKind::Postgres {
            if self.database_url.is_empty() {
                return Err("database_url is required for the postgres backend".to_string());
            }
            if self.max_connections == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }

        Ok(())
    }
}
