//! # Counter Store
//!
//! Durable, atomically incrementable counters for the usage analytics engine.
//!
//! ## Architecture
//!
//! - **CounterStore**: simple, slot and channel/platform/version counters
//! - **ActivityStore**: open-app log, device attribution, daily presence and usage time
//! - **DefinitionStore**: operator-declared custom metrics
//! - **MemoryStore**: dashmap implementation for tests and local runs
//! - **PgStore**: PostgreSQL implementation built on `INSERT .. ON CONFLICT`
//!
//! ## Usage
//!
//! ```rust
//! use counter_store::{CounterStore, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryStore::new();
//!     store.add_simple("tenant", "opens", 1_710_028_800, 1.0).await?;
//!     let total = store.sum_simple("tenant", "opens", 1_710_028_800, 1_710_028_800).await?;
//!     assert_eq!(total, 1.0);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod date;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod types;

pub use backend::{ActivityStore, AnalyticsStore, CounterStore, DefinitionStore};
pub use config::{BackendKind, StoreConfig};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use types::*;

use std::sync::Arc;

/// Open the backend named by the configuration, creating its schema if needed
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn AnalyticsStore>> {
    config.validate().map_err(StoreError::invalid_operation)?;

    match config.backend {
        BackendKind::Memory => {
            tracing::info!("Using in-memory counter store");
            Ok(Arc::new(MemoryStore::new()))
        }
        BackendKind::Postgres => {
            let store = PgStore::connect(config).await?;
            store.initialize().await?;
            tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL counter store");
            Ok(Arc::new(store))
        }
    }
}
