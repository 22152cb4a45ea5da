//! Error types for the analytics engine

use counter_store::StoreError;
use thiserror::Error;

/// Result type alias for analytics operations
pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// Errors surfaced by ingestion, queries and the metric registry
#[derive(Error, Debug)]
pub enum AnalyticsError {
    /// Storage layer failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed query descriptor or unsupported operator
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Event payload or custom metric violating its declared shape
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The local dispatcher no longer accepts events
    #[error("Event dispatcher is closed")]
    DispatcherClosed,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML decoding errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML encoding errors
    #[error("TOML encoding error: {0}")]
    TomlEncode(#[from] toml::ser::Error),
}

impl AnalyticsError {
    /// Create a new bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the transport should redeliver the event that caused this error
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_store_errors_are_retryable() {
        assert!(AnalyticsError::from(StoreError::timeout("add_cpv")).is_transient());
        assert!(!AnalyticsError::from(StoreError::already_exists("m")).is_transient());
        assert!(!AnalyticsError::validation("bad platform").is_transient());
    }
}
