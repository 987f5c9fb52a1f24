//! Error types for gnmi-cache
//!
//! Only configuration errors ever reach a caller of the cache facade.
//! Connectivity errors are retried by the backends and data errors are
//! logged and dropped, so most variants end up in a log line.

/// Main error type for cache and replication operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Whether the error is worth retrying (broker or store unreachable)
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Nats(_) | Self::Redis(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("JSON error: {}", err))
    }
}

impl From<prost::DecodeError> for CacheError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<async_nats::Error> for CacheError {
    fn from(err: async_nats::Error) -> Self {
        Self::Nats(err.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task failed: {}", err))
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(CacheError::Nats("down".into()).is_connectivity());
        assert!(CacheError::Redis("refused".into()).is_connectivity());
        assert!(!CacheError::Config("missing address".into()).is_connectivity());
        assert!(!CacheError::Decode("truncated".into()).is_connectivity());
    }

    #[test]
    fn test_display_includes_category() {
        let err = CacheError::Config("redis cache requires an address".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: redis cache requires an address"
        );
    }
}
