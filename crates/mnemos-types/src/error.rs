//! Shared error types for the mnemos engine.

use thiserror::Error;

/// Top-level error type for the recall engine.
///
/// The first six variants are the recoverable failure classes of the
/// pipeline; each has a defined fallback and most never reach the caller
/// of `recall`.
#[derive(Error, Debug)]
pub enum MnemosError {
    /// The embedding provider failed or timed out.
    #[error("Embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The persisted vector index is missing, corrupt, or inconsistent.
    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// A rate-limiter token could not be acquired before the deadline.
    #[error("Rate limited: no token available within {waited_ms}ms")]
    RateLimited {
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// No pooled store connection became free in time.
    #[error("Connection pool exhausted: {in_use}/{capacity} connections in use")]
    PoolExhausted {
        /// Connections currently checked out.
        in_use: usize,
        /// Pool capacity.
        capacity: usize,
    },

    /// The backing store is damaged (e.g. corrupt write-ahead log).
    #[error("Store corruption: {0}")]
    StoreCorruption(String),

    /// The persistent embedding cache tier cannot be used.
    #[error("Embedding cache unavailable: {0}")]
    CacheUnavailable(String),

    /// A memory store query failed.
    #[error("Store error: {0}")]
    Store(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid caller input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MnemosError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MnemosError::RateLimited { .. }
                | MnemosError::PoolExhausted { .. }
                | MnemosError::ProviderUnavailable(_)
        )
    }
}

/// Alias for Result with MnemosError.
pub type MnemosResult<T> = Result<T, MnemosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(MnemosError::RateLimited { waited_ms: 10 }.is_retryable());
        assert!(MnemosError::PoolExhausted {
            in_use: 5,
            capacity: 5
        }
        .is_retryable());
        assert!(MnemosError::ProviderUnavailable("timeout".into()).is_retryable());
        assert!(!MnemosError::Config("bad".into()).is_retryable());
        assert!(!MnemosError::StoreCorruption("wal".into()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = MnemosError::PoolExhausted {
            in_use: 3,
            capacity: 3,
        };
        assert_eq!(
            err.to_string(),
            "Connection pool exhausted: 3/3 connections in use"
        );
        let err = MnemosError::RateLimited { waited_ms: 250 };
        assert!(err.to_string().contains("250ms"));
    }
}
