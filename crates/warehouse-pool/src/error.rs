//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::InvalidReason;

/// Boxed error returned by driver implementations of the capability traits.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// No idle lease became available and the pool is at capacity.
    #[error("pool exhausted: {current} connections open (max {max})")]
    PoolExhausted {
        /// Number of connections open when the acquire gave up.
        current: usize,
        /// Configured maximum pool size.
        max: usize,
    },

    /// The connection factory failed on every attempt.
    #[error("failed to create connection after {attempts} attempt(s): {source}")]
    ConnectionCreationFailed {
        /// Number of factory calls made.
        attempts: u32,
        /// The last underlying failure.
        #[source]
        source: BoxError,
    },

    /// A lease failed validation and could not be replaced.
    #[error("connection validation failed ({reason}) and replacement failed: {source}")]
    ValidationFailed {
        /// Why the lease was rejected.
        reason: InvalidReason,
        /// The error raised while creating the replacement.
        #[source]
        source: Box<PoolError>,
    },

    /// The caller cancelled the acquire before it completed.
    #[error("acquire cancelled")]
    AcquireCancelled,

    /// Connection creation is suspended after repeated failures.
    #[error("connection creation suspended after repeated failures; retry in {retry_after:?}")]
    CircuitOpen {
        /// Time until the next creation attempt is allowed.
        retry_after: Duration,
    },

    /// A network round trip exceeded its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Whether the caller may reasonably retry the failed operation later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. }
            | Self::ConnectionCreationFailed { .. }
            | Self::CircuitOpen { .. }
            | Self::Timeout { .. } => true,
            Self::ValidationFailed { source, .. } => source.is_retryable(),
            Self::PoolClosed | Self::AcquireCancelled | Self::Config(_) => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_exhausted_display_includes_sizes() {
        let err = PoolError::PoolExhausted { current: 2, max: 2 };
        assert_eq!(
            err.to_string(),
            "pool exhausted: 2 connections open (max 2)"
        );
    }

    #[test]
    fn test_creation_failed_keeps_cause() {
        let err = PoolError::ConnectionCreationFailed {
            attempts: 3,
            source: "authentication rejected".into(),
        };
        assert!(err.to_string().contains("after 3 attempt(s)"));
        assert_eq!(
            err.source().unwrap().to_string(),
            "authentication rejected"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PoolError::PoolExhausted { current: 1, max: 1 }.is_retryable());
        assert!(
            PoolError::CircuitOpen {
                retry_after: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(!PoolError::PoolClosed.is_retryable());
        assert!(!PoolError::AcquireCancelled.is_retryable());

        let wrapped = PoolError::ValidationFailed {
            reason: InvalidReason::PingTimedOut,
            source: Box::new(PoolError::PoolClosed),
        };
        assert!(!wrapped.is_retryable());
    }
}
