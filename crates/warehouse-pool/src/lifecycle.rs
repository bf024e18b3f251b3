//! Connection capabilities and lease lifecycle types.
//!
//! The pool never speaks a wire protocol itself. A driver plugs in by
//! implementing [`ConnectionFactory`] for its session type, which in turn
//! implements [`Connection`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::EndpointConfig;
use crate::error::BoxError;

/// A live warehouse session managed by the pool.
///
/// Only the operations the pool needs are part of this trait; query
/// execution is whatever the concrete type offers to callers holding a
/// [`LeaseHandle`](crate::LeaseHandle).
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Server-assigned session identifier, if the driver exposes one.
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Perform the cheapest possible round trip to prove the session is alive.
    async fn ping(&mut self) -> Result<(), BoxError>;

    /// Close the session.
    async fn close(&mut self) -> Result<(), BoxError>;
}

/// Opens new warehouse sessions.
///
/// Implementations must be safe to call repeatedly; the pool retries
/// transient failures with backoff.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The session type produced by this factory.
    type Connection: Connection;

    /// Open a new session against the endpoint.
    async fn create(&self, endpoint: &EndpointConfig) -> Result<Self::Connection, BoxError>;
}

/// Where a lease currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Sitting in the idle queue.
    Idle,
    /// Checked out by a caller.
    InUse,
    /// Held by the pool while it is being validated.
    Validating,
}

/// Bookkeeping attached to every pooled connection.
#[derive(Debug, Clone)]
pub struct LeaseMetadata {
    /// Stable identity for logs and metrics.
    pub id: String,
    /// When the connection was opened.
    pub created_at: Instant,
    /// When the connection was last checked out or returned.
    pub last_used_at: Instant,
    /// Number of times the connection has been checked out.
    pub use_count: u64,
}

impl LeaseMetadata {
    pub(crate) fn new(id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            use_count: 0,
        }
    }

    /// Time since the connection was opened.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last used.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_used_at.elapsed()
    }
}

/// Outcome of validating a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The lease may be handed out or returned to the idle queue.
    Valid,
    /// The lease must be destroyed.
    Invalid(InvalidReason),
}

impl Validation {
    /// Whether the lease passed validation.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Why a lease failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// The connection outlived the idle timeout.
    Expired {
        /// Age of the connection when checked.
        age: Duration,
    },
    /// The liveness ping returned an error.
    PingFailed(String),
    /// The liveness ping did not answer before the deadline.
    PingTimedOut,
}

impl InvalidReason {
    /// Whether this is a liveness failure rather than an age eviction.
    #[must_use]
    pub fn is_liveness_failure(&self) -> bool {
        !matches!(self, Self::Expired { .. })
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired { age } => write!(f, "expired after {age:?}"),
            Self::PingFailed(e) => write!(f, "ping failed: {e}"),
            Self::PingTimedOut => f.write_str("ping timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_metadata_ages_with_clock() {
        let meta = LeaseMetadata::new("abc".into());
        assert_eq!(meta.use_count, 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(meta.age(), Duration::from_secs(5));
        assert_eq!(meta.idle_time(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_reason_classification() {
        assert!(
            !InvalidReason::Expired {
                age: Duration::from_secs(1)
            }
            .is_liveness_failure()
        );
        assert!(InvalidReason::PingTimedOut.is_liveness_failure());
        assert_eq!(
            InvalidReason::PingFailed("socket reset".into()).to_string(),
            "ping failed: socket reset"
        );
        assert!(!Validation::Invalid(InvalidReason::PingTimedOut).is_valid());
        assert!(Validation::Valid.is_valid());
    }
}
