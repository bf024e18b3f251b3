//! # warehouse-pool
//!
//! Bounded async connection pool for analytical data-warehouse sessions.
//!
//! Warehouse sessions are expensive to open and the service caps how many a
//! client may hold, so the pool keeps a small set of long-lived sessions and
//! shares them between many concurrent callers.
//!
//! ## Features
//!
//! - Eager creation of `min_size` connections, lazy growth up to `max_size`
//! - Validation on checkout and return (age check plus a liveness ping)
//! - Retry with exponential backoff and a circuit breaker on creation
//! - Background reaper that evicts stale connections and restores `min_size`
//! - Caller cancellation and bounded waits on acquire
//! - Metrics snapshots for observability
//!
//! The pool does not talk to the warehouse itself. A driver plugs in by
//! implementing [`ConnectionFactory`] and [`Connection`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use warehouse_pool::{EndpointConfig, Pool};
//! use std::time::Duration;
//!
//! let endpoint = EndpointConfig::from_connection_string(
//!     "account=acme-eu1;user=etl;password=secret;warehouse=REPORTING",
//! )?;
//!
//! let pool = Pool::builder()
//!     .min_size(2)
//!     .max_size(8)
//!     .acquire_timeout(Duration::from_secs(5))
//!     .endpoint(endpoint)
//!     .build(factory)
//!     .await?;
//!
//! let conn = pool.acquire().await?;
//! // Use connection...
//! conn.release().await;
//!
//! let metrics = pool.metrics();
//! println!("avg acquire latency: {:?}", metrics.avg_acquire_latency);
//!
//! pool.close().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod reaper;
pub mod retry;

// Configuration
pub use config::{CircuitBreakerConfig, Credentials, EndpointConfig, PoolConfig};

// Error types
pub use error::{BoxError, PoolError};

// Pool types
pub use metrics::PoolMetrics;
pub use pool::{ConnectionLease, LeaseHandle, Pool, PoolBuilder, PoolStatus};
pub use reaper::ReapReport;

// Lifecycle management
pub use lifecycle::{
    Connection, ConnectionFactory, InvalidReason, LeaseMetadata, LeaseState, Validation,
};

// Cancellation token accepted by `Pool::acquire_with_cancel`
pub use tokio_util::sync::CancellationToken;
