//! # warehouse-testing
//!
//! In-memory stand-ins for a warehouse driver, used to exercise the pool
//! without a live service.
//!
//! [`MockFactory`] hands out [`MockConnection`]s and can be scripted to fail
//! creations, kill sessions or slow down round trips. Every clone of a
//! factory shares the same script and the same call log, so a test keeps a
//! clone after moving the original into the pool.
//!
//! ```rust,ignore
//! let factory = MockFactory::new();
//! let pool = Pool::new(config, factory.clone())?;
//! pool.initialize().await?;
//!
//! factory.kill_all();
//! pool.run_reaper().await;
//! assert_eq!(factory.create_calls(), 2);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use warehouse_pool::{BoxError, Connection, ConnectionFactory, EndpointConfig};

/// Errors raised by mock sessions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockError {
    /// The factory was scripted to fail.
    #[error("warehouse unavailable")]
    Unavailable,

    /// The session was killed by the test.
    #[error("session {0} terminated")]
    SessionTerminated(String),

    /// The session was used after close.
    #[error("session {0} already closed")]
    Closed(String),
}

#[derive(Debug, Default)]
struct Script {
    next_session: AtomicU64,
    create_calls: AtomicU64,
    ping_calls: AtomicU64,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
    create_delay: Mutex<Duration>,
    ping_delay: Mutex<Duration>,
    dead: Mutex<HashSet<String>>,
    close_calls: Mutex<HashMap<String, u32>>,
    endpoints: Mutex<Vec<EndpointConfig>>,
}

/// A scriptable connection factory.
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    script: Arc<Script>,
}

impl MockFactory {
    /// Create a factory that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` creations, then succeed again.
    pub fn fail_next(&self, count: u32) {
        self.script.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every creation until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.script.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every creation by `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.script.create_delay.lock() = delay;
    }

    /// Delay every ping by `delay`.
    pub fn set_ping_delay(&self, delay: Duration) {
        *self.script.ping_delay.lock() = delay;
    }

    /// Make the session with the given id fail its pings and queries.
    pub fn kill(&self, session_id: &str) {
        self.script.dead.lock().insert(session_id.to_string());
    }

    /// Kill every session opened so far.
    pub fn kill_all(&self) {
        let opened = self.script.next_session.load(Ordering::SeqCst);
        let mut dead = self.script.dead.lock();
        for n in 0..opened {
            dead.insert(session_name(n));
        }
    }

    /// Number of times `create` was called.
    #[must_use]
    pub fn create_calls(&self) -> u64 {
        self.script.create_calls.load(Ordering::SeqCst)
    }

    /// Number of sessions successfully opened.
    #[must_use]
    pub fn sessions_opened(&self) -> u64 {
        self.script.next_session.load(Ordering::SeqCst)
    }

    /// Number of times `ping` was called on any session.
    #[must_use]
    pub fn ping_calls(&self) -> u64 {
        self.script.ping_calls.load(Ordering::SeqCst)
    }

    /// Number of times `close` was called for a session.
    #[must_use]
    pub fn close_calls(&self, session_id: &str) -> u32 {
        self.script
            .close_calls
            .lock()
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct sessions that have been closed.
    #[must_use]
    pub fn sessions_closed(&self) -> usize {
        self.script.close_calls.lock().len()
    }

    /// Whether any session was closed more than once.
    #[must_use]
    pub fn any_double_close(&self) -> bool {
        self.script.close_calls.lock().values().any(|n| *n > 1)
    }

    /// Endpoints passed to `create`, in call order.
    #[must_use]
    pub fn endpoints_seen(&self) -> Vec<EndpointConfig> {
        self.script.endpoints.lock().clone()
    }
}

fn session_name(n: u64) -> String {
    format!("wh-session-{n}")
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn create(&self, endpoint: &EndpointConfig) -> Result<MockConnection, BoxError> {
        let script = &self.script;
        script.create_calls.fetch_add(1, Ordering::SeqCst);
        script.endpoints.lock().push(endpoint.clone());

        let delay = *script.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if script.unavailable.load(Ordering::SeqCst) {
            return Err(Box::new(MockError::Unavailable));
        }
        let scripted_failure = script
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(Box::new(MockError::Unavailable));
        }

        let id = session_name(script.next_session.fetch_add(1, Ordering::SeqCst));
        tracing::trace!(session_id = %id, "mock session opened");
        Ok(MockConnection {
            id,
            script: Arc::clone(script),
            closed: false,
            statements: 0,
        })
    }
}

/// A session handed out by [`MockFactory`].
#[derive(Debug)]
pub struct MockConnection {
    id: String,
    script: Arc<Script>,
    closed: bool,
    statements: u64,
}

impl MockConnection {
    /// The session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run a statement, returning the number of statements run on this session.
    pub async fn execute(&mut self, _sql: &str) -> Result<u64, MockError> {
        self.check_usable()?;
        self.statements += 1;
        Ok(self.statements)
    }

    fn check_usable(&self) -> Result<(), MockError> {
        if self.closed {
            return Err(MockError::Closed(self.id.clone()));
        }
        if self.script.dead.lock().contains(&self.id) {
            return Err(MockError::SessionTerminated(self.id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn session_id(&self) -> Option<String> {
        Some(self.id.clone())
    }

    async fn ping(&mut self) -> Result<(), BoxError> {
        self.script.ping_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.ping_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_usable()?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        *self
            .script
            .close_calls
            .lock()
            .entry(self.id.clone())
            .or_insert(0) += 1;
        if self.closed {
            return Err(Box::new(MockError::Closed(self.id.clone())));
        }
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let factory = MockFactory::new();
        factory.fail_next(2);
        let endpoint = EndpointConfig::default();

        assert!(factory.create(&endpoint).await.is_err());
        assert!(factory.create(&endpoint).await.is_err());
        let conn = factory.create(&endpoint).await.unwrap();

        assert_eq!(conn.id(), "wh-session-0");
        assert_eq!(factory.create_calls(), 3);
        assert_eq!(factory.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_killed_session_fails_ping_and_queries() {
        let factory = MockFactory::new();
        let mut conn = factory.create(&EndpointConfig::default()).await.unwrap();
        assert_eq!(conn.execute("SELECT 1").await.unwrap(), 1);

        factory.kill(conn.id());
        assert!(conn.ping().await.is_err());
        assert_eq!(
            conn.execute("SELECT 1").await,
            Err(MockError::SessionTerminated("wh-session-0".into()))
        );
    }

    #[tokio::test]
    async fn test_close_is_recorded() {
        let factory = MockFactory::new();
        let mut conn = factory.create(&EndpointConfig::default()).await.unwrap();

        conn.close().await.unwrap();
        assert_eq!(factory.close_calls("wh-session-0"), 1);
        assert!(!factory.any_double_close());

        assert!(conn.close().await.is_err());
        assert!(factory.any_double_close());
    }
}
