//! Retry policy for connection creation.
//!
//! [`Backoff`] computes the delay between factory attempts and
//! [`CircuitBreaker`] caps the total retry pressure put on a failing
//! backend across all callers.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

/// Exponential backoff schedule: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a schedule with the given base delay and cap.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to wait after the zero-based `attempt` failed.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Fallback horizon for deadlines that would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + duration`, saturating to a far-future instant on overflow.
pub(crate) fn deadline_after(start: Instant, duration: Duration) -> Instant {
    start
        .checked_add(duration)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Stops connection creation after repeated failures.
///
/// After `failure_threshold` consecutive failed creations the breaker opens
/// for `cooldown`. Once the cooldown elapses creation is allowed again; the
/// next failure re-opens the breaker immediately, the next success closes it.
///
/// Creations that run concurrently count as one failure: [`check`](Self::check)
/// hands out the current failure generation, and a failure reported for a
/// generation that has already been counted is ignored.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    generation: u64,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Check whether creation is currently allowed.
    ///
    /// Returns the failure generation to report back through
    /// [`record_failure`](Self::record_failure), or the remaining cooldown
    /// when the breaker is open.
    pub fn check(&self) -> Result<u64, Duration> {
        let state = self.state.lock();
        match state.open_until {
            Some(until) => {
                let now = Instant::now();
                if now < until {
                    Err(until - now)
                } else {
                    Ok(state.generation)
                }
            }
            None => Ok(state.generation),
        }
    }

    /// Record a successful creation.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.open_until.take().is_some() {
            tracing::info!("connection creation recovered; circuit breaker closed");
        }
        state.consecutive_failures = 0;
    }

    /// Record a creation that exhausted its retries.
    ///
    /// `generation` is the value returned by the [`check`](Self::check) that
    /// admitted the creation.
    pub fn record_failure(&self, generation: u64) {
        let mut state = self.state.lock();
        if generation != state.generation {
            tracing::trace!("creation failure already counted for this wave");
            return;
        }
        state.generation = state.generation.wrapping_add(1);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.config.failure_threshold {
            state.open_until = Some(deadline_after(Instant::now(), self.config.cooldown));
            tracing::warn!(
                failures = state.consecutive_failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "circuit breaker opened for connection creation"
            );
        }
    }

    /// Whether the breaker is currently rejecting creations.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.check().is_err()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        // Overflowing exponents fall back to the cap.
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_base_never_waits() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_recovers() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(10),
        });

        breaker.record_failure(breaker.check().unwrap());
        assert!(breaker.check().is_ok());

        breaker.record_failure(breaker.check().unwrap());
        assert_eq!(breaker.check(), Err(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(breaker.check(), Err(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(6)).await;
        let trial = breaker.check().unwrap();

        // A failed trial re-opens immediately.
        breaker.record_failure(trial);
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(10)).await;
        breaker.record_success();
        assert!(!breaker.is_open());

        breaker.record_failure(breaker.check().unwrap());
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_count_once() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(10),
        });

        let wave: Vec<u64> = (0..5).map(|_| breaker.check().unwrap()).collect();
        for generation in wave {
            breaker.record_failure(generation);
        }
        assert!(!breaker.is_open());

        breaker.record_failure(breaker.check().unwrap());
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_cooldown_does_not_overflow() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::MAX,
        });

        breaker.record_failure(breaker.check().unwrap());
        let remaining = breaker.check().unwrap_err();
        assert!(remaining >= Duration::from_secs(86_400 * 365));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(
            deadline_after(now, Duration::from_secs(1)),
            now + Duration::from_secs(1)
        );
        assert!(deadline_after(now, Duration::MAX) > now + Duration::from_secs(86_400));
    }
}
