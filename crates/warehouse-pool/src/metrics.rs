//! Pool metrics.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Internal counters, updated once per state transition.
#[derive(Debug, Default)]
pub(crate) struct MetricsInner {
    pub(crate) created: u64,
    pub(crate) closed: u64,
    pub(crate) acquisitions: u64,
    pub(crate) releases: u64,
    pub(crate) failed_acquisitions: u64,
    pub(crate) validation_failures: u64,
    pub(crate) expirations: u64,
    pub(crate) total_acquire_latency: Duration,
}

impl MetricsInner {
    pub(crate) fn record_acquisition(&mut self, latency: Duration) {
        self.acquisitions += 1;
        self.total_acquire_latency = self.total_acquire_latency.saturating_add(latency);
    }

    pub(crate) fn avg_acquire_latency(&self) -> Duration {
        if self.acquisitions == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_acquire_latency.as_nanos() / u128::from(self.acquisitions);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Point-in-time view of pool activity.
///
/// Counters are monotonic for the life of the pool; gauges reflect the
/// moment the snapshot was taken and drop to zero once the pool is closed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PoolMetrics {
    /// Connections opened.
    pub created: u64,
    /// Connections destroyed.
    pub closed: u64,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Leases returned to the idle queue.
    pub releases: u64,
    /// Acquisitions that failed (exhausted, cancelled, closed, creation failed).
    ///
    /// A `try_acquire` that finds the pool full returns `Ok(None)` and is not
    /// counted here; its other failures are.
    pub failed_acquisitions: u64,
    /// Liveness checks that failed.
    pub validation_failures: u64,
    /// Leases evicted for exceeding the idle timeout.
    pub expirations: u64,
    /// Mean time from `acquire` call to lease hand-out.
    pub avg_acquire_latency: Duration,
    /// Connections currently registered with the pool.
    pub current_size: usize,
    /// Leases checked out by callers.
    pub active: usize,
    /// Leases waiting in the idle queue.
    pub idle: usize,
    /// Connection creations in flight.
    pub pending: usize,
    /// Time since the pool was constructed.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Fraction of acquire calls that succeeded (0.0 to 1.0).
    #[must_use]
    pub fn acquisition_success_rate(&self) -> f64 {
        let total = self.acquisitions + self.failed_acquisitions;
        if total == 0 {
            return 1.0;
        }
        self.acquisitions as f64 / total as f64
    }

    /// Fraction of checked-out-and-returned leases that passed validation.
    #[must_use]
    pub fn validation_success_rate(&self) -> f64 {
        let total = self.releases + self.validation_failures;
        if total == 0 {
            return 1.0;
        }
        self.releases as f64 / total as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn snapshot() -> PoolMetrics {
        PoolMetrics {
            created: 10,
            closed: 2,
            acquisitions: 90,
            releases: 95,
            failed_acquisitions: 10,
            validation_failures: 5,
            expirations: 1,
            avg_acquire_latency: Duration::from_millis(3),
            current_size: 8,
            active: 3,
            idle: 5,
            pending: 0,
            uptime: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_running_average() {
        let mut inner = MetricsInner::default();
        assert_eq!(inner.avg_acquire_latency(), Duration::ZERO);

        inner.record_acquisition(Duration::from_millis(10));
        inner.record_acquisition(Duration::from_millis(30));
        assert_eq!(inner.acquisitions, 2);
        assert_eq!(inner.avg_acquire_latency(), Duration::from_millis(20));
    }

    #[test]
    fn test_success_rates() {
        let metrics = snapshot();
        assert!((metrics.acquisition_success_rate() - 0.9).abs() < f64::EPSILON);
        assert!((metrics.validation_success_rate() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_rates_are_perfect() {
        let mut metrics = snapshot();
        metrics.acquisitions = 0;
        metrics.failed_acquisitions = 0;
        metrics.releases = 0;
        metrics.validation_failures = 0;
        assert!((metrics.acquisition_success_rate() - 1.0).abs() < f64::EPSILON);
        assert!((metrics.validation_success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(json["created"], 10);
        assert_eq!(json["current_size"], 8);
    }
}
