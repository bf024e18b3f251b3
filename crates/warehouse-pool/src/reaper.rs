//! Background maintenance task.
//!
//! Every `validation_interval` the reaper drains the idle queue, validates
//! each lease, closes the ones that fail and then tops the pool back up to
//! `min_size`. Checked-out leases are never touched.

use std::sync::Weak;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::lifecycle::{ConnectionFactory, Validation};
use crate::pool::PoolInner;

/// Outcome of a single reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Idle leases validated.
    pub checked: usize,
    /// Leases closed because they failed validation.
    pub evicted: usize,
    /// Connections opened to restore the minimum size.
    pub created: usize,
}

/// Spawn the reaper for a pool on its task tracker.
///
/// The task holds only a weak reference, so it also stops once the last
/// handle to the pool is dropped.
pub(crate) fn spawn<F: ConnectionFactory>(
    pool: Weak<PoolInner<F>>,
    interval: Duration,
    shutdown: CancellationToken,
    tasks: &TaskTracker,
) {
    tasks.spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }

            let Some(pool) = pool.upgrade() else {
                break;
            };
            let report = pool.reap().await;
            if report.evicted > 0 || report.created > 0 {
                tracing::debug!(
                    checked = report.checked,
                    evicted = report.evicted,
                    created = report.created,
                    "reaper pass complete"
                );
            }
        }
        tracing::debug!("pool reaper stopped");
    });
}

impl<F: ConnectionFactory> PoolInner<F> {
    /// Run one pass. Close waits for passes in flight.
    pub(crate) async fn reap(&self) -> ReapReport {
        self.tasks.track_future(self.reap_pass()).await
    }

    async fn reap_pass(&self) -> ReapReport {
        let batch = self.drain_idle();
        let mut report = ReapReport {
            checked: batch.len(),
            ..ReapReport::default()
        };

        for mut lease in batch {
            let validation = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => None,
                validation = self.validate(&mut lease) => Some(validation),
            };
            let Some(validation) = validation else {
                self.destroy(lease).await;
                continue;
            };

            match validation {
                Validation::Valid => {
                    if let Err(lease) = self.requeue(lease) {
                        self.destroy(lease).await;
                    }
                }
                Validation::Invalid(reason) => {
                    tracing::debug!(
                        lease_id = lease.id(),
                        reason = %reason,
                        "evicting idle connection"
                    );
                    self.destroy(lease).await;
                    report.evicted += 1;
                }
            }
        }

        report.created = self.replenish().await;
        report
    }
}
