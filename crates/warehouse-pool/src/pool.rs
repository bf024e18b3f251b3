//! Connection pool implementation.
//!
//! All bookkeeping (the idle queue, the lease registry and the count of
//! in-flight creations) lives behind a single mutex that is never held
//! across a network round trip. Connection creation, validation and close
//! happen outside the lock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::config::{EndpointConfig, PoolConfig};
use crate::error::{BoxError, PoolError};
use crate::lifecycle::{
    Connection, ConnectionFactory, InvalidReason, LeaseMetadata, LeaseState, Validation,
};
use crate::metrics::{MetricsInner, PoolMetrics};
use crate::reaper::{self, ReapReport};
use crate::retry::{Backoff, CircuitBreaker, deadline_after};

/// Deadline for closing a single connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A bounded pool of warehouse connections.
///
/// The pool is constructed once at startup and shared by reference (or by
/// cloning, which is cheap) with every component that needs a connection.
///
/// # Example
///
/// ```rust,ignore
/// use warehouse_pool::{Pool, PoolConfig};
///
/// let pool = Pool::new(PoolConfig::new().min_size(2).max_size(8), factory)?;
/// pool.initialize().await?;
///
/// let mut conn = pool.acquire().await?;
/// conn.execute("SELECT 1").await?;
/// conn.release().await;
///
/// pool.close().await;
/// ```
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    config: PoolConfig,
    factory: F,
    backoff: Backoff,
    breaker: Option<CircuitBreaker>,

    /// Whether the pool is closed. Only flipped while holding `state`.
    closed: AtomicBool,
    initialized: AtomicBool,

    state: Mutex<PoolState<F::Connection>>,

    /// Woken whenever a lease is queued or a slot is freed.
    available: Notify,

    /// Cancelled on close; stops the reaper and interrupts backoff sleeps.
    pub(crate) shutdown: CancellationToken,
    /// Background work (reaper, replenishment, reap passes) awaited by close.
    pub(crate) tasks: TaskTracker,

    created_at: Instant,
    metrics: Mutex<MetricsInner>,
}

struct PoolState<C> {
    /// Leases available for immediate reuse, oldest first.
    idle: VecDeque<ConnectionLease<C>>,
    /// Every connection the pool owns, keyed by lease id.
    registry: HashMap<String, LeaseState>,
    /// Connection creations in flight.
    pending: usize,
}

impl<C> PoolState<C> {
    /// Slots counted against `max_size`.
    fn occupied(&self) -> usize {
        self.registry.len() + self.pending
    }

    fn count(&self, wanted: LeaseState) -> usize {
        self.registry.values().filter(|s| **s == wanted).count()
    }
}

/// A physical connection plus the pool's bookkeeping for it.
pub struct ConnectionLease<C> {
    meta: LeaseMetadata,
    connection: C,
}

impl<C> ConnectionLease<C> {
    fn new(id: String, connection: C) -> Self {
        Self {
            meta: LeaseMetadata::new(id),
            connection,
        }
    }

    /// The lease identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.meta.id
    }

    /// The lease metadata.
    #[must_use]
    pub fn metadata(&self) -> &LeaseMetadata {
        &self.meta
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &C {
        &self.connection
    }
}

impl<C> fmt::Debug for ConnectionLease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

enum Checkout<'a, F: ConnectionFactory> {
    Idle(IdleCheckout<'a, F>),
    Slot(SlotReservation<'a, F>),
    Full { current: usize },
}

/// An idle lease taken off the queue for validation.
///
/// Dropping it (for instance when the acquiring future is cancelled) puts
/// the lease straight back on the idle queue.
struct IdleCheckout<'a, F: ConnectionFactory> {
    pool: &'a PoolInner<F>,
    lease: Option<ConnectionLease<F::Connection>>,
}

impl<F: ConnectionFactory> IdleCheckout<'_, F> {
    fn lease_mut(&mut self) -> Option<&mut ConnectionLease<F::Connection>> {
        self.lease.as_mut()
    }

    fn take(mut self) -> Option<ConnectionLease<F::Connection>> {
        self.lease.take()
    }
}

impl<F: ConnectionFactory> Drop for IdleCheckout<'_, F> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(lease) = self.pool.requeue(lease) {
                self.pool.discard_now(lease);
            }
        }
    }
}

/// A slot reserved against `max_size` for a connection being created.
///
/// The slot is released on drop unless the new connection was registered.
pub(crate) struct SlotReservation<'a, F: ConnectionFactory> {
    pool: &'a PoolInner<F>,
    armed: bool,
}

impl<F: ConnectionFactory> SlotReservation<'_, F> {
    fn settle(mut self, state: &mut PoolState<F::Connection>) {
        state.pending -= 1;
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for SlotReservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().pending -= 1;
            self.pool.available.notify_waiters();
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a pool without opening any connections.
    ///
    /// Call [`initialize`](Self::initialize) to open `min_size` connections
    /// and start the background reaper.
    pub fn new(config: PoolConfig, factory: F) -> Result<Self, PoolError> {
        config.validate()?;

        let backoff = Backoff::new(config.retry_base_delay, config.retry_max_delay);
        let breaker = config.circuit_breaker.map(CircuitBreaker::new);

        tracing::info!(
            min = config.min_size,
            max = config.max_size,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "connection pool created"
        );

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_size),
                registry: HashMap::with_capacity(config.max_size),
                pending: 0,
            }),
            config,
            factory,
            backoff,
            breaker,
            closed: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            available: Notify::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            created_at: Instant::now(),
            metrics: Mutex::new(MetricsInner::default()),
        });

        Ok(Self { inner })
    }

    /// Open `min_size` connections and start the background reaper.
    ///
    /// Individual creation failures are logged and leave the pool running
    /// below its minimum; the reaper keeps trying to restore it. Calling this
    /// more than once has no further effect.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        if inner.initialized.swap(true, Ordering::AcqRel) {
            tracing::debug!("pool already initialized");
            return Ok(());
        }

        let created = inner.replenish().await;
        let min = inner.config.min_size;
        if created < min {
            tracing::warn!(created, min, "pool started below minimum size");
        }

        reaper::spawn(
            Arc::downgrade(inner),
            inner.config.validation_interval,
            inner.shutdown.clone(),
            &inner.tasks,
        );

        tracing::info!(created, min, "connection pool initialized");
        Ok(())
    }

    /// Acquire a connection from the pool.
    ///
    /// Returns an idle connection if one is available, opens a new one if
    /// the pool is below `max_size`, and otherwise waits up to
    /// `acquire_timeout` for a connection to be returned.
    pub async fn acquire(&self) -> Result<LeaseHandle<F>, PoolError> {
        self.acquire_with_cancel(&CancellationToken::new()).await
    }

    /// Acquire a connection, giving up early if `cancel` fires.
    ///
    /// Cancellation is reported as [`PoolError::AcquireCancelled`], distinct
    /// from [`PoolError::PoolExhausted`].
    pub async fn acquire_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<LeaseHandle<F>, PoolError> {
        let started = Instant::now();
        let deadline = deadline_after(started, self.inner.config.acquire_timeout);

        tracing::trace!("acquiring connection from pool");

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PoolError::AcquireCancelled),
            result = self.inner.acquire_inner(started, deadline) => result,
        };

        match &result {
            Ok(handle) => tracing::trace!(
                lease_id = handle.id(),
                wait_us = started.elapsed().as_micros() as u64,
                "acquired connection"
            ),
            Err(e) => {
                self.inner.metrics.lock().failed_acquisitions += 1;
                tracing::debug!(error = %e, "failed to acquire connection");
            }
        }

        result
    }

    /// Acquire a connection without waiting for another caller to release one.
    ///
    /// Returns `Ok(None)` when no idle connection exists and the pool is at
    /// capacity.
    pub async fn try_acquire(&self) -> Result<Option<LeaseHandle<F>>, PoolError> {
        let started = Instant::now();
        match self.inner.acquire_inner(started, started).await {
            Ok(handle) => Ok(Some(handle)),
            Err(PoolError::PoolExhausted { .. }) => Ok(None),
            Err(e) => {
                self.inner.metrics.lock().failed_acquisitions += 1;
                Err(e)
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to [`LeaseHandle::release`].
    pub async fn release(&self, handle: LeaseHandle<F>) {
        handle.release().await;
    }

    /// Run one reaper pass immediately.
    ///
    /// Validates every idle connection, evicts the invalid ones and tops the
    /// pool back up to `min_size`.
    pub async fn run_reaper(&self) -> ReapReport {
        self.inner.reap().await
    }

    /// Close the pool.
    ///
    /// Stops the reaper, closes every idle connection and makes the pool
    /// permanently unusable. Returns once background work has finished, so
    /// connections a reaper pass was validating are closed too. Connections
    /// currently checked out are closed when their handles are released.
    /// Individual close failures are logged and do not interrupt shutdown.
    pub async fn close(&self) {
        let inner = &self.inner;
        let drained: Vec<_> = {
            let mut state = inner.state.lock();
            if inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            state.registry.clear();
            state.idle.drain(..).collect()
        };

        inner.shutdown.cancel();
        inner.available.notify_waiters();

        let count = drained.len();
        join_all(drained.into_iter().map(|mut lease| async move {
            inner.close_connection(&mut lease).await;
        }))
        .await;
        inner.metrics.lock().closed += count as u64;

        inner.tasks.close();
        inner.tasks.wait().await;

        tracing::info!(closed = count, "connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            available: state.idle.len(),
            in_use: state.count(LeaseState::InUse),
            total: state.registry.len(),
            max: self.inner.config.max_size,
        }
    }

    /// Get a snapshot of pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = &self.inner;
        let (current_size, active, idle, pending) = if inner.is_closed() {
            (0, 0, 0, 0)
        } else {
            let state = inner.state.lock();
            (
                state.registry.len(),
                state.count(LeaseState::InUse),
                state.idle.len(),
                state.pending,
            )
        };

        let m = inner.metrics.lock();
        PoolMetrics {
            created: m.created,
            closed: m.closed,
            acquisitions: m.acquisitions,
            releases: m.releases,
            failed_acquisitions: m.failed_acquisitions,
            validation_failures: m.validation_failures,
            expirations: m.expirations,
            avg_acquire_latency: m.avg_acquire_latency(),
            current_size,
            active,
            idle,
            pending,
            uptime: inner.created_at.elapsed(),
        }
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn acquire_inner(
        self: &Arc<Self>,
        started: Instant,
        deadline: Instant,
    ) -> Result<LeaseHandle<F>, PoolError> {
        let mut last_invalid: Option<InvalidReason> = None;
        let mut deadline_passed = false;

        loop {
            // Registered before inspecting the state so a release racing
            // with this check still wakes us.
            let notified = self.available.notified();

            match self.checkout()? {
                Checkout::Idle(mut checkout) => {
                    let validation = match checkout.lease_mut() {
                        Some(lease) => self.validate(lease).await,
                        None => continue,
                    };
                    let Some(lease) = checkout.take() else {
                        continue;
                    };
                    match validation {
                        Validation::Valid => return self.hand_out(lease, started).await,
                        Validation::Invalid(reason) => {
                            self.destroy(lease).await;
                            last_invalid = Some(reason);
                        }
                    }
                }
                Checkout::Slot(reservation) => {
                    return match self.create_connection(reservation).await {
                        Ok(lease) => self.hand_out(lease, started).await,
                        Err(source) => Err(match last_invalid {
                            Some(reason) => PoolError::ValidationFailed {
                                reason,
                                source: Box::new(source),
                            },
                            None => source,
                        }),
                    };
                }
                Checkout::Full { current } => {
                    if deadline_passed {
                        return Err(PoolError::PoolExhausted {
                            current,
                            max: self.config.max_size,
                        });
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        // One last look before giving up.
                        deadline_passed = true;
                    }
                }
            }
        }
    }

    fn checkout(&self) -> Result<Checkout<'_, F>, PoolError> {
        let mut state = self.state.lock();
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        if let Some(lease) = state.idle.pop_front() {
            state
                .registry
                .insert(lease.meta.id.clone(), LeaseState::Validating);
            return Ok(Checkout::Idle(IdleCheckout {
                pool: self,
                lease: Some(lease),
            }));
        }

        if state.occupied() < self.config.max_size {
            state.pending += 1;
            return Ok(Checkout::Slot(SlotReservation {
                pool: self,
                armed: true,
            }));
        }

        Ok(Checkout::Full {
            current: state.occupied(),
        })
    }

    /// Reserve a creation slot while the pool is below `target`.
    fn reserve_below(&self, target: usize) -> Option<SlotReservation<'_, F>> {
        let mut state = self.state.lock();
        if self.is_closed() || state.occupied() >= target.min(self.config.max_size) {
            return None;
        }
        state.pending += 1;
        Some(SlotReservation {
            pool: self,
            armed: true,
        })
    }

    async fn hand_out(
        self: &Arc<Self>,
        mut lease: ConnectionLease<F::Connection>,
        started: Instant,
    ) -> Result<LeaseHandle<F>, PoolError> {
        let tracked = {
            let mut state = self.state.lock();
            match state.registry.get_mut(&lease.meta.id) {
                Some(s) if !self.is_closed() => {
                    *s = LeaseState::InUse;
                    true
                }
                _ => false,
            }
        };
        if !tracked {
            self.destroy(lease).await;
            return Err(PoolError::PoolClosed);
        }

        lease.meta.last_used_at = Instant::now();
        lease.meta.use_count += 1;
        self.metrics.lock().record_acquisition(started.elapsed());

        Ok(LeaseHandle {
            pool: Arc::clone(self),
            lease: Some(lease),
        })
    }

    /// Return a checked-out lease to the pool.
    pub(crate) async fn release_lease(self: &Arc<Self>, mut lease: ConnectionLease<F::Connection>) {
        lease.meta.last_used_at = Instant::now();

        let tracked = {
            let mut state = self.state.lock();
            match state.registry.get_mut(&lease.meta.id) {
                Some(s) if *s == LeaseState::InUse => {
                    *s = LeaseState::Validating;
                    true
                }
                _ => false,
            }
        };
        if !tracked {
            tracing::debug!(
                lease_id = %lease.meta.id,
                "released connection is no longer pooled; closing it"
            );
            self.destroy(lease).await;
            return;
        }

        match self.validate(&mut lease).await {
            Validation::Valid => match self.requeue(lease) {
                Ok(()) => {
                    self.metrics.lock().releases += 1;
                }
                Err(lease) => self.destroy(lease).await,
            },
            Validation::Invalid(reason) => {
                tracing::debug!(
                    lease_id = %lease.meta.id,
                    reason = %reason,
                    "discarding connection on release"
                );
                self.destroy(lease).await;
                self.spawn_replenish();
            }
        }
    }

    /// Validate a lease: age first, then a liveness round trip.
    pub(crate) async fn validate(&self, lease: &mut ConnectionLease<F::Connection>) -> Validation {
        let age = lease.meta.age();
        if age > self.config.idle_timeout {
            self.metrics.lock().expirations += 1;
            tracing::debug!(lease_id = %lease.meta.id, age_ms = age.as_millis() as u64, "connection expired");
            return Validation::Invalid(InvalidReason::Expired { age });
        }

        let reason = match tokio::time::timeout(
            self.config.validation_timeout,
            lease.connection.ping(),
        )
        .await
        {
            Ok(Ok(())) => return Validation::Valid,
            Ok(Err(e)) => InvalidReason::PingFailed(e.to_string()),
            Err(_) => InvalidReason::PingTimedOut,
        };

        self.metrics.lock().validation_failures += 1;
        tracing::warn!(
            lease_id = %lease.meta.id,
            reason = %reason,
            "connection failed validation"
        );
        Validation::Invalid(reason)
    }

    /// Open a connection for a reserved slot, retrying with backoff.
    ///
    /// The returned lease is registered in the `Validating` state; the
    /// caller either hands it out or queues it.
    async fn create_connection(
        &self,
        reservation: SlotReservation<'_, F>,
    ) -> Result<ConnectionLease<F::Connection>, PoolError> {
        let generation = match &self.breaker {
            Some(breaker) => Some(
                breaker
                    .check()
                    .map_err(|retry_after| PoolError::CircuitOpen { retry_after })?,
            ),
            None => None,
        };

        let attempts = self.config.retry_attempts;
        let mut last_error: Option<BoxError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backoff.delay(attempt - 1);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.shutdown.cancelled() => return Err(PoolError::PoolClosed),
                }
            }
            if self.is_closed() {
                return Err(PoolError::PoolClosed);
            }

            let outcome = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Err(PoolError::PoolClosed),
                outcome = self.connect_once() => outcome,
            };
            match outcome {
                Ok(connection) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    return self.register(reservation, connection).await;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "connection attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        if let (Some(breaker), Some(generation)) = (&self.breaker, generation) {
            breaker.record_failure(generation);
        }

        Err(PoolError::ConnectionCreationFailed {
            attempts,
            source: last_error.unwrap_or_else(|| "no connection attempt was made".into()),
        })
    }

    async fn connect_once(&self) -> Result<F::Connection, BoxError> {
        let endpoint: &EndpointConfig = &self.config.endpoint;
        match tokio::time::timeout(self.config.connect_timeout, self.factory.create(endpoint)).await
        {
            Ok(result) => result,
            Err(_) => Err(Box::new(PoolError::Timeout {
                operation: "connect",
                timeout: self.config.connect_timeout,
            })),
        }
    }

    async fn register(
        &self,
        reservation: SlotReservation<'_, F>,
        mut connection: F::Connection,
    ) -> Result<ConnectionLease<F::Connection>, PoolError> {
        let session_id = connection.session_id();

        let id = {
            let mut state = self.state.lock();
            reservation.settle(&mut state);
            if self.is_closed() {
                None
            } else {
                let id = match session_id {
                    Some(id) if !state.registry.contains_key(&id) => id,
                    _ => Uuid::new_v4().to_string(),
                };
                state.registry.insert(id.clone(), LeaseState::Validating);
                Some(id)
            }
        };

        self.metrics.lock().created += 1;

        match id {
            Some(id) => {
                tracing::debug!(lease_id = %id, "opened connection");
                Ok(ConnectionLease::new(id, connection))
            }
            None => {
                if let Err(e) = connection.close().await {
                    tracing::warn!(error = %e, "failed to close connection opened during shutdown");
                }
                self.metrics.lock().closed += 1;
                Err(PoolError::PoolClosed)
            }
        }
    }

    /// Put a validated lease back on the idle queue.
    ///
    /// Hands the lease back if the pool has been closed or no longer tracks it.
    pub(crate) fn requeue(
        &self,
        lease: ConnectionLease<F::Connection>,
    ) -> Result<(), ConnectionLease<F::Connection>> {
        {
            let mut state = self.state.lock();
            if self.is_closed() {
                return Err(lease);
            }
            match state.registry.get_mut(&lease.meta.id) {
                Some(s) => *s = LeaseState::Idle,
                None => return Err(lease),
            }
            state.idle.push_back(lease);
        }
        self.available.notify_waiters();
        Ok(())
    }

    /// Take every idle lease off the queue for validation.
    pub(crate) fn drain_idle(&self) -> Vec<ConnectionLease<F::Connection>> {
        let mut state = self.state.lock();
        if self.is_closed() {
            return Vec::new();
        }
        let drained: Vec<_> = state.idle.drain(..).collect();
        for lease in &drained {
            state
                .registry
                .insert(lease.meta.id.clone(), LeaseState::Validating);
        }
        drained
    }

    /// Remove a lease from the pool and close its connection.
    pub(crate) async fn destroy(&self, mut lease: ConnectionLease<F::Connection>) {
        self.forget(&lease.meta.id);
        self.close_connection(&mut lease).await;
        tracing::debug!(
            lease_id = %lease.meta.id,
            use_count = lease.meta.use_count,
            "closed connection"
        );
    }

    /// Remove a lease from the pool without a close round trip.
    fn discard_now(&self, lease: ConnectionLease<F::Connection>) {
        self.forget(&lease.meta.id);
        tracing::debug!(lease_id = %lease.meta.id, "dropped connection");
    }

    fn forget(&self, id: &str) {
        self.state.lock().registry.remove(id);
        self.metrics.lock().closed += 1;
        self.available.notify_waiters();
    }

    async fn close_connection(&self, lease: &mut ConnectionLease<F::Connection>) {
        match tokio::time::timeout(CLOSE_TIMEOUT, lease.connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                lease_id = %lease.meta.id,
                error = %e,
                "failed to close connection"
            ),
            Err(_) => tracing::warn!(
                lease_id = %lease.meta.id,
                "timed out closing connection"
            ),
        }
    }

    /// Create connections until the pool is back at `min_size`.
    ///
    /// Returns the number of connections added. Failures are logged.
    pub(crate) async fn replenish(&self) -> usize {
        let mut reservations = Vec::new();
        while let Some(reservation) = self.reserve_below(self.config.min_size) {
            reservations.push(reservation);
        }
        if reservations.is_empty() {
            return 0;
        }

        let results = join_all(reservations.into_iter().map(|reservation| async move {
            match self.create_connection(reservation).await {
                Ok(lease) => match self.requeue(lease) {
                    Ok(()) => true,
                    Err(lease) => {
                        self.destroy(lease).await;
                        false
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "failed to restore minimum pool size");
                    false
                }
            }
        }))
        .await;

        results.into_iter().filter(|ok| *ok).count()
    }

    /// Restore `min_size` in the background without blocking the caller.
    fn spawn_replenish(self: &Arc<Self>) {
        let below_min = {
            let state = self.state.lock();
            state.occupied() < self.config.min_size
        };
        if !below_min || self.is_closed() {
            return;
        }

        let pool = Arc::clone(self);
        self.tasks.spawn(async move {
            let created = pool.replenish().await;
            tracing::debug!(created, "replaced discarded connections");
        });
    }
}

/// A connection checked out of the pool.
///
/// Dereferences to the underlying connection. Call
/// [`release`](Self::release) to return it; a handle that is simply dropped
/// is returned in a background task.
pub struct LeaseHandle<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    lease: Option<ConnectionLease<F::Connection>>,
}

impl<F: ConnectionFactory> LeaseHandle<F> {
    fn lease(&self) -> &ConnectionLease<F::Connection> {
        match &self.lease {
            Some(lease) => lease,
            None => unreachable!("lease handle used after release"),
        }
    }

    /// The lease identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.lease().meta.id
    }

    /// The lease metadata as of checkout.
    #[must_use]
    pub fn metadata(&self) -> &LeaseMetadata {
        &self.lease().meta
    }

    /// Return the connection to the pool.
    ///
    /// The connection is validated and either queued for reuse or closed.
    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.release_lease(lease).await;
        }
    }

    /// Take the connection out of the pool for good.
    ///
    /// The pool forgets the connection and frees its slot; closing it
    /// becomes the caller's responsibility.
    pub fn detach(mut self) -> F::Connection {
        match self.lease.take() {
            Some(lease) => {
                self.pool.state.lock().registry.remove(&lease.meta.id);
                self.pool.available.notify_waiters();
                tracing::debug!(lease_id = %lease.meta.id, "connection detached from pool");
                lease.connection
            }
            None => unreachable!("lease handle used after release"),
        }
    }
}

impl<F: ConnectionFactory> Deref for LeaseHandle<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.lease().connection
    }
}

impl<F: ConnectionFactory> DerefMut for LeaseHandle<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.lease {
            Some(lease) => &mut lease.connection,
            None => unreachable!("lease handle used after release"),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for LeaseHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("lease", &self.lease)
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for LeaseHandle<F> {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        tracing::trace!(lease_id = %lease.meta.id, "returning dropped handle to pool");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = Arc::clone(&self.pool);
                runtime.spawn(async move {
                    pool.release_lease(lease).await;
                });
            }
            Err(_) => self.pool.discard_now(lease),
        }
    }
}

/// Builder for creating and initializing a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .min_size(2)
///     .max_size(16)
///     .acquire_timeout(Duration::from_secs(5))
///     .build(factory)
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct PoolBuilder {
    pool_config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_size(mut self, size: usize) -> Self {
        self.pool_config.min_size = size;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_size(mut self, size: usize) -> Self {
        self.pool_config.max_size = size;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.acquire_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Set the reaper interval.
    #[must_use]
    pub fn validation_interval(mut self, interval: Duration) -> Self {
        self.pool_config.validation_interval = interval;
        self
    }

    /// Set the number of creation attempts and the base backoff delay.
    #[must_use]
    pub fn retry(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.pool_config.retry_attempts = attempts;
        self.pool_config.retry_base_delay = base_delay;
        self
    }

    /// Set the warehouse endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.pool_config.endpoint = endpoint;
        self
    }

    /// Build and initialize the pool.
    pub async fn build<F: ConnectionFactory>(self, factory: F) -> Result<Pool<F>, PoolError> {
        let pool = Pool::new(self.pool_config, factory)?;
        pool.initialize().await?;
        Ok(pool)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: usize,
    /// Number of connections currently in use.
    pub in_use: usize,
    /// Total number of connections.
    pub total: usize,
    /// Maximum allowed connections.
    pub max: usize,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;

    struct StubConnection {
        session: Option<String>,
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connection for StubConnection {
        fn session_id(&self) -> Option<String> {
            self.session.clone()
        }

        async fn ping(&mut self) -> Result<(), BoxError> {
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("session terminated".into())
            }
        }

        async fn close(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubFactory {
        created: AtomicUsize,
        fixed_session: Option<String>,
        alive: Arc<AtomicBool>,
    }

    impl StubFactory {
        fn new() -> Self {
            Self {
                alive: Arc::new(AtomicBool::new(true)),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for StubFactory {
        type Connection = StubConnection;

        async fn create(&self, _endpoint: &EndpointConfig) -> Result<StubConnection, BoxError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(StubConnection {
                session: self
                    .fixed_session
                    .clone()
                    .or_else(|| Some(format!("session-{n}"))),
                alive: Arc::clone(&self.alive),
            })
        }
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig::new()
            .min_size(min)
            .max_size(max)
            .acquire_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            available: 5,
            in_use: 5,
            total: 10,
            max: 20,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_status_at_capacity() {
        let status = PoolStatus {
            available: 0,
            in_use: 10,
            total: 10,
            max: 10,
        };
        assert!(status.is_at_capacity());

        let status2 = PoolStatus {
            available: 5,
            in_use: 5,
            total: 10,
            max: 20,
        };
        assert!(!status2.is_at_capacity());
    }

    #[test]
    fn test_builder_fluent() {
        let builder = Pool::<StubFactory>::builder()
            .min_size(5)
            .max_size(50)
            .retry(4, Duration::from_millis(10));

        assert_eq!(builder.pool_config.min_size, 5);
        assert_eq!(builder.pool_config.max_size, 50);
        assert_eq!(builder.pool_config.retry_attempts, 4);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = Pool::new(config(3, 2), StubFactory::new()).unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[tokio::test]
    async fn test_lease_id_prefers_session_id() {
        let pool = Pool::new(config(1, 2), StubFactory::new()).unwrap();
        pool.initialize().await.unwrap();

        let handle = pool.acquire().await.unwrap();
        assert_eq!(handle.id(), "session-0");
        assert_eq!(handle.metadata().use_count, 1);
        handle.release().await;
        pool.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_session_ids_fall_back_to_uuid() {
        let factory = StubFactory {
            fixed_session: Some("shared".into()),
            ..StubFactory::new()
        };
        let pool = Pool::new(config(2, 2), factory).unwrap();
        pool.initialize().await.unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id() == "shared" || b.id() == "shared");
        assert!(Uuid::parse_str(a.id()).is_ok() || Uuid::parse_str(b.id()).is_ok());

        a.release().await;
        b.release().await;
        pool.close().await;
    }

    #[tokio::test]
    async fn test_detach_frees_slot() {
        let pool = Pool::new(config(1, 1), StubFactory::new()).unwrap();
        pool.initialize().await.unwrap();

        let handle = pool.acquire().await.unwrap();
        let _conn = handle.detach();
        assert_eq!(pool.status().total, 0);

        // The freed slot can be used straight away.
        let again = pool.try_acquire().await.unwrap().expect("slot freed by detach");
        again.release().await;
        pool.close().await;
    }

    #[test]
    fn test_handle_dropped_outside_runtime_frees_slot() {
        let pool = Pool::new(config(1, 1), StubFactory::new()).unwrap();
        let handle = tokio_test::block_on(pool.acquire()).unwrap();
        assert_eq!(pool.status().in_use, 1);

        drop(handle);
        assert_eq!(pool.status().total, 0);
        assert_eq!(pool.metrics().closed, 1);
    }

    #[tokio::test]
    async fn test_idle_checkout_requeues_on_drop() {
        let pool = Pool::new(config(1, 1), StubFactory::new()).unwrap();
        pool.initialize().await.unwrap();

        match pool.inner.checkout().unwrap() {
            Checkout::Idle(checkout) => drop(checkout),
            _ => panic!("expected an idle lease"),
        }

        let status = pool.status();
        assert_eq!(status.available, 1);
        assert_eq!(status.total, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_abandoned_reservation_frees_slot() {
        let pool = Pool::new(config(1, 1), StubFactory::new()).unwrap();

        match pool.inner.checkout().unwrap() {
            Checkout::Slot(reservation) => {
                assert_eq!(pool.metrics().pending, 1);
                drop(reservation);
            }
            _ => panic!("expected a creation slot"),
        }
        assert_eq!(pool.metrics().pending, 0);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_replaced_on_acquire() {
        let factory = StubFactory::new();
        let alive = Arc::clone(&factory.alive);
        let pool = Pool::new(config(1, 1), factory).unwrap();
        pool.initialize().await.unwrap();

        alive.store(false, Ordering::SeqCst);
        let handle = pool.acquire().await.unwrap();
        assert_eq!(handle.id(), "session-1");

        let metrics = pool.metrics();
        assert_eq!(metrics.validation_failures, 1);
        assert_eq!(metrics.created, 2);
        assert_eq!(metrics.closed, 1);

        drop(handle);
        pool.close().await;
    }
}
