//! Core object pool implementation
//!
//! All bookkeeping (idle store, allocation queue, counters, configuration)
//! sits behind one pool-wide lock. Factory callbacks always run with that
//! lock released; their results are merged back under a fresh acquisition.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{ExhaustionPolicy, PoolConfig};
use crate::errors::{PoolError, PoolResult};
use crate::factory::{BoxError, ObjectFactory};
use crate::health::HealthStatus;
use crate::idle::{EvictionCursor, IdleEntry, IdleStore};
use crate::latch::{CancelToken, Grant, Latch, Wake};
use crate::metrics::{MetricsExporter, MetricsTracker, Occupancy, PoolMetrics};
use crate::scheduler::{ScheduleHandle, Scheduler, Task, ThreadScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Open,
    Closing,
    Closed,
}

/// Where an object being parked is accounted before it turns idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Counted in `num_active`
    Borrowed,
    /// Counted in `num_in_flight`
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parked {
    Idle,
    Discarded,
    Closed,
}

/// Everything guarded by the pool lock
pub(crate) struct PoolState<T> {
    pub config: PoolConfig,
    pub idle: IdleStore<T>,
    pub queue: VecDeque<Arc<Latch<T>>>,
    pub num_active: usize,
    pub num_in_flight: usize,
    pub lifecycle: Lifecycle,
    pub cursor: EvictionCursor,
}

impl<T> PoolState<T> {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: IdleStore::new(),
            queue: VecDeque::new(),
            num_active: 0,
            num_in_flight: 0,
            lifecycle: Lifecycle::Open,
            cursor: EvictionCursor::default(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle != Lifecycle::Open
    }

    /// Hand idle objects, then creation permits, to queued borrowers in
    /// arrival order.
    pub fn allocate(&mut self) {
        if self.is_closed() {
            return;
        }

        while !self.queue.is_empty() && !self.idle.is_empty() {
            if let (Some(latch), Some(entry)) = (self.queue.pop_front(), self.idle.pop_front()) {
                self.num_in_flight += 1;
                latch.grant(Grant::Idle(entry));
            }
        }

        while !self.queue.is_empty() && self.below_capacity() {
            if let Some(latch) = self.queue.pop_front() {
                self.num_in_flight += 1;
                latch.grant(Grant::Create);
            }
        }
    }

    fn below_capacity(&self) -> bool {
        self.config
            .capacity()
            .is_none_or(|capacity| self.num_active + self.num_in_flight < capacity)
    }

    /// Objects that may still be added before `active + idle + in_flight`
    /// reaches capacity; `None` when unbounded.
    pub fn headroom(&self) -> Option<usize> {
        self.config.capacity().map(|capacity| {
            capacity.saturating_sub(self.num_active + self.idle.len() + self.num_in_flight)
        })
    }

    /// Idle objects missing to reach `min_idle`, within capacity
    pub fn idle_deficit(&self) -> usize {
        let wanted = self.config.min_idle.saturating_sub(self.idle.len());
        self.headroom().map_or(wanted, |room| wanted.min(room))
    }

    fn remove_request(&mut self, latch: &Arc<Latch<T>>) {
        if let Some(pos) = self.queue.iter().position(|queued| Arc::ptr_eq(queued, latch)) {
            self.queue.remove(pos);
        }
    }

    fn idle_full(&self) -> bool {
        self.config.max_idle.is_some_and(|max| self.idle.len() >= max)
    }

    /// Borrowers take from the front, so LIFO parks there and FIFO at the back
    fn park(&mut self, value: T) {
        let entry = IdleEntry::new(value);
        if self.config.lifo {
            self.idle.push_front(entry);
        } else {
            self.idle.push_back(entry);
        }
    }

    fn release(&mut self, origin: Origin) {
        match origin {
            Origin::Borrowed => self.num_active -= 1,
            Origin::Reserved => self.num_in_flight -= 1,
        }
    }

    pub(crate) fn occupancy(&self) -> Occupancy {
        Occupancy {
            active: self.num_active,
            idle: self.idle.len(),
            in_flight: self.num_in_flight,
            waiting: self.queue.len(),
            capacity: self.config.capacity(),
        }
    }
}

/// A counted slot held across factory callbacks
///
/// Dropping the guard, including while unwinding from a panicking callback,
/// gives the slot back and re-runs the allocator. [`settle`](Self::settle)
/// disarms it once the caller has accounted for the slot itself.
#[must_use]
pub(crate) struct SlotGuard<'a, F: ObjectFactory> {
    pool: &'a PoolInner<F>,
    origin: Origin,
}

impl<'a, F: ObjectFactory> SlotGuard<'a, F> {
    pub fn new(pool: &'a PoolInner<F>, origin: Origin) -> Self {
        Self { pool, origin }
    }

    pub fn settle(self) {
        std::mem::forget(self);
    }
}

impl<F: ObjectFactory> Drop for SlotGuard<'_, F> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.release(self.origin);
        state.allocate();
    }
}

pub(crate) struct PoolInner<F: ObjectFactory> {
    pub factory: F,
    pub state: Mutex<PoolState<F::Object>>,
    pub metrics: MetricsTracker,
    evictor: Mutex<Option<Box<dyn ScheduleHandle>>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<F: ObjectFactory> PoolInner<F> {
    /// Destroy an object whose destruction nobody is waiting on
    pub fn destroy_quietly(&self, value: F::Object) {
        MetricsTracker::incr(&self.metrics.destroyed);
        if let Err(e) = self.factory.destroy(value) {
            tracing::debug!(error = %e, "failed to destroy pooled object, ignoring");
        }
    }

    fn check_out(&self, value: &mut F::Object, test_on_borrow: bool) -> Result<(), BoxError> {
        self.factory.activate(value)?;
        if test_on_borrow && !self.factory.validate(value) {
            return Err("object failed validation".into());
        }
        Ok(())
    }

    /// Return an object to the idle store, or destroy it when it fails
    /// validation, the store is full, or the pool is closed.
    pub fn give_back(&self, mut value: F::Object, origin: Origin) -> Parked {
        let slot = SlotGuard::new(self, origin);
        let test_on_return = self.state.lock().config.test_on_return;
        let usable = if test_on_return && !self.factory.validate(&value) {
            false
        } else if let Err(e) = self.factory.passivate(&mut value) {
            tracing::debug!(error = %e, "failed to passivate object, destroying it");
            false
        } else {
            true
        };
        if !usable {
            MetricsTracker::incr(&self.metrics.validation_failures);
        }

        let rejected = {
            let mut state = self.state.lock();
            if state.is_closed() {
                Some((value, Parked::Closed))
            } else if !usable || state.idle_full() {
                Some((value, Parked::Discarded))
            } else {
                state.park(value);
                state.release(origin);
                state.allocate();
                None
            }
        };

        match rejected {
            None => {
                slot.settle();
                Parked::Idle
            }
            Some((value, outcome)) => {
                self.destroy_quietly(value);
                drop(slot);
                outcome
            }
        }
    }

    fn invalidate(&self, value: F::Object) -> PoolResult<()> {
        let _slot = SlotGuard::new(self, Origin::Borrowed);
        MetricsTracker::incr(&self.metrics.destroyed);
        self.factory.destroy(value).map_err(PoolError::DestroyFailed)
    }

    /// Undo a borrow request that will not complete, whatever it holds now
    fn release_request(&self, latch: &Arc<Latch<F::Object>>) {
        let reclaimed = {
            let mut state = self.state.lock();
            match latch.take() {
                None => {
                    state.remove_request(latch);
                    None
                }
                Some(Grant::Create) => {
                    state.num_in_flight -= 1;
                    state.allocate();
                    None
                }
                Some(Grant::Idle(entry)) => {
                    state.num_in_flight -= 1;
                    state.num_active += 1;
                    Some(entry.value)
                }
            }
        };
        if let Some(value) = reclaimed {
            self.give_back(value, Origin::Borrowed);
        }
    }

    /// Create one object against an in-flight slot already reserved by the
    /// caller and park it idle.
    pub fn create_reserved(&self) -> PoolResult<Parked> {
        let slot = SlotGuard::new(self, Origin::Reserved);
        let value = self.factory.create().map_err(PoolError::CreateFailed)?;
        MetricsTracker::incr(&self.metrics.created);
        // give_back takes over the in-flight slot
        slot.settle();
        Ok(self.give_back(value, Origin::Reserved))
    }

    pub fn clear(&self) {
        let drained = {
            let mut state = self.state.lock();
            let drained = state.idle.drain();
            state.num_in_flight += drained.len();
            state.cursor = EvictionCursor::default();
            drained
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "destroying idle objects");
        }
        let pending: Vec<_> = drained
            .into_iter()
            .map(|entry| (entry, SlotGuard::new(self, Origin::Reserved)))
            .collect();
        for (entry, slot) in pending {
            self.destroy_quietly(entry.value);
            drop(slot);
        }
    }

    fn start_evictor(self: &Arc<Self>, period: Option<Duration>) {
        let mut slot = self.evictor.lock();
        if let Some(handle) = slot.take() {
            handle.cancel();
        }
        // close() may have stopped the evictor since the caller looked
        if self.state.lock().is_closed() {
            return;
        }
        if let Some(period) = period {
            let pool = Arc::downgrade(self);
            let task: Task = Arc::new(move || {
                if let Some(pool) = pool.upgrade() {
                    pool.run_eviction_tick();
                }
            });
            *slot = Some(self.scheduler.schedule(period, task));
            tracing::debug!(?period, "evictor scheduled");
        }
    }

    fn stop_evictor(&self) {
        if let Some(handle) = self.evictor.lock().take() {
            handle.cancel();
        }
    }
}

impl<F: ObjectFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.evictor.get_mut().take() {
            handle.cancel();
        }
        for entry in self.state.get_mut().idle.drain() {
            if let Err(e) = self.factory.destroy(entry.value) {
                tracing::debug!(error = %e, "failed to destroy idle object on drop");
            }
        }
    }
}

/// A borrowed object that goes back to the pool when dropped
///
/// Returning consumes the guard, so an object cannot be returned twice.
pub struct PooledObject<F: ObjectFactory> {
    value: Option<F::Object>,
    pool: Arc<PoolInner<F>>,
}

impl<F: ObjectFactory> PooledObject<F> {
    fn new(value: F::Object, pool: Arc<PoolInner<F>>) -> Self {
        Self {
            value: Some(value),
            pool,
        }
    }

    /// Destroy the object instead of returning it; use when it is known to
    /// be broken.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::DestroyFailed`] if the factory could not destroy
    /// it. The object leaves the pool either way.
    pub fn invalidate(mut self) -> PoolResult<()> {
        match self.value.take() {
            Some(value) => self.pool.invalidate(value),
            None => Ok(()),
        }
    }

    /// Take the object out of the pool for good. Its capacity slot is freed
    /// and the factory never sees it again.
    pub fn detach(mut self) -> F::Object {
        let value = self.value.take().expect("Value already taken");
        let mut state = self.pool.state.lock();
        state.num_active -= 1;
        state.allocate();
        value
    }
}

impl<F: ObjectFactory> Deref for PooledObject<F> {
    type Target = F::Object;

    fn deref(&self) -> &Self::Target {
        self.value.as_ref().expect("Value already taken")
    }
}

impl<F: ObjectFactory> DerefMut for PooledObject<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value.as_mut().expect("Value already taken")
    }
}

impl<F: ObjectFactory> Drop for PooledObject<F> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            MetricsTracker::incr(&self.pool.metrics.returned);
            self.pool.give_back(value, Origin::Borrowed);
        }
    }
}

impl<F> fmt::Debug for PooledObject<F>
where
    F: ObjectFactory,
    F::Object: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledObject").field(&self.value).finish()
    }
}

/// Thread-safe pool of objects produced by an [`ObjectFactory`]
///
/// Cloning is cheap and yields another handle to the same pool.
///
/// # Examples
///
/// ```
/// use generic_objectpool::{ExhaustionPolicy, FnFactory, ObjectPool, PoolConfig, PoolError};
///
/// let config = PoolConfig::new()
///     .with_max_active(1)
///     .with_exhaustion_policy(ExhaustionPolicy::Fail);
/// let pool = ObjectPool::new(FnFactory::new(|| vec![0u8; 16]), config).unwrap();
///
/// let buf = pool.borrow().unwrap();
/// assert!(matches!(pool.borrow(), Err(PoolError::Exhausted)));
///
/// drop(buf);
/// assert_eq!(pool.num_idle(), 1);
/// ```
pub struct ObjectPool<F: ObjectFactory> {
    pub(crate) inner: Arc<PoolInner<F>>,
}

impl<F: ObjectFactory> Clone for ObjectPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ObjectFactory> fmt::Debug for ObjectPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ObjectPool")
            .field("active", &state.num_active)
            .field("idle", &state.idle.len())
            .field("in_flight", &state.num_in_flight)
            .field("waiting", &state.queue.len())
            .field("lifecycle", &state.lifecycle)
            .finish()
    }
}

impl<F: ObjectFactory> ObjectPool<F> {
    /// Create a pool whose evictor, if enabled, runs on a background thread
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if `config` does not validate.
    pub fn new(factory: F, config: PoolConfig) -> PoolResult<Self> {
        Self::with_scheduler(factory, config, Arc::new(ThreadScheduler::new()))
    }

    /// Create a pool whose evictor runs on the given scheduler
    pub fn with_scheduler(
        factory: F,
        config: PoolConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> PoolResult<Self> {
        config.validate()?;
        let period = config.eviction_period();
        tracing::debug!(
            max_active = ?config.capacity(),
            max_idle = ?config.max_idle,
            min_idle = config.min_idle,
            policy = %config.exhaustion_policy,
            lifo = config.lifo,
            "creating object pool"
        );

        let inner = Arc::new(PoolInner {
            factory,
            state: Mutex::new(PoolState::new(config)),
            metrics: MetricsTracker::new(),
            evictor: Mutex::new(None),
            scheduler,
        });
        inner.start_evictor(period);
        Ok(Self { inner })
    }

    /// Borrow an object, creating one if allowed
    ///
    /// When the pool is exhausted the configured [`ExhaustionPolicy`]
    /// decides between failing, waiting up to `max_wait`, or growing past
    /// `max_active`. Waiting borrowers are served in arrival order.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`], [`PoolError::Timeout`], [`PoolError::Closed`],
    /// [`PoolError::CreateFailed`] or [`PoolError::ValidationFailed`].
    pub fn borrow(&self) -> PoolResult<PooledObject<F>> {
        self.borrow_inner(None)
    }

    /// Like [`borrow`](Self::borrow), but a blocked wait can be interrupted
    /// through `token`, failing with [`PoolError::Interrupted`].
    pub fn borrow_with_cancel(&self, token: &CancelToken) -> PoolResult<PooledObject<F>> {
        self.borrow_inner(Some(token))
    }

    /// Borrow from async code; the blocking protocol runs on tokio's
    /// blocking thread pool.
    pub async fn borrow_async(&self) -> PoolResult<PooledObject<F>> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.borrow())
            .await
            .map_err(|_| PoolError::Interrupted)?
    }

    fn borrow_inner(&self, cancel: Option<&CancelToken>) -> PoolResult<PooledObject<F>> {
        let started = Instant::now();
        let latch = Latch::new();

        let (policy, max_wait, test_on_borrow) = {
            let mut state = self.inner.state.lock();
            if state.is_closed() {
                return Err(PoolError::Closed);
            }
            state.queue.push_back(Arc::clone(&latch));
            state.allocate();
            (
                state.config.exhaustion_policy,
                state.config.wait_bound(),
                state.config.test_on_borrow,
            )
        };
        let deadline = max_wait.and_then(|wait| started.checked_add(wait));
        let _registration = cancel.map(|token| token.register(Arc::clone(&latch)));

        loop {
            if self.inner.state.lock().is_closed() {
                self.inner.release_request(&latch);
                return Err(PoolError::Closed);
            }

            let grant = match latch.take() {
                Some(grant) => grant,
                None => match policy {
                    ExhaustionPolicy::Fail => {
                        let mut state = self.inner.state.lock();
                        match latch.take() {
                            Some(grant) => grant,
                            None => {
                                state.remove_request(&latch);
                                drop(state);
                                MetricsTracker::incr(&self.inner.metrics.exhausted);
                                return Err(PoolError::Exhausted);
                            }
                        }
                    }
                    ExhaustionPolicy::Grow => {
                        let mut state = self.inner.state.lock();
                        match latch.take() {
                            Some(grant) => grant,
                            None => {
                                state.remove_request(&latch);
                                state.num_in_flight += 1;
                                Grant::Create
                            }
                        }
                    }
                    ExhaustionPolicy::Block => match latch.wait(deadline) {
                        Wake::Granted | Wake::Closed => continue,
                        Wake::Interrupted => {
                            self.inner.release_request(&latch);
                            return Err(PoolError::Interrupted);
                        }
                        Wake::TimedOut => {
                            let mut state = self.inner.state.lock();
                            if latch.is_granted() {
                                continue;
                            }
                            state.remove_request(&latch);
                            drop(state);
                            MetricsTracker::incr(&self.inner.metrics.timeouts);
                            return Err(PoolError::Timeout(max_wait.unwrap_or_default()));
                        }
                    },
                },
            };

            let slot = SlotGuard::new(&self.inner, Origin::Reserved);
            let (mut value, created) = match grant {
                Grant::Idle(entry) => (entry.value, false),
                Grant::Create => {
                    let value = self.inner.factory.create().map_err(PoolError::CreateFailed)?;
                    MetricsTracker::incr(&self.inner.metrics.created);
                    (value, true)
                }
            };

            match self.inner.check_out(&mut value, test_on_borrow) {
                Ok(()) => {
                    slot.settle();
                    let mut state = self.inner.state.lock();
                    state.num_in_flight -= 1;
                    state.num_active += 1;
                    drop(state);
                    MetricsTracker::incr(&self.inner.metrics.borrowed);
                    return Ok(PooledObject::new(value, Arc::clone(&self.inner)));
                }
                Err(cause) => {
                    MetricsTracker::incr(&self.inner.metrics.validation_failures);
                    self.inner.destroy_quietly(value);
                    slot.settle();
                    let mut state = self.inner.state.lock();
                    state.num_in_flight -= 1;
                    if created {
                        state.allocate();
                        return Err(PoolError::ValidationFailed(cause));
                    }
                    tracing::debug!(error = %cause, "idle object failed activation, trying the next one");
                    if !state.is_closed() {
                        state.queue.push_front(Arc::clone(&latch));
                    }
                    state.allocate();
                }
            }
        }
    }

    /// Create an object and add it to the idle store, e.g. to pre-fill the pool
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] after close, [`PoolError::Exhausted`] when the
    /// pool is at capacity, or [`PoolError::CreateFailed`].
    pub fn add_object(&self) -> PoolResult<()> {
        {
            let mut state = self.inner.state.lock();
            if state.is_closed() {
                return Err(PoolError::Closed);
            }
            if state.headroom() == Some(0) {
                return Err(PoolError::Exhausted);
            }
            state.num_in_flight += 1;
        }
        match self.inner.create_reserved()? {
            Parked::Closed => Err(PoolError::Closed),
            Parked::Idle | Parked::Discarded => Ok(()),
        }
    }

    /// Destroy every idle object
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Close the pool: destroy idle objects, stop the evictor and fail every
    /// waiting borrower with [`PoolError::Closed`]. Objects still borrowed
    /// are destroyed when returned. Closing twice is a no-op.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Open {
                return;
            }
            state.lifecycle = Lifecycle::Closing;
        }

        self.inner.clear();
        self.inner.stop_evictor();

        let waiting: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.lifecycle = Lifecycle::Closed;
            state.queue.drain(..).collect()
        };
        for latch in &waiting {
            latch.close();
        }
        tracing::debug!(woken = waiting.len(), "object pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().is_closed()
    }

    /// Objects currently borrowed
    pub fn num_active(&self) -> usize {
        self.inner.state.lock().num_active
    }

    /// Objects currently idle
    pub fn num_idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Objects or creation permits granted but not yet resolved
    pub fn num_in_flight(&self) -> usize {
        self.inner.state.lock().num_in_flight
    }

    /// Borrowers waiting in the allocation queue
    pub fn num_waiters(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> PoolConfig {
        self.inner.state.lock().config.clone()
    }

    /// Replace the configuration
    ///
    /// Waiting borrowers are re-examined, since more capacity may now be
    /// available; the evictor is rescheduled if its interval changed.
    /// Borrows already in progress keep the policy and wait they started with.
    pub fn set_config(&self, config: PoolConfig) -> PoolResult<()> {
        config.validate()?;
        let reschedule = {
            let mut state = self.inner.state.lock();
            let old_period = state.config.eviction_period();
            let new_period = config.eviction_period();
            state.config = config;
            state.allocate();
            (old_period != new_period && !state.is_closed()).then_some(new_period)
        };
        if let Some(period) = reschedule {
            self.inner.start_evictor(period);
        }
        Ok(())
    }

    /// Modify the configuration in place
    ///
    /// # Examples
    ///
    /// ```
    /// use generic_objectpool::{FnFactory, ObjectPool, PoolConfig};
    ///
    /// let pool = ObjectPool::new(FnFactory::new(|| 0u8), PoolConfig::default()).unwrap();
    /// pool.update_config(|c| c.max_active = Some(32)).unwrap();
    /// assert_eq!(pool.config().capacity(), Some(32));
    /// ```
    pub fn update_config(&self, update: impl FnOnce(&mut PoolConfig)) -> PoolResult<()> {
        let mut config = self.config();
        update(&mut config);
        self.set_config(config)
    }

    /// Run one eviction pass now, as a scheduled tick would
    pub fn evict(&self) -> PoolResult<()> {
        self.inner.evict()
    }

    /// Create idle objects until `min_idle` is reached, within capacity
    pub fn ensure_min_idle(&self) -> PoolResult<()> {
        self.inner.ensure_min_idle()
    }

    /// The factory this pool draws from
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetrics {
        let occupancy = self.inner.state.lock().occupancy();
        self.inner.metrics.get_metrics(occupancy)
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.metrics().export()
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics_prometheus(
        &self,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        MetricsExporter::export_prometheus(&self.metrics(), pool_name, tags)
    }

    /// Get health status
    pub fn health_status(&self) -> HealthStatus {
        let (occupancy, closed) = {
            let state = self.inner.state.lock();
            (state.occupancy(), state.is_closed())
        };
        HealthStatus::new(occupancy, closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FnFactory;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    /// Hands out increasing ids and records what happens to them
    #[derive(Default)]
    struct Tracking {
        next: AtomicUsize,
        destroyed: Mutex<Vec<usize>>,
        fail_create: AtomicBool,
        fail_activate: AtomicBool,
        valid: AtomicBool,
        panic_create: AtomicBool,
        panic_destroy: AtomicBool,
    }

    impl Tracking {
        fn new() -> Self {
            let factory = Self::default();
            factory.valid.store(true, Ordering::SeqCst);
            factory
        }
    }

    impl ObjectFactory for Arc<Tracking> {
        type Object = usize;

        fn create(&self) -> Result<usize, BoxError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err("create refused".into());
            }
            if self.panic_create.load(Ordering::SeqCst) {
                panic!("create blew up");
            }
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn destroy(&self, obj: usize) -> Result<(), BoxError> {
            if self.panic_destroy.load(Ordering::SeqCst) {
                panic!("destroy blew up");
            }
            self.destroyed.lock().push(obj);
            Ok(())
        }

        fn validate(&self, _obj: &usize) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        fn activate(&self, _obj: &mut usize) -> Result<(), BoxError> {
            if self.fail_activate.load(Ordering::SeqCst) {
                return Err("activate refused".into());
            }
            Ok(())
        }
    }

    fn tracking_pool(config: PoolConfig) -> (Arc<Tracking>, ObjectPool<Arc<Tracking>>) {
        let factory = Arc::new(Tracking::new());
        let pool = ObjectPool::new(Arc::clone(&factory), config).unwrap();
        (factory, pool)
    }

    /// Records schedule and cancel calls instead of running anything
    #[derive(Default)]
    struct Recorder {
        scheduled: Mutex<Vec<Duration>>,
        cancelled: Arc<AtomicUsize>,
    }

    struct RecordedHandle(Arc<AtomicUsize>);

    impl ScheduleHandle for RecordedHandle {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Scheduler for Recorder {
        fn schedule(&self, interval: Duration, _task: Task) -> Box<dyn ScheduleHandle> {
            self.scheduled.lock().push(interval);
            Box::new(RecordedHandle(Arc::clone(&self.cancelled)))
        }
    }

    fn assert_within_capacity<F: ObjectFactory>(pool: &ObjectPool<F>) {
        let state = pool.inner.state.lock();
        if let Some(capacity) = state.config.capacity() {
            assert!(state.num_active + state.idle.len() + state.num_in_flight <= capacity);
        }
    }

    #[test]
    fn test_borrow_return_round_trip() {
        let (_, pool) = tracking_pool(PoolConfig::default().with_test_on_return(true));
        {
            let obj = pool.borrow().unwrap();
            assert_eq!(*obj, 0);
            assert_eq!(pool.num_active(), 1);
        }
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 1);

        // idle count unchanged by another round trip
        drop(pool.borrow().unwrap());
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.num_in_flight(), 0);
    }

    #[test]
    fn test_lifo_hands_out_most_recent() {
        let config = PoolConfig::new()
            .with_max_active(2)
            .with_max_idle(2)
            .with_min_idle(1)
            .with_lifo(true);
        let (_, pool) = tracking_pool(config);

        let x = pool.borrow().unwrap();
        let y = pool.borrow().unwrap();
        assert_eq!((*x, *y), (0, 1));
        drop(x);
        drop(y);

        let idle: Vec<usize> = pool.inner.state.lock().idle.iter().map(|e| e.value).collect();
        assert_eq!(idle, vec![1, 0]);
        assert_eq!(*pool.borrow().unwrap(), 1);
    }

    #[test]
    fn test_fifo_hands_out_oldest() {
        let (_, pool) = tracking_pool(PoolConfig::new().with_lifo(false));
        let x = pool.borrow().unwrap();
        let y = pool.borrow().unwrap();
        drop(x);
        drop(y);
        assert_eq!(*pool.borrow().unwrap(), 0);
    }

    #[test]
    fn test_fail_policy() {
        let config = PoolConfig::new()
            .with_max_active(1)
            .with_exhaustion_policy(ExhaustionPolicy::Fail);
        let (_, pool) = tracking_pool(config);
        let _held = pool.borrow().unwrap();

        assert!(matches!(pool.borrow(), Err(PoolError::Exhausted)));
        assert_eq!(pool.num_waiters(), 0);
        assert_eq!(pool.metrics().exhausted_events, 1);
    }

    #[test]
    fn test_block_policy_times_out() {
        let config = PoolConfig::new()
            .with_max_active(1)
            .with_max_wait(Duration::from_millis(100));
        let (_, pool) = tracking_pool(config);
        let _held = pool.borrow().unwrap();

        let start = Instant::now();
        let result = pool.borrow();
        assert!(matches!(result, Err(PoolError::Timeout(d)) if d == Duration::from_millis(100)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(pool.num_waiters(), 0);
        assert_eq!(pool.num_in_flight(), 0);
    }

    #[test]
    fn test_grow_policy_exceeds_capacity() {
        let config = PoolConfig::new()
            .with_max_active(1)
            .with_exhaustion_policy(ExhaustionPolicy::Grow);
        let (factory, pool) = tracking_pool(config);
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        assert_ne!(*a, *b);
        assert_eq!(factory.next.load(Ordering::SeqCst), 2);
        assert_eq!(pool.num_active(), 2);
    }

    #[test]
    fn test_blocked_borrow_gets_returned_object() {
        let (_, pool) = tracking_pool(PoolConfig::new().with_max_active(1));
        let held = pool.borrow().unwrap();
        let id = *held;

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || *pool.borrow().unwrap())
        };
        while pool.num_waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(held);
        assert_eq!(waiter.join().unwrap(), id);
        assert_eq!(pool.num_active(), 0);
    }

    #[test]
    fn test_create_failure_releases_permit() {
        let (factory, pool) = tracking_pool(PoolConfig::new().with_max_active(1));
        factory.fail_create.store(true, Ordering::SeqCst);
        assert!(matches!(pool.borrow(), Err(PoolError::CreateFailed(_))));
        assert_eq!(pool.num_in_flight(), 0);

        factory.fail_create.store(false, Ordering::SeqCst);
        assert!(pool.borrow().is_ok());
    }

    #[test]
    fn test_new_object_failing_validation_is_reported() {
        let (factory, pool) = tracking_pool(PoolConfig::new().with_test_on_borrow(true));
        factory.valid.store(false, Ordering::SeqCst);
        assert!(matches!(pool.borrow(), Err(PoolError::ValidationFailed(_))));
        assert_eq!(*factory.destroyed.lock(), vec![0]);
        assert_eq!(pool.num_in_flight(), 0);
    }

    #[test]
    fn test_broken_idle_object_is_skipped() {
        let (factory, pool) = tracking_pool(PoolConfig::new());
        drop(pool.borrow().unwrap());
        assert_eq!(pool.num_idle(), 1);

        factory.fail_activate.store(true, Ordering::SeqCst);
        // the idle object is destroyed; the retry creates a fresh one which
        // also fails activation and is reported
        assert!(matches!(pool.borrow(), Err(PoolError::ValidationFailed(_))));
        assert_eq!(*factory.destroyed.lock(), vec![0, 1]);

        factory.fail_activate.store(false, Ordering::SeqCst);
        assert_eq!(*pool.borrow().unwrap(), 2);
        assert_eq!(pool.num_in_flight(), 0);
    }

    #[test]
    fn test_return_destroys_invalid_and_excess() {
        let config = PoolConfig::new().with_max_idle(1).with_test_on_return(true);
        let (factory, pool) = tracking_pool(config);
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(*factory.destroyed.lock(), vec![1]);

        let c = pool.borrow().unwrap();
        factory.valid.store(false, Ordering::SeqCst);
        drop(c);
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.metrics().validation_failures, 1);
    }

    #[test]
    fn test_invalidate_and_detach() {
        let (factory, pool) = tracking_pool(PoolConfig::new().with_max_active(2));
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();

        a.invalidate().unwrap();
        assert_eq!(*factory.destroyed.lock(), vec![0]);
        assert_eq!(pool.num_active(), 1);

        assert_eq!(b.detach(), 1);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(factory.destroyed.lock().len(), 1);
    }

    #[test]
    fn test_invalidate_surfaces_destroy_error() {
        struct Stubborn;
        impl ObjectFactory for Stubborn {
            type Object = ();
            fn create(&self) -> Result<(), BoxError> {
                Ok(())
            }
            fn destroy(&self, _obj: ()) -> Result<(), BoxError> {
                Err("still in use".into())
            }
        }

        let pool = ObjectPool::new(Stubborn, PoolConfig::default()).unwrap();
        let obj = pool.borrow().unwrap();
        assert!(matches!(obj.invalidate(), Err(PoolError::DestroyFailed(_))));
        assert_eq!(pool.num_active(), 0);
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let (factory, pool) = tracking_pool(PoolConfig::default());
        let held = pool.borrow().unwrap();
        drop(pool.borrow().unwrap());

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.num_idle(), 0);
        assert!(matches!(pool.borrow(), Err(PoolError::Closed)));
        assert!(matches!(pool.add_object(), Err(PoolError::Closed)));

        // returned after close: destroyed, not pooled
        drop(held);
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(factory.destroyed.lock().len(), 2);
    }

    #[test]
    fn test_close_wakes_blocked_borrowers() {
        let (_, pool) = tracking_pool(PoolConfig::new().with_max_active(1));
        let _held = pool.borrow().unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || pool.borrow().map(|_| ()))
            })
            .collect();
        while pool.num_waiters() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.close();
        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(PoolError::Closed)));
        }
    }

    #[test]
    fn test_interrupt_while_queued() {
        let (_, pool) = tracking_pool(PoolConfig::new().with_max_active(1));
        let held = pool.borrow().unwrap();
        let token = CancelToken::new();

        let waiter = {
            let (pool, token) = (pool.clone(), token.clone());
            thread::spawn(move || pool.borrow_with_cancel(&token).map(|_| ()))
        };
        while pool.num_waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        token.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(PoolError::Interrupted)));
        assert_eq!(pool.num_waiters(), 0);
        assert_eq!(pool.num_in_flight(), 0);

        drop(held);
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn test_interrupt_after_idle_grant_returns_object() {
        let (_, pool) = tracking_pool(PoolConfig::new().with_max_active(1));
        let latch = Latch::new();
        {
            let mut state = pool.inner.state.lock();
            state.park(7);
            state.queue.push_back(Arc::clone(&latch));
            state.allocate();
            assert_eq!(state.num_in_flight, 1);
        }
        pool.inner.release_request(&latch);
        assert_eq!(pool.num_in_flight(), 0);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn test_interrupt_after_create_grant_releases_permit() {
        let (_, pool) = tracking_pool(PoolConfig::new().with_max_active(1));
        let latch = Latch::new();
        {
            let mut state = pool.inner.state.lock();
            state.queue.push_back(Arc::clone(&latch));
            state.allocate();
        }
        assert!(latch.is_granted());
        pool.inner.release_request(&latch);
        assert_eq!(pool.num_in_flight(), 0);
        assert!(pool.borrow().is_ok());
    }

    #[test]
    fn test_raising_capacity_unblocks_waiter() {
        let (_, pool) = tracking_pool(PoolConfig::new().with_max_active(1));
        let _held = pool.borrow().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.borrow().map(|obj| *obj))
        };
        while pool.num_waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.update_config(|c| c.max_active = Some(2)).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_set_config_rejects_invalid() {
        let (_, pool) = tracking_pool(PoolConfig::default());
        let result = pool.update_config(|c| {
            c.max_idle = Some(1);
            c.min_idle = 2;
        });
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
        assert_eq!(pool.config(), PoolConfig::default());
    }

    #[test]
    fn test_add_object_respects_capacity() {
        let (_, pool) = tracking_pool(PoolConfig::new().with_max_active(2));
        pool.add_object().unwrap();
        pool.add_object().unwrap();
        assert!(matches!(pool.add_object(), Err(PoolError::Exhausted)));
        assert_eq!(pool.num_idle(), 2);
        assert_within_capacity(&pool);
    }

    #[test]
    fn test_concurrent_borrowers_stay_within_capacity() {
        let pool = ObjectPool::new(
            FnFactory::new(|| 0u64),
            PoolConfig::new().with_max_active(4).with_max_idle(4),
        )
        .unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let mut obj = pool.borrow().unwrap();
                        *obj += 1;
                        assert_within_capacity(&pool);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_in_flight(), 0);
        assert!(pool.num_idle() <= 4);
        assert_eq!(pool.metrics().total_borrowed, 1600);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_borrow() {
        let pool = ObjectPool::new(FnFactory::new(|| 3u8), PoolConfig::default()).unwrap();
        let obj = pool.borrow_async().await.unwrap();
        assert_eq!(*obj, 3);
        drop(obj);
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn test_drop_destroys_idle_objects() {
        let factory = Arc::new(Tracking::new());
        {
            let pool = ObjectPool::new(Arc::clone(&factory), PoolConfig::default()).unwrap();
            pool.add_object().unwrap();
            pool.add_object().unwrap();
        }
        assert_eq!(factory.destroyed.lock().len(), 2);
    }

    #[test]
    fn test_shared_token_interrupts_every_borrow() {
        let config = PoolConfig::new()
            .with_max_active(1)
            .with_max_wait(Duration::from_millis(500));
        let (_, pool) = tracking_pool(config);
        let held = pool.borrow().unwrap();
        let token = CancelToken::new();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let (pool, token) = (pool.clone(), token.clone());
                thread::spawn(move || pool.borrow_with_cancel(&token).map(|_| ()))
            })
            .collect();
        while pool.num_waiters() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        token.cancel();
        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(PoolError::Interrupted)));
        }
        assert_eq!(pool.num_waiters(), 0);
        assert_eq!(pool.num_in_flight(), 0);

        drop(held);
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn test_panicking_create_releases_slot() {
        let config = PoolConfig::new()
            .with_max_active(1)
            .with_exhaustion_policy(ExhaustionPolicy::Fail);
        let (factory, pool) = tracking_pool(config);
        factory.panic_create.store(true, Ordering::SeqCst);

        let borrowed = panic::catch_unwind(AssertUnwindSafe(|| pool.borrow().map(|_| ())));
        assert!(borrowed.is_err());
        assert_eq!(pool.num_in_flight(), 0);
        assert_eq!(pool.num_waiters(), 0);

        let added = panic::catch_unwind(AssertUnwindSafe(|| pool.add_object()));
        assert!(added.is_err());
        assert_eq!(pool.num_in_flight(), 0);

        factory.panic_create.store(false, Ordering::SeqCst);
        assert_eq!(*pool.borrow().unwrap(), 0);
        assert_within_capacity(&pool);
    }

    #[test]
    fn test_panicking_destroy_releases_slots() {
        let (factory, pool) = tracking_pool(PoolConfig::new().with_max_active(2));
        pool.add_object().unwrap();
        pool.add_object().unwrap();
        factory.panic_destroy.store(true, Ordering::SeqCst);

        assert!(panic::catch_unwind(AssertUnwindSafe(|| pool.clear())).is_err());
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_in_flight(), 0);

        let obj = pool.borrow().unwrap();
        assert!(panic::catch_unwind(AssertUnwindSafe(move || obj.invalidate())).is_err());
        assert_eq!(pool.num_active(), 0);

        factory.panic_destroy.store(false, Ordering::SeqCst);
        let _x = pool.borrow().unwrap();
        let _y = pool.borrow().unwrap();
        assert_within_capacity(&pool);
    }

    #[test]
    fn test_evictor_follows_interval_changes() {
        let recorder = Arc::new(Recorder::default());
        let scheduler: Arc<dyn Scheduler> = recorder.clone();
        let pool =
            ObjectPool::with_scheduler(Arc::new(Tracking::new()), PoolConfig::default(), scheduler)
                .unwrap();
        let cancels = || recorder.cancelled.load(Ordering::SeqCst);
        assert!(recorder.scheduled.lock().is_empty());

        pool.update_config(|c| c.eviction_interval = Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(*recorder.scheduled.lock(), vec![Duration::from_millis(50)]);
        assert_eq!(cancels(), 0);

        pool.update_config(|c| c.eviction_interval = Some(Duration::from_millis(80)))
            .unwrap();
        assert_eq!(recorder.scheduled.lock().len(), 2);
        assert_eq!(cancels(), 1);

        // unrelated changes leave the schedule alone
        pool.update_config(|c| c.max_idle = Some(3)).unwrap();
        assert_eq!(recorder.scheduled.lock().len(), 2);
        assert_eq!(cancels(), 1);

        pool.update_config(|c| c.eviction_interval = Some(Duration::ZERO))
            .unwrap();
        assert_eq!(recorder.scheduled.lock().len(), 2);
        assert_eq!(cancels(), 2);

        pool.update_config(|c| c.eviction_interval = Some(Duration::from_millis(30)))
            .unwrap();
        assert_eq!(recorder.scheduled.lock().len(), 3);

        pool.close();
        assert_eq!(cancels(), 3);

        // a reschedule racing with close must not revive the evictor
        pool.inner.start_evictor(Some(Duration::from_millis(10)));
        pool.update_config(|c| c.eviction_interval = Some(Duration::from_millis(60)))
            .unwrap();
        assert_eq!(recorder.scheduled.lock().len(), 3);
        assert_eq!(cancels(), 3);
    }
}
