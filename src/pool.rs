//! Single-key object pool engine

use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::base::{collect_abandoned, panic_message, CreateGate, PoolBase};
use crate::config::{AbandonedConfig, PoolConfig};
use crate::deque::BlockingDeque;
use crate::errors::{PoolError, PoolResult};
use crate::eviction::{EvictionConfig, EvictionPolicy};
use crate::factory::{PooledObjectFactory, SwallowedErrorListener};
use crate::metrics::PoolMetrics;
use crate::pooled_object::{DestroyMode, PooledObject};

type Pooled<T> = Arc<PooledObject<T>>;

/// What a [`Lease`] does with its object when released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Return,
    Invalidate,
}

pub(crate) type ReleaseFn<T> = Arc<dyn Fn(Pooled<T>, Disposition) + Send + Sync>;

/// A borrowed object that goes back to its pool when dropped
///
/// # Examples
///
/// ```
/// use generic_objectpool::{BoxError, GenericObjectPool, PoolConfig, PooledObjectFactory};
///
/// struct Buffers;
///
/// impl PooledObjectFactory<Vec<u8>> for Buffers {
///     fn make_object(&self) -> Result<Vec<u8>, BoxError> {
///         Ok(vec![0; 16])
///     }
/// }
///
/// let pool = GenericObjectPool::new(Buffers, PoolConfig::default());
/// {
///     let buffer = pool.lease().unwrap();
///     assert_eq!(buffer.len(), 16);
///     assert_eq!(pool.num_active(), 1);
/// }
/// assert_eq!(pool.num_active(), 0);
/// assert_eq!(pool.num_idle(), 1);
/// ```
pub struct Lease<T> {
    object: Option<Pooled<T>>,
    release: ReleaseFn<T>,
}

impl<T> Lease<T> {
    pub(crate) fn new(object: Pooled<T>, release: ReleaseFn<T>) -> Self {
        Self {
            object: Some(object),
            release,
        }
    }

    /// The pooled wrapper, with its bookkeeping
    pub fn pooled(&self) -> &Pooled<T> {
        self.object.as_ref().expect("lease already released")
    }

    /// Destroy the object instead of returning it
    pub fn invalidate(mut self) {
        if let Some(object) = self.object.take() {
            (self.release)(object, Disposition::Invalidate);
        }
    }

    /// Keep the object checked out; the caller becomes responsible for
    /// returning or invalidating it
    pub fn detach(mut self) -> Pooled<T> {
        self.object.take().expect("lease already released")
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.pooled().object()
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            (self.release)(object, Disposition::Return);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("object", &self.object).finish()
    }
}

/// Thread-safe pool of objects produced by a [`PooledObjectFactory`]
///
/// Borrowers get an idle object if one exists, a newly created one while the
/// pool is below `max_total`, or wait for a return otherwise. Cloning the pool
/// yields another handle to the same pool; the pool closes when the last
/// handle (and the last [`Lease`]) is dropped.
///
/// # Examples
///
/// ```
/// use generic_objectpool::{BoxError, GenericObjectPool, PoolConfig, PooledObjectFactory};
/// use std::time::Duration;
///
/// struct Connections;
///
/// impl PooledObjectFactory<String> for Connections {
///     fn make_object(&self) -> Result<String, BoxError> {
///         Ok("connection".to_string())
///     }
/// }
///
/// let config = PoolConfig::new()
///     .with_max_total(2)
///     .with_max_wait(Duration::from_millis(10));
/// let pool = GenericObjectPool::new(Connections, config);
///
/// let a = pool.borrow_object().unwrap();
/// let b = pool.borrow_object().unwrap();
/// assert!(pool.borrow_object().unwrap_err().is_exhausted());
///
/// pool.return_object(a).unwrap();
/// pool.return_object(b).unwrap();
/// assert_eq!(pool.num_idle(), 2);
/// ```
pub struct GenericObjectPool<T, F>
where
    T: Send + Sync + 'static,
    F: PooledObjectFactory<T> + 'static,
{
    inner: Arc<PoolInner<T, F>>,
}

struct PoolInner<T, F>
where
    T: Send + Sync + 'static,
    F: PooledObjectFactory<T> + 'static,
{
    factory: F,
    config: RwLock<PoolConfig<T>>,
    idle: BlockingDeque<Pooled<T>>,
    all: DashMap<u64, Pooled<T>>,
    create_count: AtomicUsize,
    gate: CreateGate,
    /// Idle objects still to be visited by the evictor; also the eviction lock
    eviction_cursor: Mutex<Vec<Pooled<T>>>,
    base: PoolBase,
}

impl<T, F> GenericObjectPool<T, F>
where
    T: Send + Sync + 'static,
    F: PooledObjectFactory<T> + 'static,
{
    /// Create a pool and start its evictor if the config schedules one
    pub fn new(factory: F, config: PoolConfig<T>) -> Self {
        Self::build(factory, config, None)
    }

    /// Create a pool that reclaims objects its borrowers never return
    pub fn with_abandoned_config(factory: F, config: PoolConfig<T>, abandoned: AbandonedConfig) -> Self {
        Self::build(factory, config, Some(abandoned))
    }

    fn build(factory: F, config: PoolConfig<T>, abandoned: Option<AbandonedConfig>) -> Self {
        let inner = PoolInner {
            factory,
            idle: BlockingDeque::new(config.common.fairness),
            config: RwLock::new(config),
            all: DashMap::new(),
            create_count: AtomicUsize::new(0),
            gate: CreateGate::new(),
            eviction_cursor: Mutex::new(Vec::new()),
            base: PoolBase::new(abandoned),
        };
        let pool = Self { inner: Arc::new(inner) };
        pool.restart_evictor();
        pool
    }

    fn restart_evictor(&self) {
        let (period, timer) = {
            let config = self.inner.config.read();
            (config.common.time_between_eviction_runs, config.common.eviction_timer.clone())
        };
        let pool = Arc::downgrade(&self.inner);
        self.inner.base.start_evictor(
            period,
            timer,
            Arc::new(move || {
                if let Some(pool) = pool.upgrade() {
                    pool.run_maintenance();
                }
            }),
        );
    }

    /// Borrow an object, waiting at most the configured `max_wait`
    pub fn borrow_object(&self) -> PoolResult<Pooled<T>> {
        let max_wait = self.inner.config.read().common.max_wait;
        self.inner.borrow(max_wait)
    }

    /// Borrow an object, waiting at most `max_wait` (`None` waits indefinitely)
    /// when the pool is exhausted and configured to block
    pub fn borrow_object_timeout(&self, max_wait: Option<Duration>) -> PoolResult<Pooled<T>> {
        self.inner.borrow(max_wait)
    }

    /// Borrow an object wrapped in a guard that returns it on drop
    pub fn lease(&self) -> PoolResult<Lease<T>> {
        let object = self.borrow_object()?;
        Ok(Lease::new(object, self.release_fn()))
    }

    /// Borrow from async code without blocking the runtime.
    ///
    /// The borrow runs on tokio's blocking thread pool; if the returned future
    /// is dropped early the object goes straight back to the pool.
    pub async fn lease_async(&self) -> PoolResult<Lease<T>> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.lease())
            .await
            .map_err(|e| PoolError::illegal_state(format!("borrow task failed: {e}")))?
    }

    /// Async counterpart of [`borrow_object`](Self::borrow_object)
    pub async fn borrow_object_async(&self) -> PoolResult<Pooled<T>> {
        self.lease_async().await.map(Lease::detach)
    }

    fn release_fn(&self) -> ReleaseFn<T> {
        let pool = Arc::clone(&self.inner);
        Arc::new(move |object: Pooled<T>, disposition: Disposition| {
            let result = match disposition {
                Disposition::Return => pool.return_object(object),
                Disposition::Invalidate => pool.invalidate_object(&object, DestroyMode::Normal),
            };
            pool.base.swallow_result(result);
        })
    }

    /// Give a borrowed object back to the pool
    ///
    /// Fails with [`PoolError::IllegalState`] if the object does not belong to
    /// this pool or is not currently borrowed. Objects unknown to a pool with
    /// an abandoned config are ignored, since they may have been reclaimed.
    pub fn return_object(&self, object: Pooled<T>) -> PoolResult<()> {
        self.inner.return_object(object)
    }

    /// Destroy a borrowed object instead of returning it
    pub fn invalidate_object(&self, object: &Pooled<T>) -> PoolResult<()> {
        self.inner.invalidate_object(object, DestroyMode::Normal)
    }

    /// Destroy a borrowed object, passing `mode` to the factory
    pub fn invalidate_object_with_mode(&self, object: &Pooled<T>, mode: DestroyMode) -> PoolResult<()> {
        self.inner.invalidate_object(object, mode)
    }

    /// Create one object and park it in the idle deque. Does nothing when the
    /// pool is at capacity.
    pub fn add_object(&self) -> PoolResult<()> {
        self.inner.base.assert_open()?;
        match self.inner.create()? {
            Some(p) => self.inner.add_idle_object(p),
            None => Ok(()),
        }
    }

    /// Fill the idle deque up to `min_idle`
    pub fn prepare_pool(&self) -> PoolResult<()> {
        if self.inner.config.read().effective_min_idle() < 1 {
            return Ok(());
        }
        self.inner.ensure_min_idle()
    }

    /// Destroy every idle object
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Run one eviction pass over idle objects
    pub fn evict(&self) -> PoolResult<()> {
        self.inner.evict()
    }

    /// Create idle objects until `min_idle` are available
    pub fn ensure_min_idle(&self) -> PoolResult<()> {
        self.inner.ensure_min_idle()
    }

    /// Close the pool: stop the evictor, destroy idle objects and wake
    /// blocked borrowers with [`PoolError::Closed`]. Borrowed objects are
    /// destroyed when they come back.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.inner.base.is_closed()
    }

    /// Record that a borrowed object is still in use, postponing its
    /// reclamation as abandoned. Only effective with usage tracking enabled.
    pub fn use_object(&self, object: &PooledObject<T>) {
        let tracking = self
            .inner
            .base
            .abandoned_config()
            .is_some_and(|c| c.use_usage_tracking);
        if tracking {
            if let Some(p) = self.inner.all.get(&object.id()) {
                p.mark_used();
            }
        }
    }

    /// Objects waiting in the idle deque
    pub fn num_idle(&self) -> usize {
        self.inner.idle.len()
    }

    /// Objects currently borrowed
    pub fn num_active(&self) -> usize {
        self.inner.num_active()
    }

    /// Threads blocked waiting for an object
    pub fn num_waiters(&self) -> usize {
        self.inner.num_waiters()
    }

    /// The factory this pool creates objects with
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Copy of the current configuration
    pub fn config(&self) -> PoolConfig<T> {
        self.inner.config.read().clone()
    }

    /// Replace the configuration and reschedule the evictor.
    ///
    /// Fairness is fixed when the pool is created and is not changed.
    pub fn set_config(&self, config: PoolConfig<T>) {
        {
            let _eviction = self.inner.eviction_cursor.lock();
            *self.inner.config.write() = config;
        }
        self.restart_evictor();
    }

    /// Current abandoned-object settings, if reclamation is enabled
    pub fn abandoned_config(&self) -> Option<AbandonedConfig> {
        self.inner.base.abandoned_config()
    }

    /// Enable, change or disable (`None`) abandoned-object reclamation
    pub fn set_abandoned_config(&self, config: Option<AbandonedConfig>) {
        self.inner.base.set_abandoned_config(config);
    }

    /// Receive errors the pool recovers from instead of returning
    pub fn set_swallowed_error_listener(&self, listener: Option<Arc<dyn SwallowedErrorListener>>) {
        self.inner.base.set_listener(listener);
    }

    /// Get current metrics
    pub fn metrics(&self) -> PoolMetrics {
        self.inner
            .base
            .stats
            .get_metrics(self.num_active(), self.num_idle(), self.num_waiters())
    }
}

impl<T, F> Clone for GenericObjectPool<T, F>
where
    T: Send + Sync + 'static,
    F: PooledObjectFactory<T> + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, F> fmt::Debug for GenericObjectPool<T, F>
where
    T: Send + Sync + 'static,
    F: PooledObjectFactory<T> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericObjectPool")
            .field("active", &self.num_active())
            .field("idle", &self.num_idle())
            .field("waiters", &self.num_waiters())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T, F> PoolInner<T, F>
where
    T: Send + Sync + 'static,
    F: PooledObjectFactory<T> + 'static,
{
    fn num_active(&self) -> usize {
        self.all.len().saturating_sub(self.idle.len())
    }

    fn num_waiters(&self) -> usize {
        if self.config.read().common.block_when_exhausted {
            self.idle.take_queue_length()
        } else {
            0
        }
    }

    fn lookup(&self, object: &PooledObject<T>) -> Option<Pooled<T>> {
        self.all.get(&object.id()).map(|p| Arc::clone(p.value()))
    }

    fn borrow(&self, max_wait: Option<Duration>) -> PoolResult<Pooled<T>> {
        self.base.assert_open()?;

        let (max_total, block_when_exhausted, test_on_borrow) = {
            let config = self.config.read();
            (config.max_total, config.common.block_when_exhausted, config.common.test_on_borrow)
        };

        if let Some(abandoned) = self.base.abandoned_sweep_on_borrow(self.idle.len(), self.num_active(), max_total) {
            self.remove_abandoned(&abandoned);
        }

        let started = Instant::now();
        let deadline = max_wait.and_then(|wait| started.checked_add(wait));

        loop {
            let mut created = false;
            let p = match self.idle.poll_first() {
                Some(p) => p,
                None => match self.create()? {
                    Some(p) => {
                        created = true;
                        p
                    }
                    None if block_when_exhausted => self.wait_for_idle(deadline, max_wait)?,
                    None => return Err(PoolError::Exhausted),
                },
            };

            if !p.allocate() {
                continue;
            }

            if let Err(e) = self.factory.activate_object(&p) {
                self.destroy(&p, DestroyMode::Normal);
                if created {
                    return Err(PoolError::activation(e));
                }
                continue;
            }

            if test_on_borrow && !self.factory.validate_object(&p) {
                if self.destroy(&p, DestroyMode::Normal) {
                    self.base.stats.destroyed_by_borrow_validation.fetch_add(1, Ordering::Relaxed);
                }
                if created {
                    return Err(PoolError::ValidationFailed);
                }
                continue;
            }

            self.base.stats.record_borrow(p.idle_duration(), started.elapsed());
            return Ok(p);
        }
    }

    fn wait_for_idle(&self, deadline: Option<Instant>, max_wait: Option<Duration>) -> PoolResult<Pooled<T>> {
        self.base.assert_open()?;
        let polled = match (deadline, max_wait) {
            (Some(deadline), Some(_)) => self
                .idle
                .poll_first_timeout(deadline.saturating_duration_since(Instant::now())),
            _ => self.idle.take_first().map(Some),
        };
        match polled {
            Ok(Some(p)) => Ok(p),
            Ok(None) => Err(PoolError::Timeout(max_wait.unwrap_or_default())),
            Err(PoolError::Interrupted) if self.base.is_closed() => Err(PoolError::Closed),
            Err(e) => Err(e),
        }
    }

    /// Make a new object if capacity allows. `Ok(None)` means the pool is
    /// full or the object failed creation-time validation.
    fn create(&self) -> PoolResult<Option<Pooled<T>>> {
        let (max_total, max_wait, test_on_create) = {
            let config = self.config.read();
            (config.max_total, config.common.max_wait, config.common.test_on_create)
        };

        let Some(slot) = self
            .gate
            .acquire(&self.create_count, max_total.unwrap_or(usize::MAX), max_wait)
        else {
            return Ok(None);
        };

        let p = match self.factory.make_object() {
            Ok(object) => Arc::new(PooledObject::new(object)),
            Err(e) => {
                self.create_count.fetch_sub(1, Ordering::SeqCst);
                drop(slot);
                return Err(PoolError::factory(e));
            }
        };

        if test_on_create && !self.factory.validate_object(&p) {
            self.create_count.fetch_sub(1, Ordering::SeqCst);
            drop(slot);
            debug!(object_id = p.id(), "new object failed validation");
            if let Err(e) = self.factory.destroy_object(&p, DestroyMode::Normal) {
                self.base.swallow(PoolError::destroy(e));
            }
            return Ok(None);
        }
        drop(slot);

        if self.base.abandoned_config().is_some_and(|c| c.log_abandoned) {
            p.set_log_abandoned(true);
        }
        self.base.stats.created.fetch_add(1, Ordering::Relaxed);
        self.all.insert(p.id(), Arc::clone(&p));
        debug!(object_id = p.id(), "created pooled object");
        Ok(Some(p))
    }

    /// Destroy `p` unless another caller already has. Returns whether this
    /// call did the destruction.
    fn destroy(&self, p: &Pooled<T>, mode: DestroyMode) -> bool {
        if !p.invalidate() {
            return false;
        }
        self.idle.remove(p);
        self.all.remove(&p.id());
        let result = self.factory.destroy_object(p, mode);
        self.base.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        self.create_count.fetch_sub(1, Ordering::SeqCst);
        debug!(object_id = p.id(), ?mode, "destroyed pooled object");
        if let Err(e) = result {
            self.base.swallow(PoolError::destroy(e));
        }
        true
    }

    fn push_idle(&self, p: Pooled<T>, lifo: bool) {
        if lifo {
            self.idle.offer_first(p);
        } else {
            self.idle.offer_last(p);
        }
    }

    fn add_idle_object(&self, p: Pooled<T>) -> PoolResult<()> {
        if let Err(e) = self.factory.passivate_object(&p) {
            self.destroy(&p, DestroyMode::Normal);
            return Err(PoolError::passivation(e));
        }
        let lifo = self.config.read().common.lifo;
        self.push_idle(p, lifo);
        Ok(())
    }

    fn return_object(&self, object: Pooled<T>) -> PoolResult<()> {
        let Some(p) = self.lookup(&object) else {
            if self.base.has_abandoned_config() {
                return Ok(());
            }
            return Err(PoolError::illegal_state("Returned object not currently part of this pool"));
        };

        if !p.mark_returning() {
            return Err(PoolError::illegal_state(
                "Object has already been returned to this pool or is invalid",
            ));
        }
        let active_time = p.active_duration();

        let (test_on_return, max_idle, lifo) = {
            let config = self.config.read();
            (config.common.test_on_return, config.max_idle, config.common.lifo)
        };

        let recycled = if test_on_return && !self.factory.validate_object(&p) {
            false
        } else if let Err(e) = self.factory.passivate_object(&p) {
            self.base.swallow(PoolError::passivation(e));
            false
        } else {
            true
        };

        if !recycled {
            self.destroy(&p, DestroyMode::Normal);
            self.base.swallow_result(self.ensure_idle(1, false));
            self.base.stats.record_return(active_time);
            return Ok(());
        }

        if !p.deallocate() {
            return Err(PoolError::illegal_state(
                "Object has already been returned to this pool or is invalid",
            ));
        }

        if self.base.is_closed() || max_idle.is_some_and(|max| self.idle.len() >= max) {
            self.destroy(&p, DestroyMode::Normal);
            self.base.swallow_result(self.ensure_idle(1, false));
        } else {
            self.push_idle(p, lifo);
            if self.base.is_closed() {
                // closed while the object was being queued
                self.clear();
            }
        }

        self.base.stats.record_return(active_time);
        Ok(())
    }

    fn invalidate_object(&self, object: &PooledObject<T>, mode: DestroyMode) -> PoolResult<()> {
        let Some(p) = self.lookup(object) else {
            if self.base.has_abandoned_config() {
                return Ok(());
            }
            return Err(PoolError::illegal_state(
                "Invalidated object not currently part of this pool",
            ));
        };
        self.destroy(&p, mode);
        self.ensure_idle(1, false)
    }

    fn clear(&self) {
        for p in self.idle.drain() {
            self.destroy(&p, DestroyMode::Normal);
        }
    }

    /// Top the idle deque up to `count`. Unless `always` is set this only
    /// happens while borrowers are waiting.
    fn ensure_idle(&self, count: usize, always: bool) -> PoolResult<()> {
        if count < 1 || self.base.is_closed() || (!always && !self.idle.has_take_waiters()) {
            return Ok(());
        }
        while self.idle.len() < count {
            let Some(p) = self.create()? else {
                break;
            };
            self.add_idle_object(p)?;
        }
        if self.base.is_closed() {
            self.clear();
        }
        Ok(())
    }

    fn ensure_min_idle(&self) -> PoolResult<()> {
        let min_idle = self.config.read().effective_min_idle();
        self.ensure_idle(min_idle, true)
    }

    fn evict(&self) -> PoolResult<()> {
        self.base.assert_open()?;

        if !self.idle.is_empty() {
            let mut cursor = self.eviction_cursor.lock();
            let (policy, eviction_config, test_while_idle, lifo, num_tests) = {
                let config = self.config.read();
                (
                    Arc::clone(&config.common.eviction_policy),
                    EvictionConfig::new(
                        config.common.min_evictable_idle,
                        config.common.soft_min_evictable_idle,
                        config.effective_min_idle(),
                    ),
                    config.common.test_while_idle,
                    config.common.lifo,
                    config.common.num_tests(self.idle.len()),
                )
            };

            // objects snatched by borrowers between snapshot and test do not
            // count as tested; bound how many of those one pass tolerates
            let mut misses_left = 2 * self.idle.len() + 1;
            let mut tested = 0;
            while tested < num_tests {
                if cursor.is_empty() {
                    // pop() takes from the back, so the oldest idle object comes first
                    *cursor = if lifo { self.idle.snapshot() } else { self.idle.snapshot_rev() };
                }
                let Some(under_test) = cursor.pop() else {
                    break;
                };
                if !under_test.start_eviction_test() {
                    misses_left = misses_left.saturating_sub(1);
                    if misses_left == 0 {
                        break;
                    }
                    continue;
                }
                tested += 1;
                self.test_idle_object(&under_test, policy.as_ref(), &eviction_config, test_while_idle);
            }
        }

        if let Some(abandoned) = self.base.abandoned_config() {
            if abandoned.remove_abandoned_on_maintenance {
                self.remove_abandoned(&abandoned);
            }
        }
        Ok(())
    }

    fn test_idle_object(
        &self,
        under_test: &Pooled<T>,
        policy: &dyn EvictionPolicy<T>,
        eviction_config: &EvictionConfig,
        test_while_idle: bool,
    ) {
        let idle_count = self.idle.len();
        let evict = match panic::catch_unwind(AssertUnwindSafe(|| {
            policy.evict(eviction_config, under_test, idle_count)
        })) {
            Ok(evict) => evict,
            Err(payload) => {
                self.base
                    .swallow(PoolError::EvictionPolicy(panic_message(payload.as_ref())));
                false
            }
        };

        if evict {
            if self.destroy(under_test, DestroyMode::Normal) {
                self.base.stats.destroyed_by_evictor.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        if test_while_idle && !self.passes_idle_test(under_test) {
            if self.destroy(under_test, DestroyMode::Normal) {
                self.base.stats.destroyed_by_evictor.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        under_test.end_eviction_test(&self.idle);
    }

    fn passes_idle_test(&self, p: &Pooled<T>) -> bool {
        if let Err(e) = self.factory.activate_object(p) {
            self.base.swallow(PoolError::activation(e));
            return false;
        }
        if !self.factory.validate_object(p) {
            return false;
        }
        if let Err(e) = self.factory.passivate_object(p) {
            self.base.swallow(PoolError::passivation(e));
            return false;
        }
        true
    }

    fn remove_abandoned(&self, config: &AbandonedConfig) {
        let borrowed: Vec<Pooled<T>> = self.all.iter().map(|p| Arc::clone(p.value())).collect();
        for p in collect_abandoned(borrowed, config) {
            self.destroy(&p, DestroyMode::Abandoned);
            self.base.swallow_result(self.ensure_idle(1, false));
        }
    }

    fn run_maintenance(&self) {
        match self.evict() {
            Ok(()) | Err(PoolError::Closed) => {}
            Err(e) => self.base.swallow(e),
        }
        self.base.swallow_result(self.ensure_min_idle());
    }

    fn close(&self) {
        self.base.close_with(|| {
            self.clear();
            self.idle.interrupt_take_waiters();
        });
    }
}

impl<T, F> Drop for PoolInner<T, F>
where
    T: Send + Sync + 'static,
    F: PooledObjectFactory<T> + 'static,
{
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxError;
    use crate::eviction::DefaultEvictionPolicy;
    use crate::pooled_object::PooledObjectState;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Default)]
    struct Tracked {
        made: AtomicUsize,
        destroyed: AtomicUsize,
        fail_activation: AtomicBool,
        fail_validation: AtomicBool,
        reject_below: AtomicUsize,
    }

    impl PooledObjectFactory<usize> for Tracked {
        fn make_object(&self) -> Result<usize, BoxError> {
            Ok(self.made.fetch_add(1, Ordering::SeqCst))
        }

        fn destroy_object(&self, _p: &PooledObject<usize>, _mode: DestroyMode) -> Result<(), BoxError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn validate_object(&self, p: &PooledObject<usize>) -> bool {
            !self.fail_validation.load(Ordering::SeqCst) && **p >= self.reject_below.load(Ordering::SeqCst)
        }

        fn activate_object(&self, _p: &PooledObject<usize>) -> Result<(), BoxError> {
            if self.fail_activation.load(Ordering::SeqCst) {
                Err("activation refused".into())
            } else {
                Ok(())
            }
        }
    }

    fn pool(config: PoolConfig<usize>) -> GenericObjectPool<usize, Tracked> {
        GenericObjectPool::new(Tracked::default(), config)
    }

    #[test]
    fn test_borrow_creates_then_reuses() {
        let pool = pool(PoolConfig::default());
        let first = pool.borrow_object().unwrap();
        assert_eq!(*first.object(), 0);
        assert_eq!(first.state(), PooledObjectState::Allocated);
        pool.return_object(first).unwrap();

        let again = pool.borrow_object().unwrap();
        assert_eq!(*again.object(), 0);
        assert_eq!(again.borrowed_count(), 2);
        assert_eq!(pool.factory().made.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_non_blocking_exhaustion() {
        let pool = pool(PoolConfig::new().with_max_total(1).with_block_when_exhausted(false));
        let _held = pool.borrow_object().unwrap();
        assert!(matches!(pool.borrow_object(), Err(PoolError::Exhausted)));
    }

    #[test]
    fn test_blocking_timeout() {
        let pool = pool(PoolConfig::new().with_max_total(1));
        let _held = pool.borrow_object().unwrap();
        let started = Instant::now();
        let err = pool.borrow_object_timeout(Some(Duration::from_millis(30))).unwrap_err();
        assert!(matches!(err, PoolError::Timeout(d) if d == Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_lifo_and_fifo_order() {
        let lifo = pool(PoolConfig::default());
        let fifo = pool(PoolConfig::new().with_lifo(false));
        for pool in [&lifo, &fifo] {
            let a = pool.borrow_object().unwrap();
            let b = pool.borrow_object().unwrap();
            pool.return_object(a).unwrap();
            pool.return_object(b).unwrap();
        }
        assert_eq!(*lifo.borrow_object().unwrap().object(), 1);
        assert_eq!(*fifo.borrow_object().unwrap().object(), 0);
    }

    #[test]
    fn test_return_errors() {
        let pool = pool(PoolConfig::default());
        let other = pool_with_object();
        assert!(matches!(pool.return_object(other), Err(PoolError::IllegalState(_))));

        let p = pool.borrow_object().unwrap();
        pool.return_object(Arc::clone(&p)).unwrap();
        assert!(matches!(pool.return_object(p), Err(PoolError::IllegalState(_))));
    }

    fn pool_with_object() -> Pooled<usize> {
        Arc::new(PooledObject::new(99))
    }

    #[test]
    fn test_unknown_return_ignored_with_abandoned_config() {
        let pool = GenericObjectPool::with_abandoned_config(
            Tracked::default(),
            PoolConfig::default(),
            AbandonedConfig::new(),
        );
        assert!(pool.return_object(pool_with_object()).is_ok());
        assert!(pool.invalidate_object(&pool_with_object()).is_ok());
    }

    #[test]
    fn test_invalidate_destroys_once() {
        let pool = pool(PoolConfig::default());
        let p = pool.borrow_object().unwrap();
        pool.invalidate_object(&p).unwrap();
        assert_eq!(p.state(), PooledObjectState::Invalid);
        assert!(matches!(pool.invalidate_object(&p), Err(PoolError::IllegalState(_))));
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.num_active(), 0);
    }

    #[test]
    fn test_activation_failure_on_new_object_fails_borrow() {
        let pool = pool(PoolConfig::default());
        pool.factory().fail_activation.store(true, Ordering::SeqCst);
        assert!(matches!(pool.borrow_object(), Err(PoolError::ActivationFailed(_))));
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_recycled_object_is_replaced() {
        let pool = pool(PoolConfig::new().with_test_on_borrow(true).with_lifo(false));
        pool.add_object().unwrap();
        pool.add_object().unwrap();
        pool.factory().reject_below.store(1, Ordering::SeqCst);

        let p = pool.borrow_object().unwrap();
        assert_eq!(*p.object(), 1);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().destroyed_by_borrow_validation, 1);
    }

    #[test]
    fn test_borrow_validation_failure_counts() {
        let pool = pool(PoolConfig::new().with_test_on_borrow(true));
        pool.add_object().unwrap();
        pool.factory().fail_validation.store(true, Ordering::SeqCst);
        // the idle object fails and is destroyed, then the fresh one fails too
        assert!(matches!(pool.borrow_object(), Err(PoolError::ValidationFailed)));
        let metrics = pool.metrics();
        assert_eq!(metrics.destroyed_by_borrow_validation, 2);
        assert_eq!(metrics.destroyed, 2);
    }

    #[test]
    fn test_test_on_create_rejects_and_destroys() {
        let pool = pool(PoolConfig::new().with_test_on_create(true).with_block_when_exhausted(false));
        pool.factory().fail_validation.store(true, Ordering::SeqCst);
        assert!(matches!(pool.borrow_object(), Err(PoolError::Exhausted)));
        assert_eq!(pool.factory().made.load(Ordering::SeqCst), 1);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().created, 0);
    }

    #[test]
    fn test_max_idle_destroys_surplus_returns() {
        let pool = pool(PoolConfig::new().with_max_idle(1));
        let a = pool.borrow_object().unwrap();
        let b = pool.borrow_object().unwrap();
        pool.return_object(a).unwrap();
        pool.return_object(b).unwrap();
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_and_min_idle() {
        let pool = pool(PoolConfig::new().with_min_idle(3));
        pool.prepare_pool().unwrap();
        assert_eq!(pool.num_idle(), 3);
        pool.clear();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 3);
        pool.ensure_min_idle().unwrap();
        assert_eq!(pool.num_idle(), 3);
    }

    #[test]
    fn test_evict_respects_num_tests() {
        let config = PoolConfig::new()
            .with_min_evictable_idle(Duration::from_millis(1))
            .with_num_tests_per_eviction_run(2);
        let pool = pool(config);
        for _ in 0..5 {
            pool.add_object().unwrap();
        }
        thread::sleep(Duration::from_millis(10));
        pool.evict().unwrap();
        assert_eq!(pool.num_idle(), 3);
        assert_eq!(pool.metrics().destroyed_by_evictor, 2);
    }

    #[test]
    fn test_evict_keeps_fresh_objects() {
        let pool = pool(PoolConfig::new().with_eviction_policy(Arc::new(DefaultEvictionPolicy)));
        pool.add_object().unwrap();
        pool.evict().unwrap();
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.borrow_object().unwrap().state(), PooledObjectState::Allocated);
    }

    #[test]
    fn test_test_while_idle_destroys_invalid() {
        let pool = pool(PoolConfig::new().with_test_while_idle(true));
        pool.add_object().unwrap();
        pool.factory().fail_validation.store(true, Ordering::SeqCst);
        pool.evict().unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.metrics().destroyed_by_evictor, 1);
    }

    #[test]
    fn test_close_semantics() {
        let pool = pool(PoolConfig::default());
        let held = pool.borrow_object().unwrap();
        pool.add_object().unwrap();
        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.num_idle(), 0);
        assert!(matches!(pool.borrow_object(), Err(PoolError::Closed)));
        assert!(matches!(pool.evict(), Err(PoolError::Closed)));

        pool.return_object(held).unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_wakes_waiter() {
        let pool = pool(PoolConfig::new().with_max_total(1));
        let _held = pool.borrow_object().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.borrow_object_timeout(None))
        };
        while pool.num_waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(PoolError::Closed)));
    }

    #[test]
    fn test_lease_returns_and_invalidates() {
        let pool = pool(PoolConfig::default());
        {
            let lease = pool.lease().unwrap();
            assert_eq!(*lease, 0);
        }
        assert_eq!(pool.num_idle(), 1);

        let lease = pool.lease().unwrap();
        lease.invalidate();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);

        let detached = pool.lease().unwrap().detach();
        assert_eq!(pool.num_active(), 1);
        pool.return_object(detached).unwrap();
    }

    #[tokio::test]
    async fn test_async_borrow() {
        let pool = pool(PoolConfig::default());
        {
            let lease = pool.lease_async().await.unwrap();
            assert_eq!(*lease, 0);
        }
        let p = pool.borrow_object_async().await.unwrap();
        assert_eq!(pool.num_active(), 1);
        pool.return_object(p).unwrap();
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn test_use_object_requires_tracking() {
        let abandoned = AbandonedConfig::new().with_usage_tracking(true);
        let pool = GenericObjectPool::with_abandoned_config(Tracked::default(), PoolConfig::default(), abandoned);
        let p = pool.borrow_object().unwrap();
        let before = p.last_used_at();
        thread::sleep(Duration::from_millis(5));
        pool.use_object(&p);
        assert!(p.last_used_at() > before);
    }

    #[test]
    fn test_set_config_applies() {
        let pool = pool(PoolConfig::default());
        pool.set_config(PoolConfig::new().with_max_total(1).with_block_when_exhausted(false));
        let _held = pool.borrow_object().unwrap();
        assert!(pool.borrow_object().unwrap_err().is_exhausted());
        assert_eq!(pool.config().max_total, Some(1));
    }
}
