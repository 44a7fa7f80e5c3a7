//! Keyed object pool engine
//!
//! A keyed pool is a set of independent sub-pools, one per key, that share a
//! single optional limit on the total number of live objects. When that limit
//! is reached, creating an object for one key destroys the oldest idle
//! objects of other keys to make room.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::base::{collect_abandoned, panic_message, CreateGate, PoolBase};
use crate::config::{AbandonedConfig, KeyedPoolConfig};
use crate::deque::BlockingDeque;
use crate::errors::{PoolError, PoolResult};
use crate::eviction::{EvictionConfig, EvictionPolicy};
use crate::factory::{KeyedPooledObjectFactory, SwallowedErrorListener};
use crate::metrics::PoolMetrics;
use crate::pool::{Disposition, Lease, ReleaseFn};
use crate::pooled_object::{DestroyMode, PooledObject};

type Pooled<T> = Arc<PooledObject<T>>;

/// Fraction of the idle objects destroyed when the global limit is hit
const CLEAR_OLDEST_FRACTION: f64 = 0.15;

/// Per-key sub-pool
struct ObjectDeque<T> {
    idle: BlockingDeque<Pooled<T>>,
    all: DashMap<u64, Pooled<T>>,
    create_count: AtomicUsize,
    gate: CreateGate,
    num_interested: AtomicUsize,
}

impl<T> ObjectDeque<T> {
    fn new(fairness: bool) -> Self {
        Self {
            idle: BlockingDeque::new(fairness),
            all: DashMap::new(),
            create_count: AtomicUsize::new(0),
            gate: CreateGate::new(),
            num_interested: AtomicUsize::new(0),
        }
    }

    fn num_active(&self) -> usize {
        self.all.len().saturating_sub(self.idle.len())
    }
}

/// Keeps a key's sub-pool alive while an operation is using it
struct Registration<'a, K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: KeyedPooledObjectFactory<K, T> + 'static,
{
    pool: &'a KeyedInner<K, T, F>,
    key: &'a K,
    deque: Arc<ObjectDeque<T>>,
}

impl<K, T, F> Deref for Registration<'_, K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: KeyedPooledObjectFactory<K, T> + 'static,
{
    type Target = ObjectDeque<T>;

    fn deref(&self) -> &Self::Target {
        &self.deque
    }
}

impl<K, T, F> Drop for Registration<'_, K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: KeyedPooledObjectFactory<K, T> + 'static,
{
    fn drop(&mut self) {
        self.pool.deregister(self.key);
    }
}

/// Where the evictor resumes on its next run
struct KeyedCursor<K, T> {
    /// Keys still to visit, next key last
    keys: Vec<K>,
    current: Option<(K, Arc<ObjectDeque<T>>)>,
    /// Idle objects of the current key still to visit, next object last
    objects: Vec<Pooled<T>>,
}

impl<K, T> Default for KeyedCursor<K, T> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            current: None,
            objects: Vec::new(),
        }
    }
}

/// Thread-safe pool of objects grouped by key
///
/// # Examples
///
/// ```
/// use generic_objectpool::{BoxError, GenericKeyedObjectPool, KeyedPoolConfig, KeyedPooledObjectFactory};
///
/// struct Connections;
///
/// impl KeyedPooledObjectFactory<String, String> for Connections {
///     fn make_object(&self, host: &String) -> Result<String, BoxError> {
///         Ok(format!("connection to {host}"))
///     }
/// }
///
/// let pool = GenericKeyedObjectPool::new(Connections, KeyedPoolConfig::new().with_max_total_per_key(2));
/// let db = "db".to_string();
///
/// let conn = pool.borrow_object(&db).unwrap();
/// assert_eq!(conn.object(), "connection to db");
/// assert_eq!(pool.num_active_key(&db), 1);
///
/// pool.return_object(&db, conn).unwrap();
/// assert_eq!(pool.num_idle_key(&db), 1);
/// ```
pub struct GenericKeyedObjectPool<K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: KeyedPooledObjectFactory<K, T> + 'static,
{
    inner: Arc<KeyedInner<K, T, F>>,
}

struct KeyedInner<K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: KeyedPooledObjectFactory<K, T> + 'static,
{
    factory: F,
    config: RwLock<KeyedPoolConfig<T>>,
    fairness: bool,
    pool_map: DashMap<K, Arc<ObjectDeque<T>>>,
    /// Keys in registration order. Keys enter and leave `pool_map` only
    /// while this lock is held for writing.
    key_list: RwLock<Vec<K>>,
    num_total: AtomicUsize,
    eviction_cursor: Mutex<KeyedCursor<K, T>>,
    base: PoolBase,
}

impl<K, T, F> GenericKeyedObjectPool<K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: KeyedPooledObjectFactory<K, T> + 'static,
{
    /// Create a keyed pool and start its evictor if the config schedules one
    pub fn new(factory: F, config: KeyedPoolConfig<T>) -> Self {
        Self::build(factory, config, None)
    }

    /// Create a pool that reclaims objects its borrowers never return
    pub fn with_abandoned_config(factory: F, config: KeyedPoolConfig<T>, abandoned: AbandonedConfig) -> Self {
        Self::build(factory, config, Some(abandoned))
    }

    fn build(factory: F, config: KeyedPoolConfig<T>, abandoned: Option<AbandonedConfig>) -> Self {
        let inner = KeyedInner {
            factory,
            fairness: config.common.fairness,
            config: RwLock::new(config),
            pool_map: DashMap::new(),
            key_list: RwLock::new(Vec::new()),
            num_total: AtomicUsize::new(0),
            eviction_cursor: Mutex::new(KeyedCursor::default()),
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

    /// Borrow an object for `key`, waiting at most the configured `max_wait`
    pub fn borrow_object(&self, key: &K) -> PoolResult<Pooled<T>> {
        let max_wait = self.inner.config.read().common.max_wait;
        self.inner.borrow(key, max_wait)
    }

    /// Borrow an object for `key`, waiting at most `max_wait` (`None` waits
    /// indefinitely)
    pub fn borrow_object_timeout(&self, key: &K, max_wait: Option<Duration>) -> PoolResult<Pooled<T>> {
        self.inner.borrow(key, max_wait)
    }

    /// Borrow an object for `key` wrapped in a guard that returns it on drop
    pub fn lease(&self, key: &K) -> PoolResult<Lease<T>> {
        let object = self.borrow_object(key)?;
        Ok(Lease::new(object, self.release_fn(key.clone())))
    }

    /// Borrow from async code without blocking the runtime
    pub async fn lease_async(&self, key: &K) -> PoolResult<Lease<T>> {
        let pool = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || pool.lease(&key))
            .await
            .map_err(|e| PoolError::illegal_state(format!("borrow task failed: {e}")))?
    }

    /// Async counterpart of [`borrow_object`](Self::borrow_object)
    pub async fn borrow_object_async(&self, key: &K) -> PoolResult<Pooled<T>> {
        self.lease_async(key).await.map(Lease::detach)
    }

    fn release_fn(&self, key: K) -> ReleaseFn<T> {
        let pool = Arc::clone(&self.inner);
        Arc::new(move |object: Pooled<T>, disposition: Disposition| {
            let result = match disposition {
                Disposition::Return => pool.return_object(&key, object),
                Disposition::Invalidate => pool.invalidate_object(&key, &object, DestroyMode::Normal),
            };
            pool.base.swallow_result(result);
        })
    }

    /// Give a borrowed object back to the sub-pool of `key`
    pub fn return_object(&self, key: &K, object: Pooled<T>) -> PoolResult<()> {
        self.inner.return_object(key, object)
    }

    /// Destroy a borrowed object instead of returning it
    pub fn invalidate_object(&self, key: &K, object: &Pooled<T>) -> PoolResult<()> {
        self.inner.invalidate_object(key, object, DestroyMode::Normal)
    }

    /// Destroy a borrowed object, passing `mode` to the factory
    pub fn invalidate_object_with_mode(&self, key: &K, object: &Pooled<T>, mode: DestroyMode) -> PoolResult<()> {
        self.inner.invalidate_object(key, object, mode)
    }

    /// Create one idle object for `key`. Does nothing at capacity.
    pub fn add_object(&self, key: &K) -> PoolResult<()> {
        self.inner.add_object(key)
    }

    /// Fill the idle deque of `key` up to `min_idle_per_key`
    pub fn prepare_pool(&self, key: &K) -> PoolResult<()> {
        if self.inner.config.read().effective_min_idle_per_key() < 1 {
            return Ok(());
        }
        self.inner.ensure_min_idle_key(key)
    }

    /// Destroy the idle objects of every key
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Destroy the idle objects of `key` and hand the freed capacity to the
    /// keys with the most waiting borrowers
    pub fn clear_key(&self, key: &K) {
        self.inner.clear_key(key, true);
    }

    /// Destroy the idle objects of `key`, optionally handing the freed
    /// capacity to borrowers waiting on other keys
    pub fn clear_key_with_reuse(&self, key: &K, reuse_capacity: bool) {
        self.inner.clear_key(key, reuse_capacity);
    }

    /// Destroy the oldest 15% (plus one) of the idle objects across all keys
    pub fn clear_oldest(&self) {
        self.inner.clear_oldest();
    }

    /// Run one eviction pass, resuming where the previous one stopped
    pub fn evict(&self) -> PoolResult<()> {
        self.inner.evict()
    }

    /// Create idle objects until every key has `min_idle_per_key` available
    pub fn ensure_min_idle(&self) -> PoolResult<()> {
        self.inner.ensure_min_idle()
    }

    /// Close the pool: stop the evictor, destroy idle objects of every key
    /// and wake blocked borrowers with [`PoolError::Closed`]
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.inner.base.is_closed()
    }

    /// Record that a borrowed object is still in use
    pub fn use_object(&self, object: &PooledObject<T>) {
        let tracking = self
            .inner
            .base
            .abandoned_config()
            .is_some_and(|c| c.use_usage_tracking);
        if tracking {
            if let Some((_, _, p)) = self.inner.find_anywhere(object.id()) {
                p.mark_used();
            }
        }
    }

    /// Keys that currently have a sub-pool
    pub fn keys(&self) -> Vec<K> {
        self.inner.key_list.read().clone()
    }

    /// Idle objects across all keys
    pub fn num_idle(&self) -> usize {
        self.inner.num_idle()
    }

    /// Borrowed objects across all keys
    pub fn num_active(&self) -> usize {
        self.inner.num_active()
    }

    /// Idle objects for `key`
    pub fn num_idle_key(&self, key: &K) -> usize {
        self.inner.deque(key).map_or(0, |d| d.idle.len())
    }

    /// Borrowed objects for `key`
    pub fn num_active_key(&self, key: &K) -> usize {
        self.inner.deque(key).map_or(0, |d| d.num_active())
    }

    /// Borrowed objects for each known key
    pub fn num_active_per_key(&self) -> HashMap<K, usize> {
        self.inner
            .entries()
            .into_iter()
            .map(|(key, deque)| (key, deque.num_active()))
            .collect()
    }

    /// Threads blocked waiting for an object of any key
    pub fn num_waiters(&self) -> usize {
        self.inner.num_waiters()
    }

    /// Blocked borrowers for each key that has any
    pub fn num_waiters_by_key(&self) -> HashMap<K, usize> {
        let block = self.inner.config.read().common.block_when_exhausted;
        self.inner
            .entries()
            .into_iter()
            .map(|(key, deque)| (key, if block { deque.idle.take_queue_length() } else { 0 }))
            .collect()
    }

    /// The factory this pool creates objects with
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Copy of the current configuration
    pub fn config(&self) -> KeyedPoolConfig<T> {
        self.inner.config.read().clone()
    }

    /// Replace the configuration and reschedule the evictor.
    ///
    /// Fairness is fixed when the pool is created and is not changed.
    pub fn set_config(&self, config: KeyedPoolConfig<T>) {
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

    /// Get current metrics, summed over all keys
    pub fn metrics(&self) -> PoolMetrics {
        self.inner
            .base
            .stats
            .get_metrics(self.num_active(), self.num_idle(), self.num_waiters())
    }
}

impl<K, T, F> Clone for GenericKeyedObjectPool<K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: KeyedPooledObjectFactory<K, T> + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T, F> fmt::Debug for GenericKeyedObjectPool<K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: KeyedPooledObjectFactory<K, T> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericKeyedObjectPool")
            .field("keys", &self.inner.key_list.read().len())
            .field("total", &self.inner.num_total.load(Ordering::SeqCst))
            .field("idle", &self.num_idle())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<K, T, F> KeyedInner<K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: KeyedPooledObjectFactory<K, T> + 'static,
{
    fn deque(&self, key: &K) -> Option<Arc<ObjectDeque<T>>> {
        self.pool_map.get(key).map(|d| Arc::clone(d.value()))
    }

    /// Snapshot of every sub-pool. Callers iterate the snapshot rather than
    /// the map so they are free to register and deregister keys.
    fn entries(&self) -> Vec<(K, Arc<ObjectDeque<T>>)> {
        self.pool_map
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    fn find(&self, key: &K, id: u64) -> Option<(Arc<ObjectDeque<T>>, Pooled<T>)> {
        let deque = self.deque(key)?;
        let p = deque.all.get(&id).map(|p| Arc::clone(p.value()))?;
        Some((deque, p))
    }

    fn find_anywhere(&self, id: u64) -> Option<(K, Arc<ObjectDeque<T>>, Pooled<T>)> {
        self.entries().into_iter().find_map(|(key, deque)| {
            let p = deque.all.get(&id).map(|p| Arc::clone(p.value()))?;
            Some((key, deque, p))
        })
    }

    fn num_idle(&self) -> usize {
        self.pool_map.iter().map(|d| d.idle.len()).sum()
    }

    fn num_active(&self) -> usize {
        self.num_total.load(Ordering::SeqCst).saturating_sub(self.num_idle())
    }

    fn num_waiters(&self) -> usize {
        if self.config.read().common.block_when_exhausted {
            self.pool_map.iter().map(|d| d.idle.take_queue_length()).sum()
        } else {
            0
        }
    }

    fn has_borrow_waiters(&self) -> bool {
        self.config.read().common.block_when_exhausted
            && self.pool_map.iter().any(|d| d.idle.has_take_waiters())
    }

    fn register<'a>(&'a self, key: &'a K) -> Registration<'a, K, T, F> {
        {
            let _keys = self.key_list.read();
            if let Some(deque) = self.deque(key) {
                deque.num_interested.fetch_add(1, Ordering::SeqCst);
                return Registration { pool: self, key, deque };
            }
        }

        let mut keys = self.key_list.write();
        let deque = match self.deque(key) {
            Some(deque) => deque,
            None => {
                let deque = Arc::new(ObjectDeque::new(self.fairness));
                self.pool_map.insert(key.clone(), Arc::clone(&deque));
                keys.push(key.clone());
                deque
            }
        };
        deque.num_interested.fetch_add(1, Ordering::SeqCst);
        Registration { pool: self, key, deque }
    }

    /// Drop one unit of interest in `key`, removing its sub-pool once nobody
    /// is interested and it holds no objects
    fn deregister(&self, key: &K) {
        let removable = {
            let _keys = self.key_list.read();
            let Some(deque) = self.deque(key) else {
                return;
            };
            let previous = deque.num_interested.fetch_sub(1, Ordering::SeqCst);
            previous == 1 && deque.create_count.load(Ordering::SeqCst) == 0
        };
        if !removable {
            return;
        }

        let mut keys = self.key_list.write();
        let unused = self.deque(key).is_some_and(|d| {
            d.num_interested.load(Ordering::SeqCst) == 0 && d.create_count.load(Ordering::SeqCst) == 0
        });
        if unused {
            self.pool_map.remove(key);
            keys.retain(|k| k != key);
        }
    }

    fn borrow(&self, key: &K, max_wait: Option<Duration>) -> PoolResult<Pooled<T>> {
        self.base.assert_open()?;

        let (max_total, block_when_exhausted, test_on_borrow) = {
            let config = self.config.read();
            (config.max_total, config.common.block_when_exhausted, config.common.test_on_borrow)
        };

        if let Some(abandoned) = self.base.abandoned_sweep_on_borrow(self.num_idle(), self.num_active(), max_total) {
            self.remove_abandoned(&abandoned);
        }

        let started = Instant::now();
        let deadline = max_wait.and_then(|wait| started.checked_add(wait));
        let registration = self.register(key);

        loop {
            let mut created = false;
            let p = match registration.idle.poll_first() {
                Some(p) => p,
                None => match self.create(key, &registration)? {
                    Some(p) => {
                        created = true;
                        p
                    }
                    None if block_when_exhausted => self.wait_for_idle(&registration.idle, deadline, max_wait)?,
                    None => return Err(PoolError::Exhausted),
                },
            };

            if !p.allocate() {
                continue;
            }

            if let Err(e) = self.factory.activate_object(key, &p) {
                self.destroy(key, &p, true, DestroyMode::Normal);
                if created {
                    return Err(PoolError::activation(e));
                }
                continue;
            }

            if test_on_borrow && !self.factory.validate_object(key, &p) {
                if self.destroy(key, &p, true, DestroyMode::Normal) {
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

    fn wait_for_idle(
        &self,
        idle: &BlockingDeque<Pooled<T>>,
        deadline: Option<Instant>,
        max_wait: Option<Duration>,
    ) -> PoolResult<Pooled<T>> {
        self.base.assert_open()?;
        let polled = match (deadline, max_wait) {
            (Some(deadline), Some(_)) => idle.poll_first_timeout(deadline.saturating_duration_since(Instant::now())),
            _ => idle.take_first().map(Some),
        };
        match polled {
            Ok(Some(p)) => Ok(p),
            Ok(None) => Err(PoolError::Timeout(max_wait.unwrap_or_default())),
            Err(PoolError::Interrupted) if self.base.is_closed() => Err(PoolError::Closed),
            Err(e) => Err(e),
        }
    }

    /// Make a new object for `key`. The caller must hold a registration.
    fn create(&self, key: &K, deque: &ObjectDeque<T>) -> PoolResult<Option<Pooled<T>>> {
        let (max_total, max_total_per_key, test_on_create) = {
            let config = self.config.read();
            (config.max_total, config.max_total_per_key, config.common.test_on_create)
        };

        if let Some(max_total) = max_total {
            loop {
                if self.num_total.fetch_add(1, Ordering::SeqCst) < max_total {
                    break;
                }
                self.num_total.fetch_sub(1, Ordering::SeqCst);
                if self.num_idle() == 0 || self.clear_oldest() == 0 {
                    return Ok(None);
                }
            }
        } else {
            self.num_total.fetch_add(1, Ordering::SeqCst);
        }

        let Some(slot) = deque
            .gate
            .acquire(&deque.create_count, max_total_per_key.unwrap_or(usize::MAX), None)
        else {
            self.num_total.fetch_sub(1, Ordering::SeqCst);
            return Ok(None);
        };

        let give_back = || {
            self.num_total.fetch_sub(1, Ordering::SeqCst);
            deque.create_count.fetch_sub(1, Ordering::SeqCst);
        };

        let p = match self.factory.make_object(key) {
            Ok(object) => Arc::new(PooledObject::new(object)),
            Err(e) => {
                give_back();
                drop(slot);
                return Err(PoolError::factory(e));
            }
        };

        if test_on_create && !self.factory.validate_object(key, &p) {
            give_back();
            drop(slot);
            debug!(object_id = p.id(), "new object failed validation");
            if let Err(e) = self.factory.destroy_object(key, &p, DestroyMode::Normal) {
                self.base.swallow(PoolError::destroy(e));
            }
            return Ok(None);
        }
        drop(slot);

        if self.base.abandoned_config().is_some_and(|c| c.log_abandoned) {
            p.set_log_abandoned(true);
        }
        self.base.stats.created.fetch_add(1, Ordering::Relaxed);
        deque.all.insert(p.id(), Arc::clone(&p));
        debug!(object_id = p.id(), "created pooled object");
        Ok(Some(p))
    }

    /// Destroy `p`. Unless `always` is set, only an object that is idle and
    /// not under an eviction test is destroyed. Returns whether this call did
    /// the destruction.
    fn destroy(&self, key: &K, p: &Pooled<T>, always: bool, mode: DestroyMode) -> bool {
        let registration = self.register(key);
        let claimed = if always {
            p.invalidate()
        } else {
            p.invalidate_if_idle(|| registration.idle.remove(p))
        };
        if !claimed {
            return false;
        }

        registration.idle.remove(p);
        registration.all.remove(&p.id());
        let result = self.factory.destroy_object(key, p, mode);
        registration.create_count.fetch_sub(1, Ordering::SeqCst);
        self.num_total.fetch_sub(1, Ordering::SeqCst);
        self.base.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(object_id = p.id(), ?mode, "destroyed pooled object");
        if let Err(e) = result {
            self.base.swallow(PoolError::destroy(e));
        }
        true
    }

    fn push_idle(&self, deque: &ObjectDeque<T>, p: Pooled<T>) {
        if self.config.read().common.lifo {
            deque.idle.offer_first(p);
        } else {
            deque.idle.offer_last(p);
        }
    }

    fn add_idle_object(&self, key: &K, deque: &ObjectDeque<T>, p: Pooled<T>) -> PoolResult<()> {
        if let Err(e) = self.factory.passivate_object(key, &p) {
            self.destroy(key, &p, true, DestroyMode::Normal);
            return Err(PoolError::passivation(e));
        }
        self.push_idle(deque, p);
        Ok(())
    }

    fn add_object(&self, key: &K) -> PoolResult<()> {
        self.base.assert_open()?;
        let registration = self.register(key);
        let Some(p) = self.create(key, &registration)? else {
            return Ok(());
        };
        self.add_idle_object(key, &registration, p)?;
        drop(registration);
        if self.base.is_closed() {
            self.clear_key(key, false);
        }
        Ok(())
    }

    fn return_object(&self, key: &K, object: Pooled<T>) -> PoolResult<()> {
        let Some((deque, p)) = self.find(key, object.id()) else {
            if self.base.has_abandoned_config() {
                return Ok(());
            }
            return Err(PoolError::illegal_state(
                "Returned object not currently part of this pool under the given key",
            ));
        };

        if !p.mark_returning() {
            return Err(PoolError::illegal_state(
                "Object has already been returned to this pool or is invalid",
            ));
        }
        let active_time = p.active_duration();
        let result = self.recycle(key, &deque, p);

        if self.has_borrow_waiters() {
            self.reuse_capacity();
        }
        self.base.stats.record_return(active_time);
        result
    }

    fn recycle(&self, key: &K, deque: &ObjectDeque<T>, p: Pooled<T>) -> PoolResult<()> {
        let (test_on_return, max_idle_per_key) = {
            let config = self.config.read();
            (config.common.test_on_return, config.max_idle_per_key)
        };

        let healthy = if test_on_return && !self.factory.validate_object(key, &p) {
            false
        } else if let Err(e) = self.factory.passivate_object(key, &p) {
            self.base.swallow(PoolError::passivation(e));
            false
        } else {
            true
        };
        if !healthy {
            self.destroy(key, &p, true, DestroyMode::Normal);
            if deque.idle.has_take_waiters() {
                self.base.swallow_result(self.add_object(key));
            }
            return Ok(());
        }

        if !p.deallocate() {
            return Err(PoolError::illegal_state("Object has already been returned to this pool"));
        }

        if self.base.is_closed() || max_idle_per_key.is_some_and(|max| deque.idle.len() >= max) {
            self.destroy(key, &p, true, DestroyMode::Normal);
        } else {
            self.push_idle(deque, p);
            if self.base.is_closed() {
                // closed while the object was being queued
                self.clear_key(key, false);
            }
        }
        Ok(())
    }

    fn invalidate_object(&self, key: &K, object: &PooledObject<T>, mode: DestroyMode) -> PoolResult<()> {
        let Some((_, p)) = self.find(key, object.id()) else {
            if self.base.has_abandoned_config() {
                return Ok(());
            }
            return Err(PoolError::illegal_state("Object not currently part of this pool"));
        };
        if self.destroy(key, &p, true, mode) {
            self.reuse_capacity();
        }
        Ok(())
    }

    /// Create one object for the key with the longest queue of waiting
    /// borrowers that is still below its per-key limit
    fn reuse_capacity(&self) {
        let max_total_per_key = self.config.read().max_total_per_key.unwrap_or(usize::MAX);
        let mut most_loaded: Option<(K, usize)> = None;
        for (key, deque) in self.entries() {
            let queue_length = deque.idle.take_queue_length();
            let longest = most_loaded.as_ref().map_or(0, |(_, len)| *len);
            if deque.num_active() < max_total_per_key && queue_length > longest {
                most_loaded = Some((key, queue_length));
            }
        }

        if let Some((key, _)) = most_loaded {
            let registration = self.register(&key);
            let result = match self.create(&key, &registration) {
                Ok(Some(p)) => self.add_idle_object(&key, &registration, p),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            drop(registration);
            self.base.swallow_result(result);
        }
    }

    fn clear(&self) {
        let keys = self.key_list.read().clone();
        for key in keys {
            self.clear_key(&key, false);
        }
    }

    fn clear_key(&self, key: &K, reuse_capacity: bool) {
        if !self.pool_map.contains_key(key) {
            return;
        }
        let freed = {
            let registration = self.register(key);
            let mut freed = 0;
            for p in registration.idle.drain() {
                if self.destroy(key, &p, true, DestroyMode::Normal) {
                    freed += 1;
                }
            }
            freed
        };
        if reuse_capacity {
            for _ in 0..freed.max(1) {
                self.reuse_capacity();
            }
        }
    }

    /// Destroy the oldest idle objects pool-wide. Returns how many were
    /// destroyed.
    fn clear_oldest(&self) -> usize {
        let mut candidates: Vec<(Instant, u64, K, Pooled<T>)> = Vec::new();
        for (key, deque) in self.entries() {
            for p in deque.idle.snapshot() {
                candidates.push((p.last_returned_at(), p.id(), key.clone(), p));
            }
        }
        candidates.sort_by_key(|(returned_at, id, _, _)| (*returned_at, *id));

        let mut to_remove = (candidates.len() as f64 * CLEAR_OLDEST_FRACTION) as usize + 1;
        let mut destroyed = 0;
        for (_, _, key, p) in candidates {
            if to_remove == 0 {
                break;
            }
            if self.destroy(&key, &p, false, DestroyMode::Normal) {
                to_remove -= 1;
                destroyed += 1;
            }
        }
        debug!(destroyed, "cleared oldest idle objects");
        destroyed
    }

    /// Objects still needed for `key` to reach its idle floor
    fn calculate_deficit(&self, deque: Option<&ObjectDeque<T>>) -> usize {
        let (min_idle, max_total_per_key, max_total) = {
            let config = self.config.read();
            (config.effective_min_idle_per_key(), config.max_total_per_key, config.max_total)
        };
        let Some(deque) = deque else {
            return min_idle;
        };

        let idle = deque.idle.len();
        let mut deficit = min_idle.saturating_sub(idle);
        if let Some(per_key) = max_total_per_key {
            deficit = deficit.min(per_key.saturating_sub(deque.all.len()));
        }
        if let Some(max_total) = max_total {
            deficit = deficit.min(max_total.saturating_sub(self.num_total.load(Ordering::SeqCst)));
        }
        deficit
    }

    fn ensure_min_idle(&self) -> PoolResult<()> {
        if self.config.read().effective_min_idle_per_key() < 1 {
            return Ok(());
        }
        for (key, _) in self.entries() {
            self.ensure_min_idle_key(&key)?;
        }
        Ok(())
    }

    fn ensure_min_idle_key(&self, key: &K) -> PoolResult<()> {
        let deficit = self.calculate_deficit(self.deque(key).as_deref());
        for _ in 0..deficit {
            if self.calculate_deficit(self.deque(key).as_deref()) == 0 {
                break;
            }
            self.add_object(key)?;
        }
        Ok(())
    }

    fn evict(&self) -> PoolResult<()> {
        self.base.assert_open()?;

        let idle_total = self.num_idle();
        if idle_total > 0 {
            let mut cursor = self.eviction_cursor.lock();
            let (policy, eviction_config, test_while_idle, lifo, num_tests) = {
                let config = self.config.read();
                (
                    Arc::clone(&config.common.eviction_policy),
                    EvictionConfig::new(
                        config.common.min_evictable_idle,
                        config.common.soft_min_evictable_idle,
                        config.effective_min_idle_per_key(),
                    ),
                    config.common.test_while_idle,
                    config.common.lifo,
                    config.common.num_tests(idle_total),
                )
            };

            let mut misses_left = 2 * idle_total + 1;
            let mut tested = 0;
            while tested < num_tests {
                let Some((key, deque, under_test)) = self.next_eviction_candidate(&mut cursor, lifo) else {
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
                self.test_idle_object(&key, &deque, &under_test, policy.as_ref(), &eviction_config, test_while_idle);
            }
        }

        if let Some(abandoned) = self.base.abandoned_config() {
            if abandoned.remove_abandoned_on_maintenance {
                self.remove_abandoned(&abandoned);
            }
        }
        Ok(())
    }

    /// Advance the cursor to the next idle object, moving on to the next key
    /// when the current one is exhausted. The key list is refreshed at most
    /// once per call.
    fn next_eviction_candidate(
        &self,
        cursor: &mut KeyedCursor<K, T>,
        lifo: bool,
    ) -> Option<(K, Arc<ObjectDeque<T>>, Pooled<T>)> {
        let mut refreshed = false;
        loop {
            if let Some((key, deque)) = &cursor.current {
                if let Some(p) = cursor.objects.pop() {
                    return Some((key.clone(), Arc::clone(deque), p));
                }
            }
            cursor.current = None;

            let key = match cursor.keys.pop() {
                Some(key) => key,
                None if refreshed => return None,
                None => {
                    refreshed = true;
                    let mut keys = self.key_list.read().clone();
                    keys.reverse();
                    cursor.keys = keys;
                    continue;
                }
            };
            let Some(deque) = self.deque(&key) else {
                continue;
            };
            // pop() takes from the back, so the oldest idle object comes first
            cursor.objects = if lifo { deque.idle.snapshot() } else { deque.idle.snapshot_rev() };
            cursor.current = Some((key, deque));
        }
    }

    fn test_idle_object(
        &self,
        key: &K,
        deque: &ObjectDeque<T>,
        under_test: &Pooled<T>,
        policy: &dyn EvictionPolicy<T>,
        eviction_config: &EvictionConfig,
        test_while_idle: bool,
    ) {
        let idle_count = deque.idle.len();
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

        if evict || (test_while_idle && !self.passes_idle_test(key, under_test)) {
            if self.destroy(key, under_test, true, DestroyMode::Normal) {
                self.base.stats.destroyed_by_evictor.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        under_test.end_eviction_test(&deque.idle);
    }

    fn passes_idle_test(&self, key: &K, p: &Pooled<T>) -> bool {
        if let Err(e) = self.factory.activate_object(key, p) {
            self.base.swallow(PoolError::activation(e));
            return false;
        }
        if !self.factory.validate_object(key, p) {
            return false;
        }
        if let Err(e) = self.factory.passivate_object(key, p) {
            self.base.swallow(PoolError::passivation(e));
            return false;
        }
        true
    }

    fn remove_abandoned(&self, config: &AbandonedConfig) {
        for (key, deque) in self.entries() {
            let borrowed: Vec<Pooled<T>> = deque.all.iter().map(|p| Arc::clone(p.value())).collect();
            for p in collect_abandoned(borrowed, config) {
                let result = self.invalidate_object(&key, &p, DestroyMode::Abandoned);
                self.base.swallow_result(result);
            }
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
            for (_, deque) in self.entries() {
                deque.idle.interrupt_take_waiters();
            }
            // waiters woken above may have left keys behind
            self.clear();
        });
    }
}

impl<K, T, F> Drop for KeyedInner<K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: KeyedPooledObjectFactory<K, T> + 'static,
{
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxError;
    use crate::pooled_object::PooledObjectState;
    use std::thread;

    #[derive(Default)]
    struct Labels {
        made: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl KeyedPooledObjectFactory<&'static str, String> for Labels {
        fn make_object(&self, key: &&'static str) -> Result<String, BoxError> {
            let n = self.made.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{key}-{n}"))
        }

        fn destroy_object(&self, _key: &&'static str, _p: &PooledObject<String>, _mode: DestroyMode) -> Result<(), BoxError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool(config: KeyedPoolConfig<String>) -> GenericKeyedObjectPool<&'static str, String, Labels> {
        GenericKeyedObjectPool::new(Labels::default(), config)
    }

    #[test]
    fn test_keys_are_isolated() {
        let pool = pool(KeyedPoolConfig::default());
        let a = pool.borrow_object(&"a").unwrap();
        let b = pool.borrow_object(&"b").unwrap();
        assert!(a.object().starts_with("a-"));
        assert!(b.object().starts_with("b-"));
        pool.return_object(&"a", a).unwrap();
        assert_eq!(pool.num_idle_key(&"a"), 1);
        assert_eq!(pool.num_idle_key(&"b"), 0);
        assert_eq!(pool.num_active_key(&"b"), 1);
        assert_eq!(pool.num_active(), 1);
        assert_eq!(pool.keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_return_under_wrong_key_fails() {
        let pool = pool(KeyedPoolConfig::default());
        let a = pool.borrow_object(&"a").unwrap();
        assert!(matches!(pool.return_object(&"b", Arc::clone(&a)), Err(PoolError::IllegalState(_))));
        pool.return_object(&"a", a).unwrap();
    }

    #[test]
    fn test_per_key_cap_non_blocking() {
        let pool = pool(KeyedPoolConfig::new().with_max_total_per_key(1).with_block_when_exhausted(false));
        let _a = pool.borrow_object(&"a").unwrap();
        assert!(matches!(pool.borrow_object(&"a"), Err(PoolError::Exhausted)));
        assert!(pool.borrow_object(&"b").is_ok());
    }

    #[test]
    fn test_global_cap_clears_oldest_idle() {
        let pool = pool(
            KeyedPoolConfig::new()
                .with_max_total(2)
                .with_block_when_exhausted(false),
        );
        let a = pool.borrow_object(&"a").unwrap();
        let b = pool.borrow_object(&"b").unwrap();
        pool.return_object(&"a", a).unwrap();
        pool.return_object(&"b", b).unwrap();

        // "a" went idle first, so it makes room for "c"
        let c = pool.borrow_object(&"c").unwrap();
        assert!(c.object().starts_with("c-"));
        assert_eq!(pool.num_idle_key(&"a"), 0);
        assert_eq!(pool.num_idle_key(&"b"), 1);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_cap_with_nothing_idle_is_exhausted() {
        let pool = pool(KeyedPoolConfig::new().with_max_total(1).with_block_when_exhausted(false));
        let _a = pool.borrow_object(&"a").unwrap();
        assert!(matches!(pool.borrow_object(&"b"), Err(PoolError::Exhausted)));
    }

    #[test]
    fn test_empty_keys_are_removed() {
        let pool = pool(KeyedPoolConfig::default());
        let a = pool.borrow_object(&"a").unwrap();
        pool.return_object(&"a", a).unwrap();
        assert_eq!(pool.keys(), vec!["a"]);
        pool.clear_key(&"a");
        assert!(pool.keys().is_empty());
        assert_eq!(pool.num_idle(), 0);
    }

    #[test]
    fn test_failed_borrow_leaves_no_key() {
        let pool = pool(KeyedPoolConfig::new().with_max_total(0).with_block_when_exhausted(false));
        assert!(pool.borrow_object(&"a").is_err());
        assert!(pool.keys().is_empty());
    }

    #[test]
    fn test_clear_oldest_fraction() {
        let pool = pool(KeyedPoolConfig::default());
        for _ in 0..7 {
            pool.add_object(&"a").unwrap();
        }
        for _ in 0..7 {
            pool.add_object(&"b").unwrap();
        }
        pool.clear_oldest();
        // 14 idle: floor(14 * 0.15) + 1 = 3 destroyed, all from the older key
        assert_eq!(pool.num_idle(), 11);
        assert_eq!(pool.num_idle_key(&"a"), 4);
        assert_eq!(pool.num_idle_key(&"b"), 7);
    }

    #[test]
    fn test_reuse_capacity_serves_waiting_key() {
        let pool = pool(KeyedPoolConfig::new().with_max_total(1).with_max_wait(Duration::from_secs(5)));
        let a = pool.borrow_object(&"a").unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.borrow_object(&"b"))
        };
        while pool.num_waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        // the idle "a" object is culled to make room for a "b" object
        pool.return_object(&"a", a).unwrap();
        let b = waiter.join().unwrap().unwrap();
        assert!(b.object().starts_with("b-"));
        assert_eq!(pool.num_idle_key(&"a"), 0);
    }

    #[test]
    fn test_ensure_min_idle_per_key() {
        let pool = pool(KeyedPoolConfig::new().with_min_idle_per_key(2).with_max_total(3));
        pool.prepare_pool(&"a").unwrap();
        assert_eq!(pool.num_idle_key(&"a"), 2);
        pool.prepare_pool(&"b").unwrap();
        assert_eq!(pool.num_idle_key(&"b"), 1);
        pool.ensure_min_idle().unwrap();
        assert_eq!(pool.num_idle(), 3);
    }

    #[test]
    fn test_evict_visits_every_key() {
        let pool = pool(
            KeyedPoolConfig::new()
                .with_min_evictable_idle(Duration::from_millis(1))
                .with_num_tests_per_eviction_run(-1),
        );
        pool.add_object(&"a").unwrap();
        pool.add_object(&"b").unwrap();
        pool.add_object(&"b").unwrap();
        thread::sleep(Duration::from_millis(10));
        pool.evict().unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.metrics().destroyed_by_evictor, 3);
        assert!(pool.keys().is_empty());
    }

    #[test]
    fn test_invalidate_and_lease() {
        let pool = pool(KeyedPoolConfig::default());
        let p = pool.borrow_object(&"a").unwrap();
        pool.invalidate_object(&"a", &p).unwrap();
        assert_eq!(p.state(), PooledObjectState::Invalid);
        assert!(pool.invalidate_object(&"a", &p).is_err());

        {
            let lease = pool.lease(&"a").unwrap();
            assert!(lease.starts_with("a-"));
        }
        assert_eq!(pool.num_idle_key(&"a"), 1);
        pool.lease(&"a").unwrap().invalidate();
        assert_eq!(pool.num_idle_key(&"a"), 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_destroys_idle_and_returns() {
        let pool = pool(KeyedPoolConfig::default());
        let held = pool.borrow_object(&"a").unwrap();
        pool.add_object(&"b").unwrap();
        pool.close();
        assert!(matches!(pool.borrow_object(&"a"), Err(PoolError::Closed)));
        pool.return_object(&"a", held).unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_async_borrow() {
        let pool = pool(KeyedPoolConfig::default());
        let p = pool.borrow_object_async(&"a").await.unwrap();
        assert_eq!(pool.num_active_key(&"a"), 1);
        pool.return_object(&"a", p).unwrap();
        let lease = pool.lease_async(&"a").await.unwrap();
        assert!(lease.starts_with("a-"));
    }
}
