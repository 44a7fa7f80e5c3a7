//! Pool configuration options

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::eviction::{DefaultEvictionPolicy, EvictionPolicy};
use crate::evictor::EvictionTimer;

/// Settings shared by [`PoolConfig`] and [`KeyedPoolConfig`]
pub struct CommonConfig<T> {
    /// Return idle objects most-recently-returned first
    pub lifo: bool,

    /// Serve blocked borrowers in arrival order
    pub fairness: bool,

    /// Wait for an object when the pool is exhausted instead of failing
    pub block_when_exhausted: bool,

    /// Longest time a borrow waits; `None` waits indefinitely
    pub max_wait: Option<Duration>,

    pub test_on_create: bool,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub test_while_idle: bool,

    /// Delay between evictor runs; `None` disables the evictor
    pub time_between_eviction_runs: Option<Duration>,

    /// Objects examined per evictor run. Negative values examine
    /// `ceil(idle / |n|)` objects.
    pub num_tests_per_eviction_run: i32,

    /// Idle time after which an object may be evicted
    pub min_evictable_idle: Option<Duration>,

    /// Idle time after which an object may be evicted while more than
    /// the minimum number of idle objects remain
    pub soft_min_evictable_idle: Option<Duration>,

    pub eviction_policy: Arc<dyn EvictionPolicy<T>>,

    /// Timer that runs the evictor; `None` uses [`EvictionTimer::shared`]
    pub eviction_timer: Option<Arc<EvictionTimer>>,
}

impl<T> Default for CommonConfig<T> {
    fn default() -> Self {
        Self {
            lifo: true,
            fairness: false,
            block_when_exhausted: true,
            max_wait: None,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: None,
            num_tests_per_eviction_run: 3,
            min_evictable_idle: Some(Duration::from_secs(30 * 60)),
            soft_min_evictable_idle: None,
            eviction_policy: Arc::new(DefaultEvictionPolicy),
            eviction_timer: None,
        }
    }
}

impl<T> Clone for CommonConfig<T> {
    fn clone(&self) -> Self {
        Self {
            lifo: self.lifo,
            fairness: self.fairness,
            block_when_exhausted: self.block_when_exhausted,
            max_wait: self.max_wait,
            test_on_create: self.test_on_create,
            test_on_borrow: self.test_on_borrow,
            test_on_return: self.test_on_return,
            test_while_idle: self.test_while_idle,
            time_between_eviction_runs: self.time_between_eviction_runs,
            num_tests_per_eviction_run: self.num_tests_per_eviction_run,
            min_evictable_idle: self.min_evictable_idle,
            soft_min_evictable_idle: self.soft_min_evictable_idle,
            eviction_policy: Arc::clone(&self.eviction_policy),
            eviction_timer: self.eviction_timer.clone(),
        }
    }
}

impl<T> fmt::Debug for CommonConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommonConfig")
            .field("lifo", &self.lifo)
            .field("fairness", &self.fairness)
            .field("block_when_exhausted", &self.block_when_exhausted)
            .field("max_wait", &self.max_wait)
            .field("test_on_create", &self.test_on_create)
            .field("test_on_borrow", &self.test_on_borrow)
            .field("test_on_return", &self.test_on_return)
            .field("test_while_idle", &self.test_while_idle)
            .field("time_between_eviction_runs", &self.time_between_eviction_runs)
            .field("num_tests_per_eviction_run", &self.num_tests_per_eviction_run)
            .field("min_evictable_idle", &self.min_evictable_idle)
            .field("soft_min_evictable_idle", &self.soft_min_evictable_idle)
            .finish_non_exhaustive()
    }
}

impl<T> CommonConfig<T> {
    /// Number of idle objects one eviction run examines
    pub(crate) fn num_tests(&self, idle: usize) -> usize {
        let n = self.num_tests_per_eviction_run;
        if n >= 0 {
            (n as usize).min(idle)
        } else {
            idle.div_ceil(n.unsigned_abs() as usize)
        }
    }
}

macro_rules! common_builders {
    ($config:ident) => {
        impl<T> $config<T> {
            /// Serve idle objects last-in-first-out (`true`) or first-in-first-out
            pub fn with_lifo(mut self, lifo: bool) -> Self {
                self.common.lifo = lifo;
                self
            }

            /// Serve blocked borrowers in arrival order
            pub fn with_fairness(mut self, fairness: bool) -> Self {
                self.common.fairness = fairness;
                self
            }

            /// Wait for an object when the pool is exhausted instead of failing
            pub fn with_block_when_exhausted(mut self, block: bool) -> Self {
                self.common.block_when_exhausted = block;
                self
            }

            /// Bound how long a borrow may wait for an object
            pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
                self.common.max_wait = Some(max_wait);
                self
            }

            /// Validate objects right after the factory makes them
            pub fn with_test_on_create(mut self, enabled: bool) -> Self {
                self.common.test_on_create = enabled;
                self
            }

            /// Validate objects before handing them to a borrower
            pub fn with_test_on_borrow(mut self, enabled: bool) -> Self {
                self.common.test_on_borrow = enabled;
                self
            }

            /// Validate objects when they are returned
            pub fn with_test_on_return(mut self, enabled: bool) -> Self {
                self.common.test_on_return = enabled;
                self
            }

            /// Validate idle objects the evictor keeps
            pub fn with_test_while_idle(mut self, enabled: bool) -> Self {
                self.common.test_while_idle = enabled;
                self
            }

            /// Run the evictor every `period`
            pub fn with_time_between_eviction_runs(mut self, period: Duration) -> Self {
                self.common.time_between_eviction_runs = Some(period);
                self
            }

            /// Objects examined per eviction run; a negative `n` examines `1/|n|` of the idle objects
            pub fn with_num_tests_per_eviction_run(mut self, n: i32) -> Self {
                self.common.num_tests_per_eviction_run = n;
                self
            }

            /// Idle time after which an object may be evicted
            pub fn with_min_evictable_idle(mut self, idle: Duration) -> Self {
                self.common.min_evictable_idle = Some(idle);
                self
            }

            /// Idle time after which an object may be evicted while more than the minimum are idle
            pub fn with_soft_min_evictable_idle(mut self, idle: Duration) -> Self {
                self.common.soft_min_evictable_idle = Some(idle);
                self
            }

            /// Replace the policy that decides which idle objects to evict
            pub fn with_eviction_policy(mut self, policy: Arc<dyn EvictionPolicy<T>>) -> Self {
                self.common.eviction_policy = policy;
                self
            }

            /// Run the evictor on a dedicated timer instead of the shared one
            pub fn with_eviction_timer(mut self, timer: Arc<EvictionTimer>) -> Self {
                self.common.eviction_timer = Some(timer);
                self
            }
        }
    };
}

/// Configuration for [`GenericObjectPool`](crate::GenericObjectPool)
///
/// # Examples
///
/// ```
/// use generic_objectpool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::<i32>::new()
///     .with_max_total(20)
///     .with_max_idle(10)
///     .with_min_idle(2)
///     .with_max_wait(Duration::from_secs(5));
///
/// assert_eq!(config.max_total, Some(20));
/// assert_eq!(config.effective_min_idle(), 2);
/// ```
pub struct PoolConfig<T> {
    pub common: CommonConfig<T>,

    /// Maximum number of live objects; `None` is unlimited
    pub max_total: Option<usize>,

    /// Maximum number of idle objects; `None` is unlimited
    pub max_idle: Option<usize>,

    /// Number of idle objects the evictor tries to keep available
    pub min_idle: usize,
}

impl<T> Default for PoolConfig<T> {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            max_total: Some(8),
            max_idle: Some(8),
            min_idle: 0,
        }
    }
}

impl<T> Clone for PoolConfig<T> {
    fn clone(&self) -> Self {
        Self {
            common: self.common.clone(),
            max_total: self.max_total,
            max_idle: self.max_idle,
            min_idle: self.min_idle,
        }
    }
}

impl<T> fmt::Debug for PoolConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("common", &self.common)
            .field("max_total", &self.max_total)
            .field("max_idle", &self.max_idle)
            .field("min_idle", &self.min_idle)
            .finish()
    }
}

impl<T> PoolConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of live objects
    pub fn with_max_total(mut self, max_total: usize) -> Self {
        self.max_total = Some(max_total);
        self
    }

    /// Remove the cap on live objects
    pub fn with_unlimited_total(mut self) -> Self {
        self.max_total = None;
        self
    }

    /// Cap the number of idle objects kept on return
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    /// Number of idle objects the evictor keeps ready
    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// `min_idle` clamped to `max_idle`
    pub fn effective_min_idle(&self) -> usize {
        self.max_idle.map_or(self.min_idle, |max| self.min_idle.min(max))
    }
}

common_builders!(PoolConfig);

/// Configuration for [`GenericKeyedObjectPool`](crate::GenericKeyedObjectPool)
///
/// # Examples
///
/// ```
/// use generic_objectpool::KeyedPoolConfig;
///
/// let config = KeyedPoolConfig::<String>::new()
///     .with_max_total(5)
///     .with_max_total_per_key(2);
///
/// assert_eq!(config.max_total, Some(5));
/// assert_eq!(config.max_total_per_key, Some(2));
/// ```
pub struct KeyedPoolConfig<T> {
    pub common: CommonConfig<T>,

    /// Maximum number of live objects across all keys; `None` is unlimited
    pub max_total: Option<usize>,

    /// Maximum number of live objects per key; `None` is unlimited
    pub max_total_per_key: Option<usize>,

    /// Maximum number of idle objects per key; `None` is unlimited
    pub max_idle_per_key: Option<usize>,

    /// Number of idle objects per key the evictor tries to keep available
    pub min_idle_per_key: usize,
}

impl<T> Default for KeyedPoolConfig<T> {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            max_total: None,
            max_total_per_key: Some(8),
            max_idle_per_key: Some(8),
            min_idle_per_key: 0,
        }
    }
}

impl<T> Clone for KeyedPoolConfig<T> {
    fn clone(&self) -> Self {
        Self {
            common: self.common.clone(),
            max_total: self.max_total,
            max_total_per_key: self.max_total_per_key,
            max_idle_per_key: self.max_idle_per_key,
            min_idle_per_key: self.min_idle_per_key,
        }
    }
}

impl<T> fmt::Debug for KeyedPoolConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedPoolConfig")
            .field("common", &self.common)
            .field("max_total", &self.max_total)
            .field("max_total_per_key", &self.max_total_per_key)
            .field("max_idle_per_key", &self.max_idle_per_key)
            .field("min_idle_per_key", &self.min_idle_per_key)
            .finish()
    }
}

impl<T> KeyedPoolConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of live objects across all keys
    pub fn with_max_total(mut self, max_total: usize) -> Self {
        self.max_total = Some(max_total);
        self
    }

    /// Cap the number of live objects for each key
    pub fn with_max_total_per_key(mut self, max: usize) -> Self {
        self.max_total_per_key = Some(max);
        self
    }

    /// Cap the number of idle objects kept for each key
    pub fn with_max_idle_per_key(mut self, max: usize) -> Self {
        self.max_idle_per_key = Some(max);
        self
    }

    /// Number of idle objects the evictor keeps ready for each key
    pub fn with_min_idle_per_key(mut self, min: usize) -> Self {
        self.min_idle_per_key = min;
        self
    }

    /// `min_idle_per_key` clamped to `max_idle_per_key`
    pub fn effective_min_idle_per_key(&self) -> usize {
        self.max_idle_per_key
            .map_or(self.min_idle_per_key, |max| self.min_idle_per_key.min(max))
    }
}

common_builders!(KeyedPoolConfig);

/// Detection and reclamation of objects that borrowers never returned
///
/// # Examples
///
/// ```
/// use generic_objectpool::AbandonedConfig;
/// use std::time::Duration;
///
/// let config = AbandonedConfig::new()
///     .with_remove_abandoned_on_maintenance(true)
///     .with_remove_abandoned_timeout(Duration::from_secs(60));
///
/// assert!(config.remove_abandoned_on_maintenance);
/// assert!(!config.remove_abandoned_on_borrow);
/// ```
#[derive(Debug, Clone)]
pub struct AbandonedConfig {
    /// Check for abandoned objects when a borrow finds the pool nearly exhausted
    pub remove_abandoned_on_borrow: bool,

    /// Check for abandoned objects on every evictor run
    pub remove_abandoned_on_maintenance: bool,

    /// Time without use after which a borrowed object counts as abandoned
    pub remove_abandoned_timeout: Duration,

    /// Log details of each reclaimed object
    pub log_abandoned: bool,

    /// Let [`use_object`](crate::GenericObjectPool::use_object) refresh the last-used time
    pub use_usage_tracking: bool,
}

impl Default for AbandonedConfig {
    fn default() -> Self {
        Self {
            remove_abandoned_on_borrow: false,
            remove_abandoned_on_maintenance: false,
            remove_abandoned_timeout: Duration::from_secs(300),
            log_abandoned: false,
            use_usage_tracking: false,
        }
    }
}

impl AbandonedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reclaim abandoned objects when a borrow finds the pool nearly exhausted
    pub fn with_remove_abandoned_on_borrow(mut self, enabled: bool) -> Self {
        self.remove_abandoned_on_borrow = enabled;
        self
    }

    /// Reclaim abandoned objects on every evictor run
    pub fn with_remove_abandoned_on_maintenance(mut self, enabled: bool) -> Self {
        self.remove_abandoned_on_maintenance = enabled;
        self
    }

    /// Time without use after which a borrowed object counts as abandoned
    pub fn with_remove_abandoned_timeout(mut self, timeout: Duration) -> Self {
        self.remove_abandoned_timeout = timeout;
        self
    }

    /// Log a warning for each reclaimed object
    pub fn with_log_abandoned(mut self, enabled: bool) -> Self {
        self.log_abandoned = enabled;
        self
    }

    /// Let `use_object` refresh an object's last use time
    pub fn with_usage_tracking(mut self, enabled: bool) -> Self {
        self.use_usage_tracking = enabled;
        self
    }
}
