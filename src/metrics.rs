//! Metrics collection and export for object pools

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

#[cfg(feature = "metrics")]
use serde::Serialize;

/// Number of recent samples kept for the mean durations
pub(crate) const MEAN_TIMING_SAMPLES: usize = 100;

/// Point-in-time statistics of a pool
///
/// # Examples
///
/// ```
/// use generic_objectpool::{BoxError, GenericObjectPool, PoolConfig, PooledObjectFactory};
///
/// struct Numbers;
///
/// impl PooledObjectFactory<u32> for Numbers {
///     fn make_object(&self) -> Result<u32, BoxError> {
///         Ok(42)
///     }
/// }
///
/// let pool = GenericObjectPool::new(Numbers, PoolConfig::default());
/// let object = pool.borrow_object().unwrap();
///
/// let metrics = pool.metrics();
/// assert_eq!(metrics.borrowed, 1);
/// assert_eq!(metrics.created, 1);
/// assert_eq!(metrics.active, 1);
///
/// pool.return_object(object).unwrap();
/// assert_eq!(pool.metrics().idle, 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "metrics", derive(Serialize))]
pub struct PoolMetrics {
    /// Successful borrows
    pub borrowed: u64,

    /// Objects handed back by borrowers
    pub returned: u64,

    /// Objects created by the factory and added to the pool
    pub created: u64,

    /// Objects destroyed for any reason
    pub destroyed: u64,

    /// Objects destroyed by the evictor
    pub destroyed_by_evictor: u64,

    /// Objects destroyed because they failed validation on borrow
    pub destroyed_by_borrow_validation: u64,

    /// Objects currently checked out
    pub active: usize,

    /// Objects currently idle
    pub idle: usize,

    /// Threads currently blocked waiting for an object
    pub waiters: usize,

    /// Mean time objects stayed checked out over recent returns
    pub mean_active_time: Duration,

    /// Mean time objects sat idle before recent borrows
    pub mean_idle_time: Duration,

    /// Mean time recent borrowers waited for an object
    pub mean_borrow_wait_time: Duration,

    /// Longest time any borrower has waited
    pub max_borrow_wait_time: Duration,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("borrowed".to_string(), self.borrowed.to_string());
        metrics.insert("returned".to_string(), self.returned.to_string());
        metrics.insert("created".to_string(), self.created.to_string());
        metrics.insert("destroyed".to_string(), self.destroyed.to_string());
        metrics.insert("destroyed_by_evictor".to_string(), self.destroyed_by_evictor.to_string());
        metrics.insert(
            "destroyed_by_borrow_validation".to_string(),
            self.destroyed_by_borrow_validation.to_string(),
        );
        metrics.insert("active".to_string(), self.active.to_string());
        metrics.insert("idle".to_string(), self.idle.to_string());
        metrics.insert("waiters".to_string(), self.waiters.to_string());
        metrics.insert("mean_active_ms".to_string(), self.mean_active_time.as_millis().to_string());
        metrics.insert("mean_idle_ms".to_string(), self.mean_idle_time.as_millis().to_string());
        metrics.insert(
            "mean_borrow_wait_ms".to_string(),
            self.mean_borrow_wait_time.as_millis().to_string(),
        );
        metrics.insert(
            "max_borrow_wait_ms".to_string(),
            self.max_borrow_wait_time.as_millis().to_string(),
        );
        metrics
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// Every series carries a `pool` label plus the given `tags`.
    ///
    /// # Examples
    ///
    /// ```
    /// use generic_objectpool::{BoxError, GenericObjectPool, MetricsExporter, PoolConfig, PooledObjectFactory};
    /// use std::collections::HashMap;
    ///
    /// struct Numbers;
    ///
    /// impl PooledObjectFactory<u32> for Numbers {
    ///     fn make_object(&self) -> Result<u32, BoxError> {
    ///         Ok(1)
    ///     }
    /// }
    ///
    /// let pool = GenericObjectPool::new(Numbers, PoolConfig::default());
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&pool.metrics(), "my_pool", Some(&tags));
    /// assert!(output.contains("objectpool_objects_active"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        use prometheus::{Encoder, TextEncoder};

        let registry = match Self::build_registry(metrics, pool_name, tags) {
            Ok(registry) => registry,
            Err(e) => {
                tracing::error!(error = %e, pool = pool_name, "failed to build metrics registry");
                return String::from("# Error building metrics\n");
            }
        };

        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
            tracing::error!(error = %e, pool = pool_name, "failed to encode metrics");
            return String::from("# Error encoding metrics\n");
        }
        String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics to UTF-8\n"))
    }

    fn build_registry(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> prometheus::Result<prometheus::Registry> {
        use prometheus::{Gauge, IntCounter, IntGauge, Opts, Registry};

        let mut labels = HashMap::new();
        labels.insert("pool".to_string(), pool_name.to_string());
        if let Some(tags) = tags {
            labels.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let opts = |name: &str, help: &str| Opts::new(name, help).const_labels(labels.clone());
        let registry = Registry::new();

        let gauges = [
            ("objectpool_objects_active", "Objects currently checked out", metrics.active),
            ("objectpool_objects_idle", "Objects currently idle", metrics.idle),
            ("objectpool_waiters", "Threads waiting for an object", metrics.waiters),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(opts(name, help))?;
            gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
            registry.register(Box::new(gauge))?;
        }

        let counters = [
            ("objectpool_borrowed_total", "Successful borrows", metrics.borrowed),
            ("objectpool_returned_total", "Objects returned", metrics.returned),
            ("objectpool_created_total", "Objects created", metrics.created),
            ("objectpool_destroyed_total", "Objects destroyed", metrics.destroyed),
            (
                "objectpool_destroyed_by_evictor_total",
                "Objects destroyed by the evictor",
                metrics.destroyed_by_evictor,
            ),
            (
                "objectpool_destroyed_by_borrow_validation_total",
                "Objects destroyed after failing validation on borrow",
                metrics.destroyed_by_borrow_validation,
            ),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(opts(name, help))?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let timings = [
            ("objectpool_mean_active_seconds", "Mean checkout duration", metrics.mean_active_time),
            ("objectpool_mean_idle_seconds", "Mean idle duration before borrow", metrics.mean_idle_time),
            ("objectpool_mean_borrow_wait_seconds", "Mean borrow wait", metrics.mean_borrow_wait_time),
            ("objectpool_max_borrow_wait_seconds", "Longest borrow wait", metrics.max_borrow_wait_time),
        ];
        for (name, help, value) in timings {
            let gauge = Gauge::with_opts(opts(name, help))?;
            gauge.set(value.as_secs_f64());
            registry.register(Box::new(gauge))?;
        }

        Ok(registry)
    }
}

/// Rolling window of the most recent duration samples
pub(crate) struct StatsStore {
    samples: Mutex<VecDeque<Duration>>,
    size: usize,
}

impl StatsStore {
    pub fn new(size: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(size)),
            size,
        }
    }

    pub fn add(&self, sample: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.size {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn mean(&self) -> Duration {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = samples.iter().sum();
        total / samples.len() as u32
    }
}

/// Internal metrics tracker
pub(crate) struct MetricsTracker {
    pub borrowed: AtomicU64,
    pub returned: AtomicU64,
    pub created: AtomicU64,
    pub destroyed: AtomicU64,
    pub destroyed_by_evictor: AtomicU64,
    pub destroyed_by_borrow_validation: AtomicU64,
    active_times: StatsStore,
    idle_times: StatsStore,
    wait_times: StatsStore,
    max_borrow_wait_nanos: AtomicU64,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            borrowed: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            destroyed_by_evictor: AtomicU64::new(0),
            destroyed_by_borrow_validation: AtomicU64::new(0),
            active_times: StatsStore::new(MEAN_TIMING_SAMPLES),
            idle_times: StatsStore::new(MEAN_TIMING_SAMPLES),
            wait_times: StatsStore::new(MEAN_TIMING_SAMPLES),
            max_borrow_wait_nanos: AtomicU64::new(0),
        }
    }

    pub fn record_borrow(&self, idle_time: Duration, wait_time: Duration) {
        self.borrowed.fetch_add(1, Ordering::Relaxed);
        self.idle_times.add(idle_time);
        self.wait_times.add(wait_time);
        let nanos = u64::try_from(wait_time.as_nanos()).unwrap_or(u64::MAX);
        self.max_borrow_wait_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn record_return(&self, active_time: Duration) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        self.active_times.add(active_time);
    }

    pub fn get_metrics(&self, active: usize, idle: usize, waiters: usize) -> PoolMetrics {
        PoolMetrics {
            borrowed: self.borrowed.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            destroyed_by_evictor: self.destroyed_by_evictor.load(Ordering::Relaxed),
            destroyed_by_borrow_validation: self.destroyed_by_borrow_validation.load(Ordering::Relaxed),
            active,
            idle,
            waiters,
            mean_active_time: self.active_times.mean(),
            mean_idle_time: self.idle_times.mean(),
            mean_borrow_wait_time: self.wait_times.mean(),
            max_borrow_wait_time: Duration::from_nanos(self.max_borrow_wait_nanos.load(Ordering::Relaxed)),
        }
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}
