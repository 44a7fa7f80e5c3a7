//! Eviction policies for idle objects

use std::time::Duration;

use crate::pooled_object::PooledObject;

/// Thresholds handed to an [`EvictionPolicy`] for one eviction pass
///
/// # Examples
///
/// ```
/// use generic_objectpool::EvictionConfig;
/// use std::time::Duration;
///
/// let config = EvictionConfig::new(Some(Duration::from_secs(60)), None, 2);
/// assert_eq!(config.idle_evict_duration(), Duration::from_secs(60));
/// assert_eq!(config.idle_soft_evict_duration(), Duration::MAX);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionConfig {
    idle_evict: Duration,
    idle_soft_evict: Duration,
    min_idle: usize,
}

impl EvictionConfig {
    /// Absent or zero durations mean the threshold never triggers
    pub fn new(idle_evict: Option<Duration>, idle_soft_evict: Option<Duration>, min_idle: usize) -> Self {
        let or_never = |d: Option<Duration>| d.filter(|d| !d.is_zero()).unwrap_or(Duration::MAX);
        Self {
            idle_evict: or_never(idle_evict),
            idle_soft_evict: or_never(idle_soft_evict),
            min_idle,
        }
    }

    /// Idle time after which an object is evicted regardless of the idle count
    pub fn idle_evict_duration(&self) -> Duration {
        self.idle_evict
    }

    /// Idle time after which an object is evicted while more than
    /// [`min_idle`](Self::min_idle) objects are idle
    pub fn idle_soft_evict_duration(&self) -> Duration {
        self.idle_soft_evict
    }

    pub fn min_idle(&self) -> usize {
        self.min_idle
    }
}

/// Decides whether an idle object should be evicted.
///
/// Implementations must be side-effect free. A policy that panics is treated
/// as "do not evict" for that candidate and the panic is reported to the
/// pool's swallowed-error listener.
pub trait EvictionPolicy<T>: Send + Sync {
    fn evict(&self, config: &EvictionConfig, under_test: &PooledObject<T>, idle_count: usize) -> bool;
}

/// Evicts objects idle longer than the hard threshold, or longer than the soft
/// threshold while the idle count is above the configured floor.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvictionPolicy;

impl<T> EvictionPolicy<T> for DefaultEvictionPolicy {
    fn evict(&self, config: &EvictionConfig, under_test: &PooledObject<T>, idle_count: usize) -> bool {
        let idle = under_test.idle_duration();
        (config.idle_soft_evict_duration() < idle && config.min_idle() < idle_count)
            || config.idle_evict_duration() < idle
    }
}

/// Evicts objects older than a fixed time-to-live, in addition to the
/// idle thresholds of [`DefaultEvictionPolicy`].
///
/// # Examples
///
/// ```
/// use generic_objectpool::{EvictionConfig, EvictionPolicy, PooledObject, TimeToLivePolicy};
/// use std::time::Duration;
///
/// let policy = TimeToLivePolicy::new(Duration::ZERO);
/// let object = PooledObject::new(1);
/// let config = EvictionConfig::new(None, None, 0);
/// assert!(policy.evict(&config, &object, 1));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TimeToLivePolicy {
    ttl: Duration,
}

impl TimeToLivePolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl<T> EvictionPolicy<T> for TimeToLivePolicy {
    fn evict(&self, config: &EvictionConfig, under_test: &PooledObject<T>, idle_count: usize) -> bool {
        under_test.created_at().elapsed() >= self.ttl
            || DefaultEvictionPolicy.evict(config, under_test, idle_count)
    }
}

impl<T, F> EvictionPolicy<T> for F
where
    F: Fn(&EvictionConfig, &PooledObject<T>, usize) -> bool + Send + Sync,
{
    fn evict(&self, config: &EvictionConfig, under_test: &PooledObject<T>, idle_count: usize) -> bool {
        self(config, under_test, idle_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_hard_threshold_evicts() {
        let object = PooledObject::new(());
        thread::sleep(Duration::from_millis(15));
        let config = EvictionConfig::new(Some(Duration::from_millis(5)), None, 10);
        assert!(DefaultEvictionPolicy.evict(&config, &object, 1));
    }

    #[test]
    fn test_below_thresholds_survives() {
        let object = PooledObject::new(());
        let config = EvictionConfig::new(Some(Duration::from_secs(60)), Some(Duration::from_secs(30)), 0);
        assert!(!DefaultEvictionPolicy.evict(&config, &object, 5));
    }

    #[test]
    fn test_soft_threshold_respects_min_idle() {
        let object = PooledObject::new(());
        thread::sleep(Duration::from_millis(15));
        let config = EvictionConfig::new(None, Some(Duration::from_millis(5)), 2);
        assert!(!DefaultEvictionPolicy.evict(&config, &object, 2));
        assert!(DefaultEvictionPolicy.evict(&config, &object, 3));
    }

    #[test]
    fn test_zero_duration_means_never() {
        let config = EvictionConfig::new(Some(Duration::ZERO), None, 0);
        assert_eq!(config.idle_evict_duration(), Duration::MAX);
    }

    #[test]
    fn test_closure_policy() {
        let policy = |_: &EvictionConfig, p: &PooledObject<u32>, _: usize| *p.object() > 10;
        let config = EvictionConfig::new(None, None, 0);
        assert!(policy.evict(&config, &PooledObject::new(11), 1));
        assert!(!policy.evict(&config, &PooledObject::new(3), 1));
    }
}
