//! State and helpers shared by the single and keyed pool engines

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::AbandonedConfig;
use crate::errors::{PoolError, PoolResult};
use crate::evictor::{EvictionTimer, EvictorHandle};
use crate::factory::SwallowedErrorListener;
use crate::metrics::MetricsTracker;
use crate::pooled_object::PooledObject;

pub(crate) struct PoolBase {
    closed: AtomicBool,
    close_lock: Mutex<()>,
    pub stats: MetricsTracker,
    listener: RwLock<Option<Arc<dyn SwallowedErrorListener>>>,
    abandoned: RwLock<Option<AbandonedConfig>>,
    evictor: Mutex<Option<(Arc<EvictionTimer>, EvictorHandle)>>,
}

impl PoolBase {
    pub fn new(abandoned: Option<AbandonedConfig>) -> Self {
        Self {
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
            stats: MetricsTracker::new(),
            listener: RwLock::new(None),
            abandoned: RwLock::new(abandoned),
            evictor: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn assert_open(&self) -> PoolResult<()> {
        if self.is_closed() {
            Err(PoolError::Closed)
        } else {
            Ok(())
        }
    }

    /// Run `shutdown` once, with the evictor already stopped and the pool
    /// already marked closed. Later calls are no-ops.
    pub fn close_with(&self, shutdown: impl FnOnce()) {
        if self.is_closed() {
            return;
        }
        let _guard = self.close_lock.lock();
        if self.is_closed() {
            return;
        }
        self.stop_evictor();
        self.closed.store(true, Ordering::Release);
        shutdown();
    }

    /// Report an error the pool recovered from
    pub fn swallow(&self, error: PoolError) {
        warn!(error = %error, "pool swallowed error");
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_swallowed(&error);
        }
    }

    /// Swallow the error half of `result`, if any
    pub fn swallow_result(&self, result: PoolResult<()>) {
        if let Err(e) = result {
            self.swallow(e);
        }
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn SwallowedErrorListener>>) {
        *self.listener.write() = listener;
    }

    pub fn abandoned_config(&self) -> Option<AbandonedConfig> {
        self.abandoned.read().clone()
    }

    pub fn has_abandoned_config(&self) -> bool {
        self.abandoned.read().is_some()
    }

    pub fn set_abandoned_config(&self, config: Option<AbandonedConfig>) {
        *self.abandoned.write() = config;
    }

    /// Whether a borrow should first sweep for abandoned objects
    pub fn abandoned_sweep_on_borrow(&self, idle: usize, active: usize, max_total: Option<usize>) -> Option<AbandonedConfig> {
        let config = self.abandoned_config()?;
        let nearly_exhausted = idle < 2 && max_total.is_none_or(|max| active + 3 > max);
        (config.remove_abandoned_on_borrow && nearly_exhausted).then_some(config)
    }

    /// (Re)schedule `task` every `period` on `timer`, or on the shared timer.
    /// A missing or zero period only cancels the current schedule.
    pub fn start_evictor(
        &self,
        period: Option<Duration>,
        timer: Option<Arc<EvictionTimer>>,
        task: Arc<dyn Fn() + Send + Sync>,
    ) {
        let mut evictor = self.evictor.lock();
        if let Some((timer, handle)) = evictor.take() {
            timer.cancel(handle);
        }
        let Some(period) = period.filter(|p| !p.is_zero()) else {
            return;
        };
        let timer = timer.unwrap_or_else(EvictionTimer::shared);
        let handle = timer.schedule(period, task);
        debug!(period_ms = period.as_millis() as u64, "evictor scheduled");
        *evictor = Some((timer, handle));
    }

    pub fn stop_evictor(&self) {
        if let Some((timer, handle)) = self.evictor.lock().take() {
            timer.cancel(handle);
            debug!("evictor cancelled");
        }
    }

    #[cfg(test)]
    pub fn evictor_scheduled(&self) -> bool {
        self.evictor.lock().is_some()
    }
}

/// Capacity gate in front of the factory.
///
/// A creator first claims a slot in the live-object count. When the count is
/// already at its limit and other creations are still in flight, the creator
/// waits for them to finish, since any of them may fail and free a slot.
pub(crate) struct CreateGate {
    making: Mutex<usize>,
    done: Condvar,
}

/// An in-flight creation; dropping it wakes creators waiting for capacity
pub(crate) struct MakeSlot<'a> {
    gate: &'a CreateGate,
}

impl CreateGate {
    pub fn new() -> Self {
        Self {
            making: Mutex::new(0),
            done: Condvar::new(),
        }
    }

    /// Claim one unit of `count` below `limit`. Returns `None` when the
    /// limit is reached with nothing in flight, or `max_wait` runs out.
    pub fn acquire<'a>(&'a self, count: &AtomicUsize, limit: usize, max_wait: Option<Duration>) -> Option<MakeSlot<'a>> {
        let started = Instant::now();
        let mut making = self.making.lock();
        loop {
            if count.fetch_add(1, Ordering::SeqCst) < limit {
                *making += 1;
                return Some(MakeSlot { gate: self });
            }
            count.fetch_sub(1, Ordering::SeqCst);
            if *making == 0 {
                return None;
            }
            match max_wait {
                None => self.done.wait(&mut making),
                Some(max_wait) => {
                    let remaining = max_wait.checked_sub(started.elapsed()).filter(|r| !r.is_zero())?;
                    self.done.wait_for(&mut making, remaining);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        *self.making.lock()
    }
}

impl Drop for MakeSlot<'_> {
    fn drop(&mut self) {
        let mut making = self.gate.making.lock();
        *making -= 1;
        self.gate.done.notify_all();
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Flag every checked-out object unused for longer than the abandoned
/// timeout and return those that were flagged.
pub(crate) fn collect_abandoned<T>(
    objects: Vec<Arc<PooledObject<T>>>,
    config: &AbandonedConfig,
) -> Vec<Arc<PooledObject<T>>> {
    let Some(cutoff) = Instant::now().checked_sub(config.remove_abandoned_timeout) else {
        return Vec::new();
    };
    objects
        .into_iter()
        .filter(|p| p.mark_abandoned_if_unused_since(cutoff))
        .inspect(|p| {
            if config.log_abandoned || p.log_abandoned() {
                warn!(
                    object_id = p.id(),
                    borrowed_count = p.borrowed_count(),
                    unused_for_ms = p.last_used_at().elapsed().as_millis() as u64,
                    "reclaiming abandoned object"
                );
            }
        })
        .collect()
}
