//! Pooled object wrapper and its state machine

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::deque::BlockingDeque;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a pooled object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PooledObjectState {
    /// In the idle deque, available for borrowing
    Idle,

    /// Checked out by a borrower
    Allocated,

    /// In the idle deque, currently being tested by the evictor
    Eviction,

    /// Borrowed while under an eviction test; requeued at the head once the test ends
    EvictionReturnToHead,

    /// Destroyed or about to be destroyed
    Invalid,

    /// Reclaimed from a borrower that appears to have leaked it
    Abandoned,

    /// Being returned to the pool
    Returning,
}

/// Why an object is being destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestroyMode {
    #[default]
    Normal,
    Abandoned,
}

struct ObjectMeta {
    state: PooledObjectState,
    last_borrow: Instant,
    last_use: Instant,
    last_return: Instant,
    borrowed_count: u64,
    log_abandoned: bool,
}

/// A caller-supplied instance together with the bookkeeping the pool keeps for it.
///
/// Identity is stable for the whole life of the object: two `PooledObject`s are
/// equal only if they wrap the same pooled instance. All state transitions take
/// the object's own lock and report whether the expected prior state held; a
/// `false` result means the transition did not apply and is not an error.
pub struct PooledObject<T> {
    id: u64,
    object: T,
    created_at: Instant,
    meta: Mutex<ObjectMeta>,
}

impl<T> PooledObject<T> {
    /// Wrap a freshly created instance in the `Idle` state
    pub fn new(object: T) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            object,
            created_at: now,
            meta: Mutex::new(ObjectMeta {
                state: PooledObjectState::Idle,
                last_borrow: now,
                last_use: now,
                last_return: now,
                borrowed_count: 0,
                log_abandoned: false,
            }),
        }
    }

    /// Process-unique identity of this pooled instance
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The wrapped instance
    pub fn object(&self) -> &T {
        &self.object
    }

    pub fn state(&self) -> PooledObjectState {
        self.meta.lock().state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_borrowed_at(&self) -> Instant {
        self.meta.lock().last_borrow
    }

    pub fn last_returned_at(&self) -> Instant {
        self.meta.lock().last_return
    }

    /// Most recent of the last borrow and the last explicit use
    pub fn last_used_at(&self) -> Instant {
        let meta = self.meta.lock();
        meta.last_use.max(meta.last_borrow)
    }

    pub fn borrowed_count(&self) -> u64 {
        self.meta.lock().borrowed_count
    }

    /// Time spent idle since the last return (or since creation)
    pub fn idle_duration(&self) -> Duration {
        self.meta.lock().last_return.elapsed()
    }

    /// Time spent checked out during the current or most recent borrow
    pub fn active_duration(&self) -> Duration {
        let meta = self.meta.lock();
        if meta.last_return > meta.last_borrow {
            meta.last_return - meta.last_borrow
        } else {
            meta.last_borrow.elapsed()
        }
    }

    pub fn log_abandoned(&self) -> bool {
        self.meta.lock().log_abandoned
    }

    pub(crate) fn set_log_abandoned(&self, enabled: bool) {
        self.meta.lock().log_abandoned = enabled;
    }

    /// Record that the borrower used the object
    pub fn mark_used(&self) {
        self.meta.lock().last_use = Instant::now();
    }

    /// `Idle -> Allocated`. A borrow that races an eviction test flags the
    /// object so that the test requeues it at the head, and fails.
    pub fn allocate(&self) -> bool {
        let mut meta = self.meta.lock();
        match meta.state {
            PooledObjectState::Idle => {
                let now = Instant::now();
                meta.state = PooledObjectState::Allocated;
                meta.last_borrow = now;
                meta.last_use = now;
                meta.borrowed_count += 1;
                true
            }
            PooledObjectState::Eviction => {
                meta.state = PooledObjectState::EvictionReturnToHead;
                false
            }
            _ => false,
        }
    }

    /// `Allocated | Returning -> Idle`
    pub fn deallocate(&self) -> bool {
        let mut meta = self.meta.lock();
        match meta.state {
            PooledObjectState::Allocated | PooledObjectState::Returning => {
                meta.state = PooledObjectState::Idle;
                meta.last_return = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// `Allocated -> Returning`
    pub fn mark_returning(&self) -> bool {
        let mut meta = self.meta.lock();
        if meta.state == PooledObjectState::Allocated {
            meta.state = PooledObjectState::Returning;
            true
        } else {
            false
        }
    }

    /// `Allocated -> Abandoned` when the last use is at or before `cutoff`
    pub fn mark_abandoned_if_unused_since(&self, cutoff: Instant) -> bool {
        let mut meta = self.meta.lock();
        let last_used = meta.last_use.max(meta.last_borrow);
        if meta.state == PooledObjectState::Allocated && last_used <= cutoff {
            meta.state = PooledObjectState::Abandoned;
            true
        } else {
            false
        }
    }

    /// `Idle -> Eviction`
    pub fn start_eviction_test(&self) -> bool {
        let mut meta = self.meta.lock();
        if meta.state == PooledObjectState::Idle {
            meta.state = PooledObjectState::Eviction;
            true
        } else {
            false
        }
    }

    /// Finish an eviction test that the object survived.
    ///
    /// `Eviction -> Idle` returns `true`. If a borrower touched the object in
    /// the meantime it is put back at the head of `idle` and `false` is returned.
    pub fn end_eviction_test(self: &Arc<Self>, idle: &BlockingDeque<Arc<Self>>) -> bool {
        let mut meta = self.meta.lock();
        match meta.state {
            PooledObjectState::Eviction => {
                meta.state = PooledObjectState::Idle;
                true
            }
            PooledObjectState::EvictionReturnToHead => {
                meta.state = PooledObjectState::Idle;
                if !idle.offer_first(Arc::clone(self)) {
                    tracing::warn!(object_id = self.id, "idle deque full, object under eviction test left out");
                }
                false
            }
            _ => false,
        }
    }

    /// Any state except `Invalid` -> `Invalid`.
    ///
    /// Exactly one caller observes `true`; that caller owns destruction.
    pub fn invalidate(&self) -> bool {
        let mut meta = self.meta.lock();
        if meta.state == PooledObjectState::Invalid {
            false
        } else {
            meta.state = PooledObjectState::Invalid;
            true
        }
    }

    /// `Idle -> Invalid`, only if `unlink` confirms the object was removed from
    /// its idle deque while the object lock is held.
    pub(crate) fn invalidate_if_idle(&self, unlink: impl FnOnce() -> bool) -> bool {
        let mut meta = self.meta.lock();
        if meta.state == PooledObjectState::Idle && unlink() {
            meta.state = PooledObjectState::Invalid;
            true
        } else {
            false
        }
    }
}

impl<T> Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.object
    }
}

impl<T> PartialEq for PooledObject<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for PooledObject<T> {}

impl<T: fmt::Debug> fmt::Debug for PooledObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("PooledObject")
            .field("id", &self.id)
            .field("object", &self.object)
            .field("state", &meta.state)
            .field("borrowed_count", &meta.borrowed_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_borrow_return_cycle() {
        let p = PooledObject::new("conn");
        assert_eq!(p.state(), PooledObjectState::Idle);
        assert!(p.allocate());
        assert_eq!(p.borrowed_count(), 1);
        assert!(!p.allocate());
        assert!(p.mark_returning());
        assert!(p.deallocate());
        assert_eq!(p.state(), PooledObjectState::Idle);
        assert!(!p.deallocate());
    }

    #[test]
    fn test_borrow_during_eviction_requeues_at_head() {
        let idle = BlockingDeque::new(false);
        let other = Arc::new(PooledObject::new(1));
        let p = Arc::new(PooledObject::new(2));
        idle.offer_last(Arc::clone(&other));

        assert!(p.start_eviction_test());
        assert!(!p.allocate());
        assert_eq!(p.state(), PooledObjectState::EvictionReturnToHead);

        assert!(!p.end_eviction_test(&idle));
        assert_eq!(p.state(), PooledObjectState::Idle);
        assert_eq!(idle.peek_first().map(|o| o.id()), Some(p.id()));
    }

    #[test]
    fn test_invalidate_happens_once() {
        let p = PooledObject::new(());
        assert!(p.invalidate());
        assert!(!p.invalidate());
        assert!(!p.start_eviction_test());
        assert!(!p.allocate());
    }

    #[test]
    fn test_abandon_respects_last_use() {
        let p = PooledObject::new(());
        let before = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(p.allocate());
        assert!(!p.mark_abandoned_if_unused_since(before));
        assert!(p.mark_abandoned_if_unused_since(Instant::now()));
        assert_eq!(p.state(), PooledObjectState::Abandoned);
    }

    #[test]
    fn test_identity_equality() {
        let a = PooledObject::new(7);
        let b = PooledObject::new(7);
        assert_ne!(a, b);
        assert_eq!(*a, *b);
    }
}
