//! Capacity-bounded blocking double-ended queue used for idle objects
//!
//! A single mutex guards the items and the waiter bookkeeping; `not_empty` and
//! `not_full` condition variables wake blocked takers and putters. With
//! fairness enabled, blocked takers are served strictly in arrival order.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::errors::{PoolError, PoolResult};

#[derive(Clone, Copy)]
enum End {
    Front,
    Back,
}

struct DequeState<E> {
    items: VecDeque<E>,
    /// Tickets of blocked takers, in arrival order
    take_waiters: VecDeque<u64>,
    next_ticket: u64,
    /// Bumped every time takers are interrupted
    interrupt_epoch: u64,
    /// Set by the first interrupt; takers fail from then on
    interrupted: bool,
}

impl<E> DequeState<E> {
    fn pop(&mut self, end: End) -> Option<E> {
        match end {
            End::Front => self.items.pop_front(),
            End::Back => self.items.pop_back(),
        }
    }

    fn push(&mut self, end: End, item: E) {
        match end {
            End::Front => self.items.push_front(item),
            End::Back => self.items.push_back(item),
        }
    }

    fn leave_take_queue(&mut self, ticket: u64) {
        if let Some(pos) = self.take_waiters.iter().position(|t| *t == ticket) {
            self.take_waiters.remove(pos);
        }
    }
}

/// Blocking deque with optional FIFO fairness for waiting takers
pub struct BlockingDeque<E> {
    state: Mutex<DequeState<E>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    fair: bool,
}

impl<E> BlockingDeque<E> {
    /// Create an unbounded deque
    pub fn new(fair: bool) -> Self {
        Self::with_capacity(usize::MAX, fair)
    }

    /// Create a deque holding at most `capacity` elements
    pub fn with_capacity(capacity: usize, fair: bool) -> Self {
        Self {
            state: Mutex::new(DequeState {
                items: VecDeque::new(),
                take_waiters: VecDeque::new(),
                next_ticket: 0,
                interrupt_epoch: 0,
                interrupted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            fair,
        }
    }

    pub fn is_fair(&self) -> bool {
        self.fair
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.state.lock().items.len()
    }

    fn offer(&self, end: End, item: E) -> Result<(), E> {
        let mut state = self.state.lock();
        if state.items.len() >= self.capacity {
            return Err(item);
        }
        state.push(end, item);
        self.signal_not_empty();
        Ok(())
    }

    fn signal_not_empty(&self) {
        // A fair deque only lets the oldest taker consume, so every taker
        // has to re-check whether it is at the head.
        if self.fair {
            self.not_empty.notify_all();
        } else {
            self.not_empty.notify_one();
        }
    }

    pub fn offer_first(&self, item: E) -> bool {
        self.offer(End::Front, item).is_ok()
    }

    pub fn offer_last(&self, item: E) -> bool {
        self.offer(End::Back, item).is_ok()
    }

    /// Insert at the head, failing with [`PoolError::DequeFull`] at capacity
    pub fn add_first(&self, item: E) -> PoolResult<()> {
        self.offer(End::Front, item).map_err(|_| PoolError::DequeFull)
    }

    /// Insert at the tail, failing with [`PoolError::DequeFull`] at capacity
    pub fn add_last(&self, item: E) -> PoolResult<()> {
        self.offer(End::Back, item).map_err(|_| PoolError::DequeFull)
    }

    fn put(&self, end: End, item: E) -> PoolResult<()> {
        let mut state = self.state.lock();
        let epoch = state.interrupt_epoch;
        while state.items.len() >= self.capacity {
            if state.interrupt_epoch != epoch {
                return Err(PoolError::Interrupted);
            }
            self.not_full.wait(&mut state);
        }
        state.push(end, item);
        self.signal_not_empty();
        Ok(())
    }

    /// Insert at the head, waiting for space if necessary
    pub fn put_first(&self, item: E) -> PoolResult<()> {
        self.put(End::Front, item)
    }

    /// Insert at the tail, waiting for space if necessary
    pub fn put_last(&self, item: E) -> PoolResult<()> {
        self.put(End::Back, item)
    }

    fn poll(&self, end: End) -> Option<E> {
        let mut state = self.state.lock();
        if self.fair && !state.take_waiters.is_empty() {
            return None;
        }
        let item = state.pop(end);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Remove the head without waiting. A fair deque yields nothing while
    /// blocked takers are queued.
    pub fn poll_first(&self) -> Option<E> {
        self.poll(End::Front)
    }

    pub fn poll_last(&self) -> Option<E> {
        self.poll(End::Back)
    }

    fn take(&self, end: End, deadline: Option<Instant>) -> PoolResult<Option<E>> {
        let mut state = self.state.lock();
        if state.interrupted {
            return Err(PoolError::Interrupted);
        }
        if state.take_waiters.is_empty() || !self.fair {
            if let Some(item) = state.pop(end) {
                self.not_full.notify_one();
                return Ok(Some(item));
            }
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.take_waiters.push_back(ticket);

        loop {
            if state.interrupted {
                state.leave_take_queue(ticket);
                return Err(PoolError::Interrupted);
            }

            let my_turn = !self.fair || state.take_waiters.front() == Some(&ticket);
            if my_turn {
                if let Some(item) = state.pop(end) {
                    state.leave_take_queue(ticket);
                    self.after_take(&state);
                    return Ok(Some(item));
                }
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        state.leave_take_queue(ticket);
                        if self.fair && !state.items.is_empty() {
                            self.not_empty.notify_all();
                        }
                        return Ok(None);
                    }
                    self.not_empty.wait_until(&mut state, deadline);
                }
                None => self.not_empty.wait(&mut state),
            }
        }
    }

    fn after_take(&self, state: &MutexGuard<'_, DequeState<E>>) {
        self.not_full.notify_one();
        if !state.items.is_empty() && !state.take_waiters.is_empty() {
            self.signal_not_empty();
        }
    }

    /// Remove the head, waiting until an element is available
    pub fn take_first(&self) -> PoolResult<E> {
        self.take(End::Front, None)?.ok_or(PoolError::Interrupted)
    }

    /// Remove the tail, waiting until an element is available
    pub fn take_last(&self) -> PoolResult<E> {
        self.take(End::Back, None)?.ok_or(PoolError::Interrupted)
    }

    /// Remove the head, waiting up to `timeout`; `Ok(None)` on expiry
    pub fn poll_first_timeout(&self, timeout: Duration) -> PoolResult<Option<E>> {
        self.take(End::Front, Instant::now().checked_add(timeout))
    }

    /// Remove the tail, waiting up to `timeout`; `Ok(None)` on expiry
    pub fn poll_last_timeout(&self, timeout: Duration) -> PoolResult<Option<E>> {
        self.take(End::Back, Instant::now().checked_add(timeout))
    }

    /// Remove and return every element, head first
    pub fn drain(&self) -> Vec<E> {
        let mut state = self.state.lock();
        let items: Vec<E> = state.items.drain(..).collect();
        if !items.is_empty() {
            self.not_full.notify_all();
        }
        items
    }

    pub fn clear(&self) {
        drop(self.drain());
    }

    /// Number of threads blocked waiting to take an element
    pub fn take_queue_length(&self) -> usize {
        self.state.lock().take_waiters.len()
    }

    pub fn has_take_waiters(&self) -> bool {
        !self.state.lock().take_waiters.is_empty()
    }

    /// Wake every blocked taker with [`PoolError::Interrupted`]. Takes made
    /// afterwards fail the same way without blocking.
    pub fn interrupt_take_waiters(&self) {
        let mut state = self.state.lock();
        state.interrupt_epoch += 1;
        state.interrupted = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

impl<E: Clone> BlockingDeque<E> {
    pub fn peek_first(&self) -> Option<E> {
        self.state.lock().items.front().cloned()
    }

    pub fn peek_last(&self) -> Option<E> {
        self.state.lock().items.back().cloned()
    }

    /// Copy of the elements in head-to-tail order.
    ///
    /// The copy is weakly consistent: elements may be removed or added after
    /// it is taken.
    pub fn snapshot(&self) -> Vec<E> {
        self.state.lock().items.iter().cloned().collect()
    }

    /// Copy of the elements in tail-to-head order
    pub fn snapshot_rev(&self) -> Vec<E> {
        self.state.lock().items.iter().rev().cloned().collect()
    }
}

impl<E: PartialEq> BlockingDeque<E> {
    pub fn contains(&self, item: &E) -> bool {
        self.state.lock().items.iter().any(|e| e == item)
    }

    /// Unlink the first element equal to `item`
    pub fn remove_first_occurrence(&self, item: &E) -> bool {
        let mut state = self.state.lock();
        match state.items.iter().position(|e| e == item) {
            Some(pos) => {
                state.items.remove(pos);
                self.not_full.notify_one();
                true
            }
            None => false,
        }
    }

    /// Unlink the last element equal to `item`
    pub fn remove_last_occurrence(&self, item: &E) -> bool {
        let mut state = self.state.lock();
        match state.items.iter().rposition(|e| e == item) {
            Some(pos) => {
                state.items.remove(pos);
                self.not_full.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, item: &E) -> bool {
        self.remove_first_occurrence(item)
    }
}

impl<E> fmt::Debug for BlockingDeque<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockingDeque")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("fair", &self.fair)
            .field("take_waiters", &state.take_waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn wait_for_takers<E>(deque: &BlockingDeque<E>, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while deque.take_queue_length() < n {
            assert!(Instant::now() < deadline, "takers never blocked");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_both_ends() {
        let deque = BlockingDeque::new(false);
        deque.add_last(1).unwrap();
        deque.add_last(2).unwrap();
        deque.add_first(0).unwrap();
        assert_eq!(deque.snapshot(), vec![0, 1, 2]);
        assert_eq!(deque.snapshot_rev(), vec![2, 1, 0]);
        assert_eq!(deque.poll_last(), Some(2));
        assert_eq!(deque.poll_first(), Some(0));
        assert_eq!(deque.len(), 1);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let deque = BlockingDeque::with_capacity(2, false);
        assert!(deque.offer_last("a"));
        assert!(deque.offer_first("b"));
        assert!(!deque.offer_last("c"));
        assert!(matches!(deque.add_first("c"), Err(PoolError::DequeFull)));
        assert_eq!(deque.remaining_capacity(), 0);
    }

    #[test]
    fn test_remove_unlinks_matching_element() {
        let deque = BlockingDeque::new(false);
        for i in [1, 2, 3, 2] {
            deque.offer_last(i);
        }
        assert!(deque.remove_last_occurrence(&2));
        assert_eq!(deque.snapshot(), vec![1, 2, 3]);
        assert!(deque.remove(&2));
        assert!(!deque.remove(&7));
        assert_eq!(deque.snapshot(), vec![1, 3]);
    }

    #[test]
    fn test_poll_timeout_expires() {
        let deque: BlockingDeque<i32> = BlockingDeque::new(false);
        let start = Instant::now();
        let got = deque.poll_first_timeout(Duration::from_millis(30)).unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(deque.take_queue_length(), 0);
    }

    #[test]
    fn test_take_wakes_on_add() {
        let deque = Arc::new(BlockingDeque::new(false));
        let taker = {
            let deque = Arc::clone(&deque);
            thread::spawn(move || deque.take_first())
        };
        wait_for_takers(&deque, 1);
        assert!(deque.has_take_waiters());
        deque.add_last(42).unwrap();
        assert_eq!(taker.join().unwrap().unwrap(), 42);
    }

    #[test]
    fn test_interrupt_releases_takers() {
        let deque: Arc<BlockingDeque<i32>> = Arc::new(BlockingDeque::new(true));
        let takers: Vec<_> = (0..3)
            .map(|_| {
                let deque = Arc::clone(&deque);
                thread::spawn(move || deque.take_first())
            })
            .collect();
        wait_for_takers(&deque, 3);
        deque.interrupt_take_waiters();
        for taker in takers {
            assert!(matches!(taker.join().unwrap(), Err(PoolError::Interrupted)));
        }
        assert_eq!(deque.take_queue_length(), 0);
    }

    #[test]
    fn test_take_after_interrupt_fails_immediately() {
        let deque: BlockingDeque<i32> = BlockingDeque::new(false);
        deque.interrupt_take_waiters();
        assert!(matches!(deque.take_first(), Err(PoolError::Interrupted)));
        let start = Instant::now();
        assert!(matches!(
            deque.poll_first_timeout(Duration::from_secs(5)),
            Err(PoolError::Interrupted)
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(deque.take_queue_length(), 0);
    }

    #[test]
    fn test_fair_poll_does_not_overtake_blocked_taker() {
        let deque = Arc::new(BlockingDeque::new(true));
        let taker = {
            let deque = Arc::clone(&deque);
            thread::spawn(move || deque.take_first())
        };
        wait_for_takers(&deque, 1);
        deque.add_last(7).unwrap();
        assert_eq!(deque.poll_first(), None);
        assert_eq!(taker.join().unwrap().unwrap(), 7);
        deque.add_last(8).unwrap();
        assert_eq!(deque.poll_first(), Some(8));
    }

    #[test]
    fn test_fair_takers_served_in_arrival_order() {
        let deque = Arc::new(BlockingDeque::new(true));
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut handles = Vec::new();
        for i in 0..4 {
            let taker_deque = Arc::clone(&deque);
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let item = taker_deque.take_first().unwrap();
                tx.send((i, item)).unwrap();
            }));
            wait_for_takers(&deque, i + 1);
        }
        for item in 0..4 {
            deque.add_last(item).unwrap();
            let (waiter, got) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(waiter, item);
            assert_eq!(got, item);
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_put_blocks_until_space() {
        let deque = Arc::new(BlockingDeque::with_capacity(1, false));
        deque.put_last(1).unwrap();
        let putter = {
            let deque = Arc::clone(&deque);
            thread::spawn(move || deque.put_last(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(deque.poll_first(), Some(1));
        putter.join().unwrap().unwrap();
        assert_eq!(deque.poll_first(), Some(2));
    }
}
