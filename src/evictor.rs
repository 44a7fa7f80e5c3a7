//! Shared scheduler that runs pool evictors at a fixed delay
//!
//! One worker thread serves every pool registered with a timer. The thread is
//! started when the first task is scheduled and exits once the last task is
//! cancelled.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

type Task = Arc<dyn Fn() + Send + Sync>;

enum Command {
    Schedule { id: u64, period: Duration, task: Task },
    Cancel { id: u64 },
}

struct Scheduled {
    period: Duration,
    next_run: Instant,
    task: Task,
}

#[derive(Default)]
struct TimerState {
    sender: Option<Sender<Command>>,
    active: usize,
    next_id: u64,
}

/// Fixed-delay scheduler shared by any number of pools
///
/// # Examples
///
/// ```
/// use generic_objectpool::EvictionTimer;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let timer = EvictionTimer::new();
/// let runs = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&runs);
/// let handle = timer.schedule(Duration::from_millis(5), Arc::new(move || {
///     counter.fetch_add(1, Ordering::SeqCst);
/// }));
/// std::thread::sleep(Duration::from_millis(50));
/// timer.cancel(handle);
/// assert!(runs.load(Ordering::SeqCst) > 0);
/// assert_eq!(timer.task_count(), 0);
/// ```
pub struct EvictionTimer {
    state: Mutex<TimerState>,
}

/// Registration of one task with an [`EvictionTimer`]
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct EvictorHandle {
    id: u64,
}

impl EvictionTimer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimerState::default()),
        }
    }

    /// Process-wide timer used by pools that are not given their own
    pub fn shared() -> Arc<EvictionTimer> {
        static SHARED: OnceLock<Arc<EvictionTimer>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(EvictionTimer::new())))
    }

    /// Run `task` every `period`, first after one `period` has elapsed
    pub fn schedule(&self, period: Duration, task: Task) -> EvictorHandle {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let sender = match &state.sender {
            Some(sender) => sender.clone(),
            None => {
                let (tx, rx) = channel::unbounded();
                spawn_worker(rx);
                state.sender = Some(tx.clone());
                tx
            }
        };
        state.active += 1;
        if sender.send(Command::Schedule { id, period, task }).is_err() {
            error!(task_id = id, "evictor worker is gone, task not scheduled");
        }
        EvictorHandle { id }
    }

    /// Stop running the task behind `handle`. A run already in progress is
    /// allowed to finish.
    pub fn cancel(&self, handle: EvictorHandle) {
        let mut state = self.state.lock();
        let Some(sender) = state.sender.as_ref() else {
            return;
        };
        let _ = sender.send(Command::Cancel { id: handle.id });
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            // Dropping the last sender lets the worker drain and exit
            state.sender = None;
        }
    }

    /// Number of tasks currently scheduled
    pub fn task_count(&self) -> usize {
        self.state.lock().active
    }

    /// Whether a worker thread is currently serving this timer
    pub fn is_running(&self) -> bool {
        self.state.lock().sender.is_some()
    }
}

impl Default for EvictionTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_worker(rx: Receiver<Command>) {
    let spawned = thread::Builder::new()
        .name("pool-evictor".into())
        .spawn(move || run_worker(rx));
    if let Err(e) = spawned {
        error!(error = %e, "failed to start evictor thread");
    }
}

fn run_worker(rx: Receiver<Command>) {
    debug!("evictor thread started");
    let mut tasks: HashMap<u64, Scheduled> = HashMap::new();
    loop {
        let next_deadline = tasks.values().map(|t| t.next_run).min();
        let received = match next_deadline {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Command::Schedule { id, period, task }) => {
                let next_run = Instant::now() + period;
                tasks.insert(id, Scheduled { period, next_run, task });
            }
            Ok(Command::Cancel { id }) => {
                tasks.remove(&id);
            }
            Err(RecvTimeoutError::Timeout) => run_due(&mut tasks),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("evictor thread stopped");
}

fn run_due(tasks: &mut HashMap<u64, Scheduled>) {
    let now = Instant::now();
    for (id, scheduled) in tasks.iter_mut() {
        if scheduled.next_run > now {
            continue;
        }
        let task = Arc::clone(&scheduled.task);
        if panic::catch_unwind(AssertUnwindSafe(|| task())).is_err() {
            error!(task_id = *id, "evictor task panicked");
        }
        // Fixed delay: the next run is measured from the end of this one
        scheduled.next_run = Instant::now() + scheduled.period;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_worker_lifecycle_follows_task_count() {
        let timer = EvictionTimer::new();
        assert!(!timer.is_running());

        let runs = Arc::new(AtomicUsize::new(0));
        let a = timer.schedule(Duration::from_millis(5), counting_task(&runs));
        let b = timer.schedule(Duration::from_millis(5), counting_task(&runs));
        assert_eq!(timer.task_count(), 2);
        assert!(timer.is_running());

        timer.cancel(a);
        assert!(timer.is_running());
        timer.cancel(b);
        assert_eq!(timer.task_count(), 0);
        assert!(!timer.is_running());
    }

    #[test]
    fn test_cancelled_task_stops_running() {
        let timer = EvictionTimer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = timer.schedule(Duration::from_millis(2), counting_task(&runs));
        thread::sleep(Duration::from_millis(40));
        timer.cancel(handle);
        thread::sleep(Duration::from_millis(20));
        let after_cancel = runs.load(Ordering::SeqCst);
        assert!(after_cancel > 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let timer = EvictionTimer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let bad = timer.schedule(Duration::from_millis(2), Arc::new(|| panic!("broken evictor")));
        let good = timer.schedule(Duration::from_millis(2), counting_task(&runs));
        thread::sleep(Duration::from_millis(40));
        assert!(runs.load(Ordering::SeqCst) > 0);
        timer.cancel(bad);
        timer.cancel(good);
    }
}
