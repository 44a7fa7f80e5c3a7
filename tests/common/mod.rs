#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use generic_objectpool::{BoxError, DestroyMode, KeyedPooledObjectFactory, PooledObject, PooledObjectFactory};
use parking_lot::Mutex;

/// Factory that counts every lifecycle callback and the peak number of live
/// objects it has handed out
#[derive(Default)]
pub struct Counting {
    pub made: AtomicUsize,
    pub destroyed: AtomicUsize,
    live: AtomicUsize,
    pub peak_live: AtomicUsize,
    pub make_delay: Option<Duration>,
    pub destroy_modes: Mutex<Vec<DestroyMode>>,
}

impl Counting {
    pub fn slow(make_delay: Duration) -> Self {
        Self {
            make_delay: Some(make_delay),
            ..Self::default()
        }
    }

    pub fn made(&self) -> usize {
        self.made.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    fn on_make(&self) -> usize {
        if let Some(delay) = self.make_delay {
            thread::sleep(delay);
        }
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        self.made.fetch_add(1, Ordering::SeqCst)
    }

    fn on_destroy(&self, mode: DestroyMode) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.destroy_modes.lock().push(mode);
    }
}

impl PooledObjectFactory<usize> for Counting {
    fn make_object(&self) -> Result<usize, BoxError> {
        Ok(self.on_make())
    }

    fn destroy_object(&self, _p: &PooledObject<usize>, mode: DestroyMode) -> Result<(), BoxError> {
        self.on_destroy(mode);
        Ok(())
    }
}

impl KeyedPooledObjectFactory<String, usize> for Counting {
    fn make_object(&self, _key: &String) -> Result<usize, BoxError> {
        Ok(self.on_make())
    }

    fn destroy_object(&self, _key: &String, _p: &PooledObject<usize>, mode: DestroyMode) -> Result<(), BoxError> {
        self.on_destroy(mode);
        Ok(())
    }
}

/// Spin until `condition` holds, failing the test after a few seconds
pub fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..5000 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("condition not reached in time");
}
