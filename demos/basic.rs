//! Basic usage examples for GenericObjectPool

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use generic_objectpool::{BoxError, GenericObjectPool, PoolConfig, PooledObject, PooledObjectFactory};

/// Hands out numbered byte buffers and clears them on return
#[derive(Default)]
struct Buffers {
    next: AtomicU32,
}

impl PooledObjectFactory<(u32, Vec<u8>)> for Buffers {
    fn make_object(&self) -> Result<(u32, Vec<u8>), BoxError> {
        Ok((self.next.fetch_add(1, Ordering::SeqCst), Vec::with_capacity(64)))
    }

    fn validate_object(&self, p: &PooledObject<(u32, Vec<u8>)>) -> bool {
        p.1.capacity() >= 64
    }
}

fn main() {
    println!("=== generic_objectpool - Basic Examples ===\n");

    // Example 1: Borrow and return
    borrow_and_return();

    // Example 2: Pool with configuration
    configured_pool();

    // Example 3: Non-blocking exhaustion
    non_blocking();

    // Example 4: Metrics
    metrics();
}

fn borrow_and_return() {
    println!("1. Borrow and Return:");
    let pool = GenericObjectPool::new(Buffers::default(), PoolConfig::default());

    let obj = pool.borrow_object().unwrap();
    println!("   Got buffer #{}", obj.0);
    pool.return_object(obj).unwrap();

    {
        let lease = pool.lease().unwrap();
        println!("   Leased buffer #{} again", lease.0);
        // Returned automatically when dropped
    }

    println!("   Idle after return: {}\n", pool.num_idle());
}

fn configured_pool() {
    println!("2. Configured Pool:");

    let config = PoolConfig::new()
        .with_max_total(5)
        .with_max_idle(2)
        .with_test_on_borrow(true)
        .with_max_wait(Duration::from_millis(100));

    let pool = GenericObjectPool::new(Buffers::default(), config);

    {
        let _obj1 = pool.lease().unwrap();
        let _obj2 = pool.lease().unwrap();
        let _obj3 = pool.lease().unwrap();
        println!("   Active objects: {}", pool.num_active());
    }

    // max_idle caps what stays around
    println!("   After return - Idle: {}\n", pool.num_idle());
}

fn non_blocking() {
    println!("3. Non-blocking Exhaustion:");
    let config = PoolConfig::new().with_max_total(1).with_block_when_exhausted(false);
    let pool = GenericObjectPool::new(Buffers::default(), config);

    let obj1 = pool.lease();
    assert!(obj1.is_ok());
    println!("   First borrow: Success");

    match pool.lease() {
        Ok(_) => println!("   Second borrow: Success"),
        Err(e) => println!("   Second borrow: {e}"),
    }

    drop(obj1);

    assert!(pool.lease().is_ok());
    println!("   Third borrow: Success\n");
}

fn metrics() {
    println!("4. Metrics:");
    let pool = GenericObjectPool::new(Buffers::default(), PoolConfig::default());

    {
        let _obj1 = pool.lease().unwrap();
        let _obj2 = pool.lease().unwrap();
        let m = pool.metrics();
        println!("   Active: {}, Idle: {}", m.active, m.idle);
    }

    let metrics = pool.metrics().export();
    println!("\n   Metrics:");
    for (key, value) in metrics {
        println!("     {}: {}", key, value);
    }
}
