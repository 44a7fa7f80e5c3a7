//! Async usage examples

use std::time::Duration;

use generic_objectpool::{BoxError, GenericObjectPool, PoolConfig, PooledObjectFactory};
use tokio::time::sleep;

struct Sessions;

impl PooledObjectFactory<String> for Sessions {
    fn make_object(&self) -> Result<String, BoxError> {
        Ok("session".to_string())
    }
}

#[tokio::main]
async fn main() {
    println!("=== generic_objectpool - Async Examples ===\n");

    // Example 1: Async lease
    async_lease().await;

    // Example 2: Async with timeout
    async_with_timeout().await;

    // Example 3: Concurrent access
    concurrent_access().await;
}

async fn async_lease() {
    println!("1. Async Lease:");
    let pool = GenericObjectPool::new(Sessions, PoolConfig::default());

    {
        let obj = pool.lease_async().await.unwrap();
        println!("   Got object asynchronously: {}", *obj);
    }

    println!();
}

async fn async_with_timeout() {
    println!("2. Async with Timeout:");

    let config = PoolConfig::new()
        .with_max_total(1)
        .with_max_wait(Duration::from_millis(100));

    let pool = GenericObjectPool::new(Sessions, config);

    // Get the only object
    let _obj = pool.lease_async().await.unwrap();

    // Try to get another (should timeout)
    match pool.lease_async().await {
        Ok(_) => println!("   Got object"),
        Err(e) => println!("   Expected timeout: {}", e),
    }

    println!();
}

async fn concurrent_access() {
    println!("3. Concurrent Access:");
    let pool = GenericObjectPool::new(Sessions, PoolConfig::new().with_max_total(3));

    let mut handles = vec![];
    for i in 0..10 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let obj = pool.lease_async().await.unwrap();
            sleep(Duration::from_millis(10)).await;
            println!("   Task {} used {}", i, *obj);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let metrics = pool.metrics();
    println!("   Borrowed: {}, created: {}\n", metrics.borrowed, metrics.created);
}
