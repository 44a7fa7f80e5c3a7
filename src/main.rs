// This is just a binary wrapper - the actual library is in lib.rs
// Run demos with: cargo run --example basic

use generic_objectpool::{BoxError, GenericObjectPool, PoolConfig, PooledObjectFactory};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Counter;

impl PooledObjectFactory<u32> for Counter {
    fn make_object(&self) -> Result<u32, BoxError> {
        Ok(7)
    }
}

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("generic_objectpool {}", env!("CARGO_PKG_VERSION"));
    println!("See demos/ directory for usage examples");
    println!("Run: cargo run --example basic");
    println!();

    println!("Quick Demo:");
    let pool = GenericObjectPool::new(Counter, PoolConfig::new().with_max_total(3));

    {
        let obj = pool.lease()?;
        println!("  Got object: {}", *obj);
        println!("  Active while borrowed: {}", pool.num_active());
    }

    println!("  Idle after return: {}", pool.num_idle());
    pool.close();
    Ok(())
}
