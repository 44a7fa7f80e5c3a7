//! Keyed pool examples: one sub-pool per host

use std::time::Duration;

use generic_objectpool::{
    BoxError, DestroyMode, GenericKeyedObjectPool, KeyedPoolConfig, KeyedPooledObjectFactory, PooledObject,
};

#[derive(Debug)]
struct Connection {
    host: String,
    serial: u64,
}

struct Connector;

impl KeyedPooledObjectFactory<String, Connection> for Connector {
    fn make_object(&self, host: &String) -> Result<Connection, BoxError> {
        let serial = next_serial();
        println!("   + connect {host} (#{serial})");
        Ok(Connection {
            host: host.clone(),
            serial,
        })
    }

    fn destroy_object(&self, host: &String, p: &PooledObject<Connection>, mode: DestroyMode) -> Result<(), BoxError> {
        println!("   - disconnect {host} (#{}, {mode:?})", p.serial);
        Ok(())
    }
}

fn next_serial() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::SeqCst)
}

fn main() {
    println!("=== generic_objectpool - Keyed Examples ===\n");

    per_key_limits();
    global_limit();
}

fn per_key_limits() {
    println!("1. Per-key Limits:");
    let config = KeyedPoolConfig::new()
        .with_max_total(5)
        .with_max_total_per_key(2)
        .with_max_wait(Duration::from_millis(50));
    let pool = GenericKeyedObjectPool::new(Connector, config);
    let (db, cache) = ("db".to_string(), "cache".to_string());

    let _d1 = pool.lease(&db).unwrap();
    let _d2 = pool.lease(&db).unwrap();
    let c1 = pool.lease(&cache).unwrap();
    println!("   {} talks to {}", c1.serial, c1.host);

    match pool.lease(&db) {
        Ok(_) => println!("   Third db connection: Success"),
        Err(e) => println!("   Third db connection: {e}"),
    }
    println!("   Active per key: {:?}\n", pool.num_active_per_key());
}

fn global_limit() {
    println!("2. Global Limit:");
    let config = KeyedPoolConfig::new().with_max_total(2).with_block_when_exhausted(false);
    let pool = GenericKeyedObjectPool::new(Connector, config);

    for host in ["alpha", "beta", "gamma"] {
        let host = host.to_string();
        let conn = pool.lease(&host).unwrap();
        println!("   Using #{} for {}", conn.serial, conn.host);
    }

    // Idle connections of older hosts were closed to make room
    println!("   Keys: {:?}", pool.keys());
    pool.close();
}
