//! # generic_objectpool
//!
//! Thread-safe generic and keyed object pools with blocking borrow, fair
//! waiter queues, background eviction and abandoned-object reclamation.
//!
//! ## Features
//!
//! - Factory-driven object lifecycle (make, activate, validate, passivate, destroy)
//! - Blocking borrow with optional deadline, fair FIFO hand-off to waiters
//! - LIFO or FIFO idle ordering
//! - Keyed pools with per-key and global capacity limits
//! - Pluggable eviction policies, run by a shared background evictor
//! - Reclamation of objects their borrowers forgot to return
//! - RAII leases and async borrowing on tokio
//! - Metrics with Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use generic_objectpool::{BoxError, GenericObjectPool, PoolConfig, PooledObjectFactory};
//!
//! struct Numbers;
//!
//! impl PooledObjectFactory<u32> for Numbers {
//!     fn make_object(&self) -> Result<u32, BoxError> {
//!         Ok(42)
//!     }
//! }
//!
//! let pool = GenericObjectPool::new(Numbers, PoolConfig::default());
//! {
//!     let obj = pool.lease().unwrap();
//!     println!("Got: {}", *obj);
//!     // Object automatically returned when `obj` goes out of scope
//! }
//! assert_eq!(pool.num_idle(), 1);
//! ```

mod base;
mod config;
mod deque;
mod errors;
mod eviction;
mod evictor;
mod factory;
mod keyed_pool;
mod metrics;
mod pool;
mod pooled_object;

pub use config::{AbandonedConfig, CommonConfig, KeyedPoolConfig, PoolConfig};
pub use deque::BlockingDeque;
pub use errors::{BoxError, PoolError, PoolResult, SharedError};
pub use eviction::{DefaultEvictionPolicy, EvictionConfig, EvictionPolicy, TimeToLivePolicy};
pub use evictor::{EvictionTimer, EvictorHandle};
pub use factory::{KeyedPooledObjectFactory, PooledObjectFactory, SwallowedErrorListener};
pub use keyed_pool::GenericKeyedObjectPool;
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolMetrics;
pub use pool::{GenericObjectPool, Lease};
pub use pooled_object::{DestroyMode, PooledObject, PooledObjectState};
