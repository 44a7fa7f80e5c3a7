//! Lifecycle callbacks supplied by pool users

use crate::errors::{BoxError, PoolError};
use crate::pooled_object::{DestroyMode, PooledObject};

/// Creates, checks and disposes of the objects held by a
/// [`GenericObjectPool`](crate::GenericObjectPool).
///
/// Only [`make_object`](Self::make_object) is required; the other callbacks
/// default to accepting every object.
///
/// # Examples
///
/// ```
/// use generic_objectpool::{BoxError, PooledObject, PooledObjectFactory};
///
/// struct Buffers;
///
/// impl PooledObjectFactory<Vec<u8>> for Buffers {
///     fn make_object(&self) -> Result<Vec<u8>, BoxError> {
///         Ok(Vec::with_capacity(4096))
///     }
///
///     fn validate_object(&self, p: &PooledObject<Vec<u8>>) -> bool {
///         p.capacity() >= 4096
///     }
/// }
/// ```
pub trait PooledObjectFactory<T>: Send + Sync {
    /// Create a new instance to be pooled
    fn make_object(&self) -> Result<T, BoxError>;

    /// Dispose of an instance that is leaving the pool. Errors are reported
    /// to the swallowed-error listener and never reach pool callers.
    fn destroy_object(&self, _p: &PooledObject<T>, _mode: DestroyMode) -> Result<(), BoxError> {
        Ok(())
    }

    /// Check whether an instance is still usable
    fn validate_object(&self, _p: &PooledObject<T>) -> bool {
        true
    }

    /// Prepare an instance before it is handed to a borrower
    fn activate_object(&self, _p: &PooledObject<T>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Reset an instance before it goes back to the idle deque
    fn passivate_object(&self, _p: &PooledObject<T>) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Keyed counterpart of [`PooledObjectFactory`]; every callback receives the
/// key of the sub-pool the object belongs to.
pub trait KeyedPooledObjectFactory<K, T>: Send + Sync {
    fn make_object(&self, key: &K) -> Result<T, BoxError>;

    fn destroy_object(&self, _key: &K, _p: &PooledObject<T>, _mode: DestroyMode) -> Result<(), BoxError> {
        Ok(())
    }

    fn validate_object(&self, _key: &K, _p: &PooledObject<T>) -> bool {
        true
    }

    fn activate_object(&self, _key: &K, _p: &PooledObject<T>) -> Result<(), BoxError> {
        Ok(())
    }

    fn passivate_object(&self, _key: &K, _p: &PooledObject<T>) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Receives every error the pool recovers from internally
///
/// # Examples
///
/// ```
/// use generic_objectpool::{PoolError, SwallowedErrorListener};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let seen = AtomicUsize::new(0);
/// let listener = |_: &PoolError| {
///     seen.fetch_add(1, Ordering::Relaxed);
/// };
/// listener.on_swallowed(&PoolError::Exhausted);
/// assert_eq!(seen.load(Ordering::Relaxed), 1);
/// ```
pub trait SwallowedErrorListener: Send + Sync {
    fn on_swallowed(&self, error: &PoolError);
}

impl<F> SwallowedErrorListener for F
where
    F: Fn(&PoolError) + Send + Sync,
{
    fn on_swallowed(&self, error: &PoolError) {
        self(error)
    }
}
