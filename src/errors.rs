//! Error types for the object pools

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error type produced by factory callbacks
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Shared form of a factory error so that [`PoolError`] stays `Clone`
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Pool exhausted - no idle object available and blocking is disabled")]
    Exhausted,

    #[error("Timeout waiting for idle object after {0:?}")]
    Timeout(Duration),

    #[error("Pool not open")]
    Closed,

    #[error("Interrupted while waiting for an idle object")]
    Interrupted,

    #[error("Deque is at capacity")]
    DequeFull,

    #[error("Unable to create object: {0}")]
    Factory(#[source] SharedError),

    #[error("Unable to activate object: {0}")]
    ActivationFailed(#[source] SharedError),

    #[error("Unable to validate object")]
    ValidationFailed,

    #[error("Unable to passivate object: {0}")]
    PassivationFailed(#[source] SharedError),

    #[error("Unable to destroy object: {0}")]
    DestroyFailed(#[source] SharedError),

    #[error("Eviction policy failed: {0}")]
    EvictionPolicy(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),
}

impl PoolError {
    pub(crate) fn factory(err: BoxError) -> Self {
        PoolError::Factory(Arc::from(err))
    }

    pub(crate) fn activation(err: BoxError) -> Self {
        PoolError::ActivationFailed(Arc::from(err))
    }

    pub(crate) fn passivation(err: BoxError) -> Self {
        PoolError::PassivationFailed(Arc::from(err))
    }

    pub(crate) fn destroy(err: BoxError) -> Self {
        PoolError::DestroyFailed(Arc::from(err))
    }

    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        PoolError::IllegalState(msg.into())
    }

    /// Whether this error means no object could be obtained in time
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PoolError::Exhausted | PoolError::Timeout(_))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_error_keeps_source() {
        let err = PoolError::factory("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
        assert!(err.source().is_some());
        let cloned = err.clone();
        assert!(matches!(cloned, PoolError::Factory(_)));
    }

    #[test]
    fn test_exhaustion_kinds() {
        assert!(PoolError::Exhausted.is_exhausted());
        assert!(PoolError::Timeout(Duration::from_millis(5)).is_exhausted());
        assert!(!PoolError::Closed.is_exhausted());
    }
}
