//! Error types for the core crate
use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by cache fetch functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core errors
#[derive(Error, Debug)]
pub enum CoreError {
    /// A controller descriptor is unusable as given
    #[error("Invalid controller '{name}': {reason}")]
    InvalidController { name: String, reason: String },
}

/// Errors surfaced by [`crate::cache::BudgetCache`].
///
/// `Clone` so one memoized failure can be handed to every waiter of an item.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The fetch function failed; kept on the item until it is prefetched again
    #[error("Fetch failed: {0}")]
    Fetch(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The item was evicted or destroyed while it was being waited on
    #[error("Cache item discarded")]
    Discarded,

    /// `acquire` was called for a key nobody asked to prefetch
    #[error("Cache item not requested: {0}")]
    NotRequested(String),

    /// The cache has been shut down
    #[error("Cache shut down")]
    ShutDown,
}

impl CacheError {
    pub(crate) fn from_fetch(err: BoxError) -> Self {
        CacheError::Fetch(Arc::from(err))
    }

    /// True for a real fetch failure, false for eviction or lifecycle errors.
    pub fn is_fetch_error(&self) -> bool {
        matches!(self, CacheError::Fetch(_))
    }

    /// Attempt to view the fetch failure as a concrete error type.
    pub fn fetch_source<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            CacheError::Fetch(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
