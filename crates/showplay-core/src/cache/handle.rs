//! Reference-counted handles over cache values
//!
//! A handle pins its item for as long as it lives. Dropping it (or calling
//! [`CacheHandle::release`]) gives the reference back, which makes the item
//! eligible for eviction on the next cleanup pass once no other handle holds it.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{CacheSource, Shared};

/// Decrements the owning item's reference count on drop.
pub(crate) struct RefGuard<S: CacheSource> {
    shared: Arc<Shared<S>>,
    id: String,
    serial: u64,
}

impl<S: CacheSource> RefGuard<S> {
    /// The caller must already have incremented the item's reference count.
    pub(crate) fn new(shared: Arc<Shared<S>>, id: String, serial: u64) -> Self {
        shared.outstanding_handles.fetch_add(1, Ordering::Relaxed);
        Self { shared, id, serial }
    }
}

impl<S: CacheSource> Drop for RefGuard<S> {
    fn drop(&mut self) {
        self.shared.outstanding_handles.fetch_sub(1, Ordering::Relaxed);
        {
            let mut state = self.shared.state.lock();
            if let Some(item) = state.items.get_mut(&self.id) {
                if item.serial == self.serial {
                    item.refs = item.refs.saturating_sub(1);
                }
            }
        }
        // The handle's value is already dropped; finish a deferred disposal
        self.shared.dispose_released();
    }
}

/// Ownership token over a ready cache value.
pub struct CacheHandle<S: CacheSource> {
    // Dropped before the guard so an evicting cleanup never races a live Arc.
    value: Arc<S::Value>,
    guard: RefGuard<S>,
}

impl<S: CacheSource> CacheHandle<S> {
    pub(crate) fn new(guard: RefGuard<S>, value: Arc<S::Value>) -> Self {
        Self { value, guard }
    }

    /// Identity of the item this handle pins.
    pub fn id(&self) -> &str {
        &self.guard.id
    }

    pub fn value(&self) -> &S::Value {
        &self.value
    }

    /// Give the reference back. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl<S: CacheSource> Deref for CacheHandle<S> {
    type Target = S::Value;

    fn deref(&self) -> &S::Value {
        &self.value
    }
}

impl<S: CacheSource> fmt::Debug for CacheHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("id", &self.guard.id)
            .field("serial", &self.guard.serial)
            .finish()
    }
}
