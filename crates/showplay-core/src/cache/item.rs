//! Cache item bookkeeping

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{CacheSource, Millis};
use crate::error::CacheError;

pub(crate) type Waiter<V> = oneshot::Sender<Result<Arc<V>, CacheError>>;

/// Externally visible item state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Queued,
    Fetching,
    Ready,
    Error,
}

pub(crate) enum ItemState<V> {
    Queued,
    Fetching(JoinHandle<()>),
    Ready(Arc<V>),
    Error(CacheError),
}

impl<V> ItemState<V> {
    pub(crate) fn status(&self) -> ItemStatus {
        match self {
            ItemState::Queued => ItemStatus::Queued,
            ItemState::Fetching(_) => ItemStatus::Fetching,
            ItemState::Ready(_) => ItemStatus::Ready,
            ItemState::Error(_) => ItemStatus::Error,
        }
    }
}

pub(crate) struct CacheItem<S: CacheSource> {
    pub key: S::Key,
    /// Distinguishes this item from a later one created under the same identity
    pub serial: u64,
    pub state: ItemState<S::Value>,
    pub priority: S::Priority,
    pub refs: usize,
    pub waiters: Vec<Waiter<S::Value>>,
    pub estimated_cost: u64,
    pub actual_cost: Option<u64>,
    pub last_prefetched_at: Millis,
    pub last_accessed_at: Millis,
    /// `None` never expires
    pub expiry: Option<Millis>,
}

impl<S: CacheSource> CacheItem<S> {
    pub(crate) fn new(
        key: S::Key,
        serial: u64,
        priority: S::Priority,
        estimated_cost: u64,
        now: Millis,
        expiry: Option<Millis>,
    ) -> Self {
        Self {
            key,
            serial,
            state: ItemState::Queued,
            priority,
            refs: 0,
            waiters: Vec::new(),
            estimated_cost,
            actual_cost: None,
            last_prefetched_at: now,
            last_accessed_at: now,
            expiry,
        }
    }

    /// Referenced or mid-fetch; exempt from eviction.
    pub(crate) fn must_keep(&self) -> bool {
        self.refs > 0 || matches!(self.state, ItemState::Fetching(_))
    }

    pub(crate) fn last_touched(&self) -> Millis {
        self.last_prefetched_at.max(self.last_accessed_at)
    }

    pub(crate) fn is_expired(&self, now: Millis, not_requested_after: Millis) -> bool {
        !self.must_keep()
            && (self.last_touched() < not_requested_after
                || self.expiry.is_some_and(|expiry| expiry < now))
    }

    /// Cost charged against the budget in the current state.
    pub(crate) fn budget_cost(&self) -> u64 {
        match self.state {
            ItemState::Queued | ItemState::Fetching(_) => self.estimated_cost,
            ItemState::Ready(_) => self.actual_cost.unwrap_or(self.estimated_cost),
            ItemState::Error(_) => 0,
        }
    }

    pub(crate) fn reject_waiters(&mut self, err: &CacheError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    pub(crate) fn resolve_waiters(&mut self, value: &Arc<S::Value>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(Arc::clone(value)));
        }
    }
}

/// Merge two expiries, keeping the later one (`None` = never).
pub(crate) fn later_expiry(a: Option<Millis>, b: Option<Millis>) -> Option<Millis> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}
