//! Priority/budget cache
//!
//! A generic cache that deduplicates in-flight and completed fetches by key,
//! keeps the total cost of resident plus pending items under a budget, and hands
//! out reference-counted [`CacheHandle`]s.
//!
//! Interest is placed with [`BudgetCache::prefetch`], which is O(1) and does no
//! I/O. Nothing is fetched until the owner runs
//! [`BudgetCache::cleanup_and_dispatch`]: that pass sees the whole batch of
//! requests, orders it with the source's priority comparator, evicts what no
//! longer fits, and starts fetches up to the concurrency limit. Items that are
//! referenced or mid-fetch ("must keep") are never evicted by budget pressure.
//!
//! Fetches run as tokio tasks, so `cleanup_and_dispatch` must be called from
//! within a runtime.

mod handle;
mod item;
mod stats;

pub use handle::CacheHandle;
pub use item::ItemStatus;
pub use stats::{AccessCounter, CacheStats};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{BoxError, CacheError};
use handle::RefGuard;
use item::{later_expiry, CacheItem, ItemState};

/// Caller-supplied clock value in milliseconds.
pub type Millis = u64;

/// What a [`BudgetCache`] caches and how it values it.
///
/// Implementors supply the fetch, the cost model, key identity, priority
/// ordering, and disposal. `compare_priority` returns [`Ordering::Less`] when
/// `a` should be served before `b` at reference time `now`.
pub trait CacheSource: Send + Sync + 'static {
    type Key: Clone + Send + Sync + 'static;
    type Value: Send + Sync + 'static;
    type Priority: Clone + Send + Sync + 'static;

    /// Produce the value for `key`. Dropping the future cancels the fetch.
    fn fetch(&self, key: Self::Key) -> BoxFuture<'static, Result<Self::Value, BoxError>>;

    /// Cost charged while the item is queued or fetching.
    fn predict_cost(&self, key: &Self::Key) -> u64;

    /// Cost charged once the value is resident.
    fn cost(&self, value: &Self::Value) -> u64;

    /// Deduplication identity of a key.
    fn identity(&self, key: &Self::Key) -> String;

    fn compare_priority(&self, a: &Self::Priority, b: &Self::Priority, now: Millis) -> Ordering;

    /// Called with values leaving the cache.
    fn dispose(&self, _key: &Self::Key, _value: Self::Value) {}
}

/// Deadline ordering shared by time-driven caches.
///
/// Items still ahead of `now` come first, sooner deadlines before later ones.
/// Items whose deadline has passed follow, most recently needed first, so the
/// least recently needed are the first to fall outside the budget.
pub fn deadline_order(a: Millis, b: Millis, now: Millis) -> Ordering {
    match (a < now, b < now) {
        (false, false) => a.cmp(&b),
        (true, true) => b.cmp(&a),
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
    }
}

/// Limits for a [`BudgetCache`]
#[derive(Debug, Clone)]
pub struct BudgetCacheOptions {
    /// Total cost allowed across resident and pending items
    pub budget: u64,
    /// Maximum fetches in flight at once
    pub max_concurrency: usize,
}

impl Default for BudgetCacheOptions {
    fn default() -> Self {
        Self {
            budget: 256 * 1024 * 1024,
            max_concurrency: 2,
        }
    }
}

/// Prefetch parameters carried by an [`AcquireRequest`]
#[derive(Debug, Clone)]
pub struct PrefetchSpec<P> {
    pub priority: P,
    pub expiry: Option<Millis>,
}

/// Arguments to [`BudgetCache::acquire`]
#[derive(Debug, Clone)]
pub struct AcquireRequest<K, P> {
    pub key: K,
    pub now: Millis,
    /// Prefetch the key first if it is missing (and refresh it if present)
    pub prefetch: Option<PrefetchSpec<P>>,
}

pub(crate) struct CacheState<S: CacheSource> {
    pub(crate) items: HashMap<String, CacheItem<S>>,
    next_serial: u64,
    shut_down: bool,
    stats: CacheStats,
}

pub(crate) struct Shared<S: CacheSource> {
    source: S,
    options: BudgetCacheOptions,
    pub(crate) state: Mutex<CacheState<S>>,
    in_flight: watch::Sender<usize>,
    pub(crate) outstanding_handles: AtomicUsize,
    /// Values that left the cache while a handle still held them
    lingering: Mutex<Disposals<S>>,
}

/// Values leaving the cache, disposed once the state lock is released.
type Disposals<S> = Vec<(<S as CacheSource>::Key, Arc<<S as CacheSource>::Value>)>;

impl<S: CacheSource> Shared<S> {
    fn dispose_all(&self, disposals: Disposals<S>) {
        for (key, value) in disposals {
            match Arc::try_unwrap(value) {
                Ok(value) => self.source.dispose(&key, value),
                Err(value) => {
                    debug!(
                        "Value for {} still referenced; disposing once released",
                        self.source.identity(&key)
                    );
                    self.lingering.lock().push((key, value));
                }
            }
        }
        self.dispose_released();
    }

    /// Dispose lingering values whose last outside reference is gone.
    pub(crate) fn dispose_released(&self) {
        let released: Disposals<S> = {
            let mut lingering = self.lingering.lock();
            if lingering.is_empty() {
                return;
            }
            let (released, held): (Disposals<S>, Disposals<S>) = std::mem::take(&mut *lingering)
                .into_iter()
                .partition(|(_, value)| Arc::strong_count(value) == 1);
            *lingering = held;
            released
        };
        for (key, value) in released {
            match Arc::try_unwrap(value) {
                Ok(value) => self.source.dispose(&key, value),
                Err(value) => self.lingering.lock().push((key, value)),
            }
        }
    }

    fn release_slot(&self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Take an item out of the map, aborting its fetch and rejecting waiters.
    fn take_item(
        &self,
        state: &mut CacheState<S>,
        id: &str,
        disposals: &mut Disposals<S>,
    ) -> Option<JoinHandle<()>> {
        let mut item = state.items.remove(id)?;
        item.reject_waiters(&CacheError::Discarded);
        match std::mem::replace(&mut item.state, ItemState::Queued) {
            ItemState::Fetching(task) => {
                task.abort();
                self.release_slot();
                Some(task)
            }
            ItemState::Ready(value) => {
                disposals.push((item.key, value));
                None
            }
            ItemState::Queued | ItemState::Error(_) => None,
        }
    }

    fn complete_fetch(&self, key: S::Key, id: &str, serial: u64, result: Result<S::Value, BoxError>) {
        let mut disposals = Vec::new();
        {
            let mut state = self.state.lock();
            let owned = state.items.get(id).is_some_and(|item| {
                item.serial == serial && matches!(item.state, ItemState::Fetching(_))
            });

            if !owned {
                // Item was removed or destroyed while the fetch ran.
                if let Ok(value) = result {
                    disposals.push((key, Arc::new(value)));
                }
            } else {
                let cost = result.as_ref().ok().map(|value| self.source.cost(value));
                let mut failed = false;
                if let Some(item) = state.items.get_mut(id) {
                    match result {
                        Ok(value) => {
                            let value = Arc::new(value);
                            item.actual_cost = cost;
                            item.resolve_waiters(&value);
                            item.state = ItemState::Ready(value);
                            trace!("Fetched {} (cost {:?})", id, cost);
                        }
                        Err(err) => {
                            warn!("Fetch of {} failed: {}", id, err);
                            let err = CacheError::from_fetch(err);
                            item.reject_waiters(&err);
                            item.state = ItemState::Error(err);
                            failed = true;
                        }
                    }
                }
                if failed {
                    state.stats.fetch_errors += 1;
                }
                self.release_slot();
            }
        }
        self.dispose_all(disposals);
    }
}

/// Generic priority/budget cache. Cheap to clone; clones share state.
pub struct BudgetCache<S: CacheSource> {
    shared: Arc<Shared<S>>,
}

impl<S: CacheSource> Clone for BudgetCache<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

enum AcquireOutcome<V> {
    Ready(Arc<V>),
    Failed(CacheError),
    Wait(oneshot::Receiver<Result<Arc<V>, CacheError>>),
}

impl<S: CacheSource> BudgetCache<S> {
    pub fn new(source: S, options: BudgetCacheOptions) -> Self {
        let (in_flight, _) = watch::channel(0usize);
        let stats = CacheStats {
            budget: options.budget,
            ..Default::default()
        };
        Self {
            shared: Arc::new(Shared {
                source,
                options,
                state: Mutex::new(CacheState {
                    items: HashMap::new(),
                    next_serial: 0,
                    shut_down: false,
                    stats,
                }),
                in_flight,
                outstanding_handles: AtomicUsize::new(0),
                lingering: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.shared.source
    }

    pub fn options(&self) -> &BudgetCacheOptions {
        &self.shared.options
    }

    fn prefetch_locked(
        &self,
        state: &mut CacheState<S>,
        key: S::Key,
        priority: S::Priority,
        now: Millis,
        expiry: Option<Millis>,
    ) -> String {
        let source = &self.shared.source;
        let id = source.identity(&key);
        match state.items.get_mut(&id) {
            Some(item) => {
                item.expiry = later_expiry(item.expiry, expiry);
                item.last_prefetched_at = item.last_prefetched_at.max(now);
                if source.compare_priority(&priority, &item.priority, now) == Ordering::Less {
                    item.priority = priority;
                }
                if matches!(item.state, ItemState::Error(_)) {
                    item.state = ItemState::Queued;
                    item.actual_cost = None;
                }
                state.stats.prefetch.record(true);
            }
            None => {
                let estimated = source.predict_cost(&key);
                let serial = state.next_serial;
                state.next_serial += 1;
                state.items.insert(
                    id.clone(),
                    CacheItem::new(key, serial, priority, estimated, now, expiry),
                );
                state.stats.prefetch.record(false);
            }
        }
        id
    }

    /// Place interest in `key`. Idempotent; never performs I/O.
    ///
    /// An existing item gets the later expiry, a refreshed touch time, and the
    /// higher of the two priorities. An errored item is queued again.
    pub fn prefetch(&self, key: S::Key, priority: S::Priority, now: Millis, expiry: Option<Millis>) {
        let mut state = self.shared.state.lock();
        if state.shut_down {
            return;
        }
        self.prefetch_locked(&mut state, key, priority, now, expiry);
    }

    /// True if the item has settled (ready or error).
    pub fn check(&self, key: &S::Key, now: Millis) -> bool {
        let id = self.shared.source.identity(key);
        let mut state = self.shared.state.lock();
        let settled = match state.items.get_mut(&id) {
            Some(item) => {
                item.last_accessed_at = item.last_accessed_at.max(now);
                matches!(item.state, ItemState::Ready(_) | ItemState::Error(_))
            }
            None => false,
        };
        state.stats.check.record(settled);
        settled
    }

    pub fn status(&self, key: &S::Key) -> Option<ItemStatus> {
        let id = self.shared.source.identity(key);
        self.shared
            .state
            .lock()
            .items
            .get(&id)
            .map(|item| item.state.status())
    }

    pub fn ref_count(&self, key: &S::Key) -> Option<usize> {
        let id = self.shared.source.identity(key);
        self.shared.state.lock().items.get(&id).map(|item| item.refs)
    }

    /// Wait for the value of `request.key` and pin it.
    ///
    /// The reference is taken before the first suspension point, so an item
    /// acquired in the same turn as a cleanup pass cannot be evicted under the
    /// caller. On failure the reference is given back and the error returned.
    pub async fn acquire(
        &self,
        request: AcquireRequest<S::Key, S::Priority>,
    ) -> Result<CacheHandle<S>, CacheError> {
        let AcquireRequest { key, now, prefetch } = request;
        let (id, serial, outcome) = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return Err(CacheError::ShutDown);
            }

            let id = match prefetch {
                Some(spec) => self.prefetch_locked(&mut state, key, spec.priority, now, spec.expiry),
                None => self.shared.source.identity(&key),
            };

            let Some(item) = state.items.get_mut(&id) else {
                state.stats.acquire.record(false);
                return Err(CacheError::NotRequested(id));
            };

            item.last_accessed_at = item.last_accessed_at.max(now);
            item.refs += 1;
            let serial = item.serial;
            let (hit, outcome) = match &item.state {
                ItemState::Ready(value) => (true, AcquireOutcome::Ready(Arc::clone(value))),
                ItemState::Error(err) => {
                    item.refs -= 1;
                    (true, AcquireOutcome::Failed(err.clone()))
                }
                ItemState::Queued | ItemState::Fetching(_) => {
                    let (tx, rx) = oneshot::channel();
                    item.waiters.push(tx);
                    (false, AcquireOutcome::Wait(rx))
                }
            };
            state.stats.acquire.record(hit);
            (id, serial, outcome)
        };

        match outcome {
            AcquireOutcome::Failed(err) => Err(err),
            AcquireOutcome::Ready(value) => {
                let guard = RefGuard::new(Arc::clone(&self.shared), id, serial);
                Ok(CacheHandle::new(guard, value))
            }
            AcquireOutcome::Wait(rx) => {
                // Guard first: if this future is dropped while waiting the
                // reference is still given back.
                let guard = RefGuard::new(Arc::clone(&self.shared), id, serial);
                match rx.await {
                    Ok(Ok(value)) => Ok(CacheHandle::new(guard, value)),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(CacheError::Discarded),
                }
            }
        }
    }

    /// Pin `key` without waiting.
    ///
    /// `Some(Ok(_))` if ready, `Some(Err(_))` if the item holds an error,
    /// `None` if absent or not yet settled.
    pub fn reference(&self, key: &S::Key, now: Millis) -> Option<Result<CacheHandle<S>, CacheError>> {
        let id = self.shared.source.identity(key);
        let (serial, value) = {
            let mut state = self.shared.state.lock();
            let found = match state.items.get_mut(&id) {
                Some(item) => {
                    item.last_accessed_at = item.last_accessed_at.max(now);
                    match &item.state {
                        ItemState::Ready(value) => {
                            item.refs += 1;
                            Some(Ok((item.serial, Arc::clone(value))))
                        }
                        ItemState::Error(err) => Some(Err(err.clone())),
                        _ => None,
                    }
                }
                None => None,
            };
            state.stats.reference.record(found.is_some());
            match found? {
                Ok(pair) => pair,
                Err(err) => return Some(Err(err)),
            }
        };
        let guard = RefGuard::new(Arc::clone(&self.shared), id, serial);
        Some(Ok(CacheHandle::new(guard, value)))
    }

    /// Evict, expire, and dispatch in one batch.
    ///
    /// Items are ordered must-keep first, then by priority, with expired items
    /// last. Walking that order, each item's cost (estimated while pending,
    /// actual once ready) is accumulated; past the budget every ready or
    /// errored item that is not must-keep is evicted, and queued items stay
    /// queued. Within the budget, queued items are started until
    /// `max_concurrency` fetches are in flight. Expired items are removed
    /// regardless of budget. Items not touched since `not_requested_after`, or
    /// whose expiry is before `now`, are expired.
    pub fn cleanup_and_dispatch(&self, now: Millis, not_requested_after: Millis) {
        let shared = &self.shared;
        let source = &shared.source;
        let mut disposals = Vec::new();
        {
            let mut state = shared.state.lock();
            if state.shut_down {
                return;
            }

            let mut order: Vec<(&String, &CacheItem<S>, u8)> = state
                .items
                .iter()
                .map(|(id, item)| {
                    let rank = if item.must_keep() {
                        0
                    } else if item.is_expired(now, not_requested_after) {
                        2
                    } else {
                        1
                    };
                    (id, item, rank)
                })
                .collect();

            order.sort_by(|(_, a, rank_a), (_, b, rank_b)| {
                rank_a.cmp(rank_b).then_with(|| {
                    if *rank_a == 2 {
                        a.last_touched().cmp(&b.last_touched())
                    } else {
                        source
                            .compare_priority(&a.priority, &b.priority, now)
                            .then_with(|| b.last_touched().cmp(&a.last_touched()))
                    }
                })
            });

            let order: Vec<(String, u8)> = order
                .into_iter()
                .map(|(id, _, rank)| (id.clone(), rank))
                .collect();

            let budget = shared.options.budget;
            let mut in_flight = *shared.in_flight.borrow();
            let mut used: u64 = 0;
            let mut evicted = 0u64;
            let mut started = 0u64;

            for (id, rank) in order {
                if rank == 2 {
                    trace!("Expiring {}", id);
                    shared.take_item(&mut state, &id, &mut disposals);
                    evicted += 1;
                    continue;
                }

                let Some(item) = state.items.get_mut(&id) else {
                    continue;
                };
                used = used.saturating_add(item.budget_cost());
                let must_keep = rank == 0;

                if used > budget && !must_keep {
                    if matches!(item.state, ItemState::Ready(_) | ItemState::Error(_)) {
                        trace!("Evicting {} (budget {} used {})", id, budget, used);
                        shared.take_item(&mut state, &id, &mut disposals);
                        evicted += 1;
                    }
                    continue;
                }

                if matches!(item.state, ItemState::Queued)
                    && in_flight < shared.options.max_concurrency
                {
                    let key = item.key.clone();
                    let serial = item.serial;
                    let fetch = source.fetch(key.clone());
                    let task_shared = Arc::clone(shared);
                    let task_id = id.clone();
                    let task = tokio::spawn(async move {
                        let result = fetch.await;
                        task_shared.complete_fetch(key, &task_id, serial, result);
                    });
                    item.state = ItemState::Fetching(task);
                    in_flight += 1;
                    started += 1;
                    shared.in_flight.send_modify(|n| *n += 1);
                    trace!("Dispatched fetch of {}", id);
                }
            }

            state.stats.evictions += evicted;
            state.stats.fetches_started += started;
            if evicted > 0 || started > 0 {
                debug!(
                    "Cache pass: {} started, {} evicted, {} items, {} in flight",
                    started,
                    evicted,
                    state.items.len(),
                    in_flight
                );
            }
        }
        shared.dispose_all(disposals);
    }

    /// Drop one item regardless of budget, aborting its fetch and rejecting
    /// its waiters with [`CacheError::Discarded`].
    pub fn remove(&self, key: &S::Key) -> bool {
        let id = self.shared.source.identity(key);
        let mut disposals = Vec::new();
        let removed = {
            let mut state = self.shared.state.lock();
            let present = state.items.contains_key(&id);
            self.shared.take_item(&mut state, &id, &mut disposals);
            present
        };
        self.shared.dispose_all(disposals);
        removed
    }

    /// Resolve once no fetch is in flight.
    pub async fn wait_for_fetches(&self) {
        let mut rx = self.shared.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn in_flight(&self) -> usize {
        *self.shared.in_flight.borrow()
    }

    /// Abort all in-flight fetches, wait for them to settle, then destroy all
    /// state. Later calls fail with [`CacheError::ShutDown`].
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut state = self.shared.state.lock();
            state.shut_down = true;
            let mut tasks = Vec::new();
            for item in state.items.values_mut() {
                if matches!(item.state, ItemState::Fetching(_)) {
                    if let ItemState::Fetching(task) =
                        std::mem::replace(&mut item.state, ItemState::Queued)
                    {
                        task.abort();
                        self.shared.release_slot();
                        tasks.push(task);
                    }
                }
            }
            tasks
        };

        for task in tasks {
            let _ = task.await;
        }
        self.destroy();
        debug!("Cache shut down");
    }

    /// Remove every item, disposing resident values.
    pub fn destroy(&self) {
        let mut disposals = Vec::new();
        {
            let mut state = self.shared.state.lock();
            let ids: Vec<String> = state.items.keys().cloned().collect();
            for id in ids {
                self.shared.take_item(&mut state, &id, &mut disposals);
            }
        }
        self.shared.dispose_all(disposals);
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock();
        let mut stats = state.stats;
        stats.queued = 0;
        stats.fetching = 0;
        stats.ready = 0;
        stats.errored = 0;
        stats.estimated_cost = 0;
        stats.in_flight_cost = 0;
        stats.realized_cost = 0;
        for item in state.items.values() {
            match item.state {
                ItemState::Queued => {
                    stats.queued += 1;
                    stats.estimated_cost += item.estimated_cost;
                }
                ItemState::Fetching(_) => {
                    stats.fetching += 1;
                    stats.estimated_cost += item.estimated_cost;
                    stats.in_flight_cost += item.estimated_cost;
                }
                ItemState::Ready(_) => {
                    stats.ready += 1;
                    stats.realized_cost += item.budget_cost();
                }
                ItemState::Error(_) => stats.errored += 1,
            }
        }
        stats
    }

    /// Handles currently alive across all items.
    pub fn outstanding_handles(&self) -> usize {
        self.shared
            .outstanding_handles
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Keys are "<stream>:<time>"; priority is the time the key is needed.
    struct TimedSource {
        fetches: AtomicUsize,
        disposed: AtomicUsize,
        fail: bool,
    }

    impl TimedSource {
        fn new() -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                disposed: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl CacheSource for TimedSource {
        type Key = String;
        type Value = String;
        type Priority = u64;

        fn fetch(&self, key: String) -> BoxFuture<'static, Result<String, BoxError>> {
            self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
            let fail = self.fail;
            async move {
                if fail {
                    Err::<String, BoxError>(format!("no data for {}", key).into())
                } else {
                    Ok(format!("value-{}", key))
                }
            }
            .boxed()
        }

        fn predict_cost(&self, _key: &String) -> u64 {
            1
        }

        fn cost(&self, _value: &String) -> u64 {
            1
        }

        fn identity(&self, key: &String) -> String {
            key.clone()
        }

        fn compare_priority(&self, a: &u64, b: &u64, _now: Millis) -> Ordering {
            a.cmp(b)
        }

        fn dispose(&self, _key: &String, _value: String) {
            self.disposed.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    fn cache(budget: u64, max_concurrency: usize) -> BudgetCache<TimedSource> {
        BudgetCache::new(
            TimedSource::new(),
            BudgetCacheOptions {
                budget,
                max_concurrency,
            },
        )
    }

    #[tokio::test]
    async fn test_prefetch_is_lazy_and_deduplicated() {
        let cache = cache(10, 2);
        cache.prefetch("a".into(), 5, 0, None);
        cache.prefetch("a".into(), 3, 0, None);
        assert_eq!(cache.status(&"a".to_string()), Some(ItemStatus::Queued));
        assert_eq!(cache.source().fetches.load(AtomicOrdering::SeqCst), 0);

        let stats = cache.stats();
        assert_eq!(stats.prefetch.misses, 1);
        assert_eq!(stats.prefetch.hits, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.estimated_cost, 1);
    }

    #[tokio::test]
    async fn test_dispatch_respects_concurrency() {
        let cache = cache(10, 1);
        cache.prefetch("a".into(), 1, 0, None);
        cache.prefetch("b".into(), 2, 0, None);
        cache.cleanup_and_dispatch(0, 0);
        assert_eq!(cache.in_flight(), 1);
        assert_eq!(cache.status(&"a".to_string()), Some(ItemStatus::Fetching));
        assert_eq!(cache.status(&"b".to_string()), Some(ItemStatus::Queued));

        cache.wait_for_fetches().await;
        assert!(cache.check(&"a".to_string(), 0));
        assert!(!cache.check(&"b".to_string(), 0));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_dispatch() {
        let cache = cache(10, 2);
        let request = AcquireRequest {
            key: "a".to_string(),
            now: 0,
            prefetch: Some(PrefetchSpec {
                priority: 1,
                expiry: None,
            }),
        };
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire(request).await })
        };
        while cache.ref_count(&"a".to_string()) != Some(1) {
            tokio::task::yield_now().await;
        }
        cache.cleanup_and_dispatch(0, 0);

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.value(), "value-a");
        assert_eq!(cache.ref_count(&"a".to_string()), Some(1));
        handle.release();
        assert_eq!(cache.ref_count(&"a".to_string()), Some(0));
        assert_eq!(cache.outstanding_handles(), 0);
    }

    #[tokio::test]
    async fn test_acquire_without_prefetch_is_rejected() {
        let cache = cache(10, 2);
        let result = cache
            .acquire(AcquireRequest {
                key: "missing".to_string(),
                now: 0,
                prefetch: None,
            })
            .await;
        assert!(matches!(result, Err(CacheError::NotRequested(_))));
    }

    #[tokio::test]
    async fn test_fetch_error_is_memoized_until_reprefetch() {
        let mut source = TimedSource::new();
        source.fail = true;
        let cache = BudgetCache::new(source, BudgetCacheOptions::default());
        cache.prefetch("x".into(), 1, 0, None);
        cache.cleanup_and_dispatch(0, 0);
        cache.wait_for_fetches().await;

        assert!(cache.check(&"x".to_string(), 0));
        match cache.reference(&"x".to_string(), 0) {
            Some(Err(err)) => assert!(err.is_fetch_error()),
            other => panic!("expected error marker, got {:?}", other.map(|r| r.is_ok())),
        }
        assert_eq!(cache.stats().fetch_errors, 1);

        cache.prefetch("x".into(), 1, 1, None);
        assert_eq!(cache.status(&"x".to_string()), Some(ItemStatus::Queued));
    }

    #[tokio::test]
    async fn test_referenced_item_survives_budget_pressure() {
        let cache = cache(1, 4);
        cache.prefetch("a".into(), 1, 0, None);
        cache.cleanup_and_dispatch(0, 0);
        cache.wait_for_fetches().await;
        let handle = cache.reference(&"a".to_string(), 0).unwrap().unwrap();

        // "b" outranks "a" but "a" is pinned
        cache.prefetch("b".into(), 0, 1, None);
        cache.cleanup_and_dispatch(1, 0);
        assert_eq!(cache.status(&"a".to_string()), Some(ItemStatus::Ready));

        drop(handle);
        cache.wait_for_fetches().await;
        cache.cleanup_and_dispatch(2, 0);
        assert_eq!(cache.status(&"a".to_string()), None);
        assert_eq!(cache.source().disposed.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_removed_item_disposed_when_last_handle_drops() {
        let cache = cache(10, 2);
        cache.prefetch("a".into(), 1, 0, None);
        cache.prefetch("b".into(), 1, 0, None);
        cache.cleanup_and_dispatch(0, 0);
        cache.wait_for_fetches().await;
        let a = cache.reference(&"a".to_string(), 0).unwrap().unwrap();
        let b = cache.reference(&"b".to_string(), 0).unwrap().unwrap();

        assert!(cache.remove(&"a".to_string()));
        assert_eq!(cache.source().disposed.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(a.value(), "value-a");
        drop(a);
        assert_eq!(cache.source().disposed.load(AtomicOrdering::SeqCst), 1);

        cache.shutdown().await;
        assert_eq!(cache.source().disposed.load(AtomicOrdering::SeqCst), 1);
        drop(b);
        assert_eq!(cache.source().disposed.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_items_removed() {
        let cache = cache(10, 2);
        cache.prefetch("old".into(), 1, 0, Some(5));
        cache.prefetch("stale".into(), 1, 0, None);
        cache.prefetch("fresh".into(), 1, 100, None);
        cache.cleanup_and_dispatch(10, 50);
        assert_eq!(cache.status(&"old".to_string()), None);
        assert_eq!(cache.status(&"stale".to_string()), None);
        assert!(cache.status(&"fresh".to_string()).is_some());
    }

    #[tokio::test]
    async fn test_remove_rejects_waiters() {
        let cache = cache(10, 0);
        cache.prefetch("a".into(), 1, 0, None);
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .acquire(AcquireRequest {
                        key: "a".to_string(),
                        now: 0,
                        prefetch: None,
                    })
                    .await
            })
        };
        while cache.ref_count(&"a".to_string()) != Some(1) {
            tokio::task::yield_now().await;
        }
        assert!(cache.remove(&"a".to_string()));
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CacheError::Discarded)));
    }

    #[tokio::test]
    async fn test_shutdown_disposes_everything() {
        let cache = cache(10, 2);
        cache.prefetch("a".into(), 1, 0, None);
        cache.prefetch("b".into(), 2, 0, None);
        cache.cleanup_and_dispatch(0, 0);
        cache.wait_for_fetches().await;
        cache.shutdown().await;

        assert_eq!(cache.stats().item_count(), 0);
        assert_eq!(cache.source().disposed.load(AtomicOrdering::SeqCst), 2);
        let result = cache
            .acquire(AcquireRequest {
                key: "a".to_string(),
                now: 0,
                prefetch: Some(PrefetchSpec {
                    priority: 1,
                    expiry: None,
                }),
            })
            .await;
        assert!(matches!(result, Err(CacheError::ShutDown)));
    }
}
