use futures::future::{BoxFuture, FutureExt};
use proptest::prelude::*;
use showplay_core::{
    deadline_order, AcquireRequest, BoxError, BudgetCache, BudgetCacheOptions, CacheSource,
    ItemStatus, Millis, PrefetchSpec,
};
use std::cmp::Ordering;

/// Key "<stream><time>", needed at `time`; cost fixed per key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamKey {
    stream: char,
    time: u64,
    cost: u64,
}

fn key(stream: char, time: u64) -> StreamKey {
    StreamKey {
        stream,
        time,
        cost: 1,
    }
}

#[derive(Debug, Clone)]
struct Need {
    at: Millis,
    stream_rank: u8,
}

struct StreamSource;

impl CacheSource for StreamSource {
    type Key = StreamKey;
    type Value = Vec<u8>;
    type Priority = Need;

    fn fetch(&self, key: StreamKey) -> BoxFuture<'static, Result<Vec<u8>, BoxError>> {
        async move { Ok(vec![0u8; key.cost as usize]) }.boxed()
    }

    fn predict_cost(&self, key: &StreamKey) -> u64 {
        key.cost
    }

    fn cost(&self, value: &Vec<u8>) -> u64 {
        value.len() as u64
    }

    fn identity(&self, key: &StreamKey) -> String {
        format!("{}{}", key.stream, key.time)
    }

    fn compare_priority(&self, a: &Need, b: &Need, now: Millis) -> Ordering {
        deadline_order(a.at, b.at, now).then(a.stream_rank.cmp(&b.stream_rank))
    }
}

fn new_cache(budget: u64, max_concurrency: usize) -> BudgetCache<StreamSource> {
    BudgetCache::new(
        StreamSource,
        BudgetCacheOptions {
            budget,
            max_concurrency,
        },
    )
}

fn need(at: Millis, stream_rank: u8) -> Need {
    Need { at, stream_rank }
}

fn is_ready(cache: &BudgetCache<StreamSource>, k: &StreamKey) -> bool {
    cache.status(k) == Some(ItemStatus::Ready)
}

#[tokio::test]
async fn test_priority_under_pressure() {
    let cache = new_cache(2, 1);
    for t in 1..=8 {
        cache.prefetch(key('a', t), need(t, 0), 0, None);
    }

    cache.cleanup_and_dispatch(0, 0);
    cache.wait_for_fetches().await;
    assert!(is_ready(&cache, &key('a', 1)));
    for t in 2..=8 {
        assert!(!is_ready(&cache, &key('a', t)), "item {} should not be ready", t);
    }

    cache.cleanup_and_dispatch(0, 0);
    cache.wait_for_fetches().await;
    assert!(is_ready(&cache, &key('a', 1)));
    assert!(is_ready(&cache, &key('a', 2)));
    for t in 3..=8 {
        assert!(!is_ready(&cache, &key('a', t)), "item {} should not be ready", t);
    }

    // A lower-priority stream needed later does not push out what is ready
    for t in 10..=12 {
        cache.prefetch(key('b', t), need(t, 1), 0, None);
    }
    cache.cleanup_and_dispatch(0, 0);
    cache.wait_for_fetches().await;
    assert!(is_ready(&cache, &key('a', 1)));
    assert!(is_ready(&cache, &key('a', 2)));
    for t in 10..=12 {
        assert!(!is_ready(&cache, &key('b', t)));
    }
}

#[tokio::test]
async fn test_lru_generations_of_parallel_streams() {
    let cache = new_cache(6, 2);
    for generation in 1..=8u64 {
        let now = generation * 10;
        cache.prefetch(key('a', now), need(now, 0), now, None);
        cache.prefetch(key('b', now), need(now, 1), now, None);
        cache.cleanup_and_dispatch(now, 0);
        cache.wait_for_fetches().await;

        // The current generation and the two most recently needed stay resident
        for back in 0..3u64 {
            if generation > back {
                let t = (generation - back) * 10;
                assert!(is_ready(&cache, &key('a', t)), "a{} gen {}", t, generation);
                assert!(is_ready(&cache, &key('b', t)), "b{} gen {}", t, generation);
            }
        }
        // Anything older fell out once six units were in use
        if generation > 3 {
            for old in 1..=(generation - 3) {
                let t = old * 10;
                assert_eq!(cache.status(&key('a', t)), None);
                assert_eq!(cache.status(&key('b', t)), None);
            }
        }
        assert!(cache.stats().realized_cost <= 6);
    }
}

#[tokio::test]
async fn test_reference_count_discipline() {
    let cache = new_cache(1, 2);
    let k = key('a', 1);
    let first = cache
        .acquire(AcquireRequest {
            key: k.clone(),
            now: 0,
            prefetch: Some(PrefetchSpec {
                priority: need(1, 0),
                expiry: None,
            }),
        })
        .now_or_never();
    // Nothing dispatched yet, so the acquire is still pending
    assert!(first.is_none());
    assert_eq!(cache.ref_count(&k), Some(0));

    cache.cleanup_and_dispatch(0, 0);
    cache.wait_for_fetches().await;

    let a = cache
        .acquire(AcquireRequest {
            key: k.clone(),
            now: 1,
            prefetch: None,
        })
        .await
        .unwrap();
    let b = cache.reference(&k, 1).unwrap().unwrap();
    assert_eq!(cache.ref_count(&k), Some(2));
    assert_eq!(cache.outstanding_handles(), 2);

    // Pinned: survives a pass that would otherwise evict it
    cache.prefetch(key('z', 10), need(10, 0), 2, None);
    cache.cleanup_and_dispatch(2, 0);
    assert!(is_ready(&cache, &k));

    a.release();
    drop(b);
    assert_eq!(cache.ref_count(&k), Some(0));
    assert_eq!(cache.outstanding_handles(), 0);

    cache.wait_for_fetches().await;
    cache.cleanup_and_dispatch(3, 0);
    assert_eq!(cache.status(&k), None);
}

#[derive(Debug, Clone)]
enum Op {
    Prefetch { id: u64, at: u64, cost: u64 },
    Cleanup { advance: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..16, 0u64..40, 1u64..4).prop_map(|(id, at, cost)| Op::Prefetch { id, at, cost }),
        (0u64..5).prop_map(|advance| Op::Cleanup { advance }),
    ]
}

proptest! {
    #[test]
    fn prop_budget_invariant(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let budget = 5;
            let cache = new_cache(budget, 3);
            let mut now = 0;
            for op in ops {
                match op {
                    Op::Prefetch { id, at, cost } => {
                        let k = StreamKey { stream: 'p', time: id, cost };
                        cache.prefetch(k, need(at, 0), now, None);
                    }
                    Op::Cleanup { advance } => {
                        now += advance;
                        cache.cleanup_and_dispatch(now, now.saturating_sub(20));
                        let stats = cache.stats();
                        assert!(stats.realized_cost + stats.in_flight_cost <= budget);
                        cache.wait_for_fetches().await;
                        assert!(cache.stats().realized_cost <= budget);
                    }
                }
            }
        });
    }
}
