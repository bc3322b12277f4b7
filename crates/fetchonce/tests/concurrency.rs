// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Concurrency tests for `FetchCache`: fan-in, failure under load, and the at-most-one-success
//! guarantee at scale.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use fetchonce::{FetchCache, testing::MockUpstream};
use futures_util::{StreamExt, future::join_all, stream::FuturesUnordered};
use tick::Clock;
use tokio::sync::Barrier;

const KEY_COUNT: usize = 20;

fn resource(index: usize) -> String {
    format!("res_{index}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_in_single_attempt() {
    const CALLERS: usize = 200;

    let clock = Clock::new_tokio();
    let upstream = MockUpstream::<String>::new(clock.clone()).with_latency(Duration::from_millis(50), Duration::from_millis(100));
    let cache = FetchCache::new(upstream.clone(), clock);
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                cache.get(&"X".to_string()).await
            })
        })
        .collect();

    let outcomes: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task should not panic").expect("upstream never fails here"))
        .collect();

    let distinct: HashSet<_> = outcomes.iter().collect();
    assert_eq!(distinct.len(), 1, "all callers should receive the same value");

    let stats = upstream.stats().key(&"X".to_string());
    assert_eq!(stats.total, 1);
    assert_eq!(stats.max_in_flight, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_in_shares_one_failure() {
    const CALLERS: usize = 100;

    let clock = Clock::new_tokio();
    let upstream = MockUpstream::<String>::new(clock.clone())
        .with_latency(Duration::from_millis(50), Duration::from_millis(50))
        .with_failure_rate(1.0);
    let cache = FetchCache::new(upstream.clone(), clock);

    let key = "X".to_string();
    let outcomes = (0..CALLERS)
        .map(|_| cache.get(&key))
        .collect::<FuturesUnordered<_>>()
        .collect::<Vec<_>>()
        .await;

    assert!(outcomes.iter().all(Result::is_err));
    assert_eq!(upstream.stats().key(&"X".to_string()).total, 1);
    assert!(!cache.is_pending(&"X".to_string()));
    assert_eq!(cache.peek(&"X".to_string()), None);
}

/// 100,000 concurrent calls over 20 keys against an upstream that fails 60% of the time and
/// takes between 100 ms and 1100 ms per call.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scale_at_most_one_success_per_key() {
    const CALLS: usize = 100_000;

    let clock = Clock::new_tokio();
    let upstream = MockUpstream::<String>::new(clock.clone())
        .with_latency(Duration::from_millis(100), Duration::from_millis(1100))
        .with_failure_rate(0.6)
        .with_seed(42);
    let cache = FetchCache::builder::<String, String>(clock).name("scale").upstream(upstream.clone()).build();

    let mut rng = fastrand::Rng::with_seed(7);
    let handles: Vec<_> = (0..CALLS)
        .map(|_| {
            let cache = cache.clone();
            let key = resource(rng.usize(0..KEY_COUNT));
            tokio::spawn(async move {
                let outcome = cache.get(&key).await;
                (key, outcome)
            })
        })
        .collect();

    let mut keys_with_success = HashSet::new();
    let mut values: HashMap<String, String> = HashMap::new();
    for handle in handles {
        let (key, outcome) = handle.await.expect("task should not panic");
        if let Ok(value) = outcome {
            // Every success for a key must carry the one value upstream produced for it.
            let first = values.entry(key.clone()).or_insert_with(|| value.clone());
            assert_eq!(*first, value);
            keys_with_success.insert(key);
        }
    }

    let stats = upstream.stats();
    assert!(stats.unique_keys() <= KEY_COUNT);
    assert_eq!(keys_with_success.len() as u64, stats.succeeded());
    assert_eq!(stats.max_in_flight(), 1);
    for (key, key_stats) in stats.iter() {
        assert!(key_stats.succeeded <= 1, "{key} succeeded {} times", key_stats.succeeded);
    }
    assert_eq!(cache.pending_count(), 0);
    assert_eq!(cache.resolved_count(), keys_with_success.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn retrying_callers_converge_on_one_success_per_key() {
    const CALLERS: usize = 10_000;

    let clock = Clock::new_tokio();
    let upstream = MockUpstream::<String>::new(clock.clone())
        .with_latency(Duration::from_millis(5), Duration::from_millis(20))
        .with_failure_rate(0.6)
        .with_seed(1234);
    let cache = FetchCache::new(upstream.clone(), clock);

    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let cache = cache.clone();
            let key = resource(i % KEY_COUNT);
            tokio::spawn(async move {
                loop {
                    if let Ok(value) = cache.get(&key).await {
                        break (key, value);
                    }
                }
            })
        })
        .collect();

    let mut values: HashMap<String, HashSet<String>> = HashMap::new();
    for handle in handles {
        let (key, value) = handle.await.expect("task should not panic");
        values.entry(key).or_default().insert(value);
    }

    assert_eq!(values.len(), KEY_COUNT);
    assert!(values.values().all(|distinct| distinct.len() == 1));

    let stats = upstream.stats();
    assert_eq!(stats.succeeded(), KEY_COUNT as u64);
    assert_eq!(stats.max_in_flight(), 1);
    assert_eq!(cache.resolved_count(), KEY_COUNT);
}
