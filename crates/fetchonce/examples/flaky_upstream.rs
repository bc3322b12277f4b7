// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Demonstrates `FetchCache` in front of a slow upstream that fails most of the time.
//!
//! Many concurrent requests are spread over a handful of keys. Each request retries until it
//! gets a value, yet the upstream succeeds exactly once per key and never runs two calls for the
//! same key at once.

use std::time::Duration;

use fetchonce::{FetchCache, testing::MockUpstream};
use tick::Clock;
use tracing::Level;

const KEYS: usize = 5;
const REQUESTS: usize = 1_000;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).with_target(false).init();

    let clock = Clock::new_tokio();
    let upstream = MockUpstream::<String>::new(clock.clone())
        .with_latency(Duration::from_millis(100), Duration::from_millis(300))
        .with_failure_rate(0.6);

    let cache = FetchCache::builder::<String, String>(clock.clone())
        .name("resources")
        .enable_logs()
        .upstream(upstream.clone())
        .build();

    println!("Starting {REQUESTS} requests over {KEYS} keys...\n");
    let stopwatch = clock.stopwatch();

    let handles: Vec<_> = (0..REQUESTS)
        .map(|i| {
            let cache = cache.clone();
            let key = format!("res_{}", i % KEYS);
            tokio::spawn(async move {
                let mut failures = 0_u32;
                loop {
                    match cache.get(&key).await {
                        Ok(value) => break (key, value, failures),
                        Err(_) => failures += 1,
                    }
                }
            })
        })
        .collect();

    let mut failures_seen = 0_u32;
    for handle in handles {
        let (_, _, failures) = handle.await.expect("Task panicked");
        failures_seen += failures;
    }

    for i in 0..KEYS {
        let key = format!("res_{i}");
        let stats = upstream.stats().key(&key);
        println!(
            "  {key}: {} upstream call(s), {} failed, value {:?}",
            stats.total,
            stats.failed,
            cache.peek(&key).unwrap_or_default()
        );
    }

    let stats = upstream.stats();
    println!(
        "\nDone in {:?}: {} upstream calls for {REQUESTS} requests, {} successful, max {} in flight per key, {failures_seen} failed gets retried.",
        stopwatch.elapsed(),
        stats.total(),
        stats.succeeded(),
        stats.max_in_flight(),
    );
}
