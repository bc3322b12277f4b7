// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Simulated upstreams for testing.
//!
//! [`MockUpstream`] behaves like a slow, flaky remote API: every call sleeps for a random latency
//! on a [`Clock`] and then fails with a configurable probability. It counts calls per key,
//! including how many were in flight at the same time, so tests can check that a cache never
//! lets two calls for one key overlap.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Display},
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tick::Clock;

use crate::{Result, Upstream, UpstreamFailure};

type FailPredicate<K> = Box<dyn Fn(&K, u64) -> bool + Send + Sync>;

/// Call counters for a single key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyStats {
    /// Calls started.
    pub total: u64,
    /// Calls that returned a value.
    pub succeeded: u64,
    /// Calls that returned a failure.
    pub failed: u64,
    /// Calls currently running.
    pub in_flight: u64,
    /// The highest number of calls that were ever running at once.
    pub max_in_flight: u64,
}

/// A snapshot of the calls a [`MockUpstream`] has seen.
#[derive(Debug, Clone)]
pub struct UpstreamStats<K> {
    per_key: HashMap<K, KeyStats>,
}

impl<K> UpstreamStats<K>
where
    K: Eq + Hash,
{
    /// Returns the counters for `key`, all zero if it was never requested.
    #[must_use]
    pub fn key(&self, key: &K) -> KeyStats {
        self.per_key.get(key).copied().unwrap_or_default()
    }

    /// Returns the number of distinct keys requested.
    #[must_use]
    pub fn unique_keys(&self) -> usize {
        self.per_key.len()
    }

    /// Returns the number of calls started across all keys.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.per_key.values().map(|s| s.total).sum()
    }

    /// Returns the number of successful calls across all keys.
    #[must_use]
    pub fn succeeded(&self) -> u64 {
        self.per_key.values().map(|s| s.succeeded).sum()
    }

    /// Returns the number of failed calls across all keys.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.per_key.values().map(|s| s.failed).sum()
    }

    /// Returns the highest per-key concurrency observed for any key.
    #[must_use]
    pub fn max_in_flight(&self) -> u64 {
        self.per_key.values().map(|s| s.max_in_flight).max().unwrap_or_default()
    }

    /// Iterates over the counters of every requested key.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &KeyStats)> {
        self.per_key.iter()
    }
}

/// A simulated slow and unreliable upstream producing `String` values.
///
/// Successful calls return `"DataFor:{key} - {n}"` where `n` is a random number below 1000.
/// Failed calls return an [`UpstreamFailure`] caused by `"Random API failure"`.
///
/// Clones share their counters and failure predicate.
///
/// # Examples
///
/// ```
/// use fetchonce::{FetchCache, testing::MockUpstream};
/// use tick::Clock;
/// # futures::executor::block_on(async {
///
/// let upstream = MockUpstream::<String>::new(Clock::new_frozen()).with_seed(7);
/// upstream.fail_when(|_key, attempt| attempt == 1);
///
/// let cache = FetchCache::new(upstream.clone(), Clock::new_frozen());
/// let key = "res_1".to_string();
///
/// assert!(cache.get(&key).await.is_err());
/// let value = cache.get(&key).await.expect("second attempt succeeds");
/// assert!(value.starts_with("DataFor:res_1 - "));
///
/// let stats = upstream.stats();
/// assert_eq!(stats.key(&key).total, 2);
/// assert_eq!(stats.key(&key).max_in_flight, 1);
/// # });
/// ```
pub struct MockUpstream<K> {
    clock: Clock,
    min_latency: Duration,
    max_latency: Duration,
    failure_rate: f64,
    rng: Arc<Mutex<fastrand::Rng>>,
    fail_when: Arc<Mutex<Option<FailPredicate<K>>>>,
    stats: Arc<Mutex<HashMap<K, KeyStats>>>,
}

impl<K> Debug for MockUpstream<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockUpstream")
            .field("min_latency", &self.min_latency)
            .field("max_latency", &self.max_latency)
            .field("failure_rate", &self.failure_rate)
            .field("fail_when", &self.fail_when.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl<K> Clone for MockUpstream<K> {
    fn clone(&self) -> Self {
        Self {
            clock: self.clock.clone(),
            min_latency: self.min_latency,
            max_latency: self.max_latency,
            failure_rate: self.failure_rate,
            rng: Arc::clone(&self.rng),
            fail_when: Arc::clone(&self.fail_when),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<K> MockUpstream<K> {
    /// Creates an upstream that answers immediately and never fails.
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            failure_rate: 0.0,
            rng: Arc::new(Mutex::new(fastrand::Rng::new())),
            fail_when: Arc::new(Mutex::new(None)),
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Makes every call take a latency drawn uniformly from `min..=max`.
    ///
    /// If `max` is below `min`, every call takes `min`.
    #[must_use]
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min;
        self.max_latency = max.max(min);
        self
    }

    /// Makes each call fail with probability `rate`, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Seeds the random source used for latencies, failures and values.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = fastrand::Rng::with_seed(seed);
        self
    }

    /// Sets a predicate that forces calls to fail.
    ///
    /// The predicate receives the key and the 1-based number of the call for that key. A call
    /// fails if the predicate returns `true` or the random failure rate says so.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&K, u64) -> bool + Send + Sync + 'static,
    {
        *self.fail_when.lock() = Some(Box::new(predicate));
    }

    /// Clears the failure predicate.
    pub fn clear_failures(&self) {
        *self.fail_when.lock() = None;
    }

    fn draw(&self) -> (Duration, bool, u32) {
        let mut rng = self.rng.lock();
        let spread = self.max_latency.saturating_sub(self.min_latency);
        let latency = self.min_latency + spread.mul_f64(rng.f64());
        let fails = rng.f64() < self.failure_rate;
        (latency, fails, rng.u32(0..1000))
    }
}

impl<K> MockUpstream<K>
where
    K: Clone + Eq + Hash,
{
    /// Returns a snapshot of the calls seen so far.
    #[must_use]
    pub fn stats(&self) -> UpstreamStats<K> {
        UpstreamStats {
            per_key: self.stats.lock().clone(),
        }
    }

    /// Clears all counters.
    pub fn reset_stats(&self) {
        self.stats.lock().clear();
    }

    fn begin(&self, key: &K) -> (u64, InFlight<K>) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(key.clone()).or_default();
        entry.total += 1;
        entry.in_flight += 1;
        entry.max_in_flight = entry.max_in_flight.max(entry.in_flight);

        let guard = InFlight {
            key: key.clone(),
            stats: Arc::clone(&self.stats),
        };
        (entry.total, guard)
    }
}

impl<K> Upstream<K, String> for MockUpstream<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync,
{
    fn fetch(&self, key: &K) -> impl Future<Output = Result<String>> + Send {
        let (attempt, in_flight) = self.begin(key);
        let (latency, random_failure, n) = self.draw();
        let fails = random_failure || self.fail_when.lock().as_ref().is_some_and(|p| p(key, attempt));
        let value = format!("DataFor:{key} - {n}");
        let delay = self.clock.delay(latency);

        async move {
            delay.await;
            in_flight.finish(!fails);

            if fails {
                Err(UpstreamFailure::caused_by("Random API failure"))
            } else {
                Ok(value)
            }
        }
    }
}

/// Decrements the in-flight count of a key when its call ends, including when it is dropped.
struct InFlight<K: Eq + Hash> {
    key: K,
    stats: Arc<Mutex<HashMap<K, KeyStats>>>,
}

impl<K: Eq + Hash> InFlight<K> {
    fn finish(self, succeeded: bool) {
        if let Some(entry) = self.stats.lock().get_mut(&self.key) {
            if succeeded {
                entry.succeeded += 1;
            } else {
                entry.failed += 1;
            }
        }
    }
}

impl<K: Eq + Hash> Drop for InFlight<K> {
    fn drop(&mut self) {
        if let Some(entry) = self.stats.lock().get_mut(&self.key) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }
}
