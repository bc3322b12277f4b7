// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The deduplicating fetch cache.

use std::{
    fmt::{self, Debug},
    hash::Hash,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures_util::future::{BoxFuture, FutureExt};
use tick::Clock;

use crate::{
    Result, Upstream, UpstreamFailure,
    builder::FetchCacheBuilder,
    registry::{Attempt, AttemptId, Lookup, Registry},
    telemetry::{FetchActivity, FetchTelemetry, TelemetryConfig},
};

/// Name used to identify a cache in logs and metrics.
pub type CacheName = &'static str;

pub(crate) const DEFAULT_NAME: CacheName = "fetchonce";

/// Fetches values from an [`Upstream`], successfully at most once per key.
///
/// `FetchCache` sits between any number of concurrent callers and a slow, unreliable upstream.
/// For every key, [`get`](Self::get) does one of three things:
///
/// - **Hit**: the key already has a value, which is returned without touching upstream.
/// - **Attach**: an upstream call for the key is in flight; the caller waits for it and receives
///   the same outcome as everyone else waiting on it.
/// - **Start**: nothing is known about the key; the caller starts a new upstream call that later
///   callers attach to.
///
/// A successful value is kept for the lifetime of the cache and never fetched again. A failure is
/// handed to every caller attached to that attempt and then forgotten, so the next `get` starts a
/// fresh attempt. The cache never retries on its own.
///
/// Waiting never blocks a thread, and no lock is held while upstream is working. Cloning a
/// `FetchCache` is cheap and the clones share all state.
///
/// # Examples
///
/// ```
/// use fetchonce::{FetchCache, UpstreamFailure, upstream};
/// use tick::Clock;
/// # futures::executor::block_on(async {
///
/// let cache = FetchCache::builder::<String, String>(Clock::new_frozen())
///     .name("profiles")
///     .upstream(upstream::from_fn(|id: String| async move {
///         Ok::<_, UpstreamFailure>(format!("profile of {id}"))
///     }))
///     .build();
///
/// let profile = cache.get(&"alice".to_string()).await?;
/// assert_eq!(profile, "profile of alice");
/// assert_eq!(cache.peek(&"alice".to_string()), Some(profile));
/// # Ok::<(), UpstreamFailure>(())
/// # });
/// ```
pub struct FetchCache<K, V, U = ()> {
    name: CacheName,
    registry: Arc<Registry<K, V>>,
    upstream: Arc<U>,
    clock: Clock,
    telemetry: FetchTelemetry,
}

impl<K, V, U> Clone for FetchCache<K, V, U> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            registry: Arc::clone(&self.registry),
            upstream: Arc::clone(&self.upstream),
            clock: self.clock.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}

impl<K, V, U> Debug for FetchCache<K, V, U>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCache")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl FetchCache<(), (), ()> {
    /// Creates a new cache builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use fetchonce::{FetchCache, UpstreamFailure, upstream};
    /// use tick::Clock;
    ///
    /// let cache = FetchCache::builder::<u32, u32>(Clock::new_frozen())
    ///     .name("squares")
    ///     .enable_logs()
    ///     .upstream(upstream::from_fn(|n: u32| async move { Ok::<_, UpstreamFailure>(n * n) }))
    ///     .build();
    ///
    /// assert_eq!(cache.name(), "squares");
    /// ```
    #[must_use]
    pub fn builder<K, V>(clock: Clock) -> FetchCacheBuilder<K, V> {
        FetchCacheBuilder::new(clock)
    }
}

impl<K, V, U> FetchCache<K, V, U>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    U: Upstream<K, V> + 'static,
{
    /// Creates a cache with default settings around `upstream`.
    ///
    /// Equivalent to `FetchCache::builder(clock).upstream(upstream).build()`.
    #[must_use]
    pub fn new(upstream: U, clock: Clock) -> Self {
        Self::from_parts(DEFAULT_NAME, upstream, clock, TelemetryConfig::default())
    }

    pub(crate) fn from_parts(name: CacheName, upstream: U, clock: Clock, telemetry: TelemetryConfig) -> Self {
        Self {
            name,
            registry: Arc::new(Registry::default()),
            upstream: Arc::new(upstream),
            clock,
            telemetry: telemetry.build(),
        }
    }

    /// Returns the value for `key`, fetching it from upstream if no value is known yet.
    ///
    /// Concurrent calls for the same key share a single upstream call. Once a call succeeds, the
    /// value is returned for every later `get` without contacting upstream again.
    ///
    /// Dropping a `get` future does not cancel the upstream call while other callers wait on it;
    /// they keep driving the same call, and a new call is never started while one is in flight.
    /// If every caller of a call is dropped before it completes, the call is handed off:
    ///
    /// - with the `tokio` feature and a Tokio runtime current, it is spawned and runs to
    ///   completion, settling the key as usual;
    /// - otherwise it is discarded and the key returns to absent, so the next `get` starts over.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamFailure`] if the upstream attempt this call started or attached to
    /// failed or panicked. The failure is not cached; call `get` again to retry.
    pub async fn get(&self, key: &K) -> Result<V> {
        let (activity, attempt) = match self.registry.lookup(key, |id| self.attempt(key.clone(), id)) {
            Lookup::Hit(value) => {
                self.telemetry.record(self.name, FetchActivity::Hit, None, None);
                return Ok(value);
            }
            Lookup::Attached(attempt) => (FetchActivity::Attached, attempt),
            Lookup::Started(attempt) => (FetchActivity::Started, attempt),
        };

        self.telemetry.record(self.name, activity, Some(attempt.id()), None);
        Waiter { cache: self, key, attempt }.wait().await
    }

    /// Builds the future shared by all callers of one attempt.
    ///
    /// The registry is settled before the outcome is published, so a caller that arrives after
    /// a failure always finds the key absent and one that arrives after a success always hits.
    /// A panic in upstream is reported as a failure.
    fn attempt(&self, key: K, id: AttemptId) -> BoxFuture<'static, Result<V>> {
        let upstream = Arc::clone(&self.upstream);
        let registry = Arc::downgrade(&self.registry);
        let clock = self.clock.clone();
        let telemetry = self.telemetry.clone();
        let name = self.name;

        async move {
            let stopwatch = clock.stopwatch();
            let outcome = AssertUnwindSafe(async { upstream.fetch(&key).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(UpstreamFailure::from_panic(&*payload)));
            let duration = stopwatch.elapsed();

            // The cache is gone; the waiters still get their outcome.
            let Some(registry) = registry.upgrade() else {
                return outcome;
            };

            match &outcome {
                Ok(value) => {
                    registry.resolve(&key, id, value);
                    telemetry.record(name, FetchActivity::Resolved, Some(id), Some(duration));
                }
                Err(_) => {
                    registry.retract(&key, id);
                    telemetry.record(name, FetchActivity::Failed, Some(id), Some(duration));
                }
            }

            outcome
        }
        .boxed()
    }

    /// Called when the last waiter of an unsettled attempt goes away.
    fn abandon(&self, key: &K, attempt: &Attempt<V>) {
        #[cfg(any(feature = "tokio", test))]
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            if self.registry.detach_abandoned(key, attempt.id()) {
                drop(runtime.spawn(attempt.clone().finish()));
            }
            return;
        }

        if self.registry.retract_abandoned(key, attempt.id()) {
            self.telemetry.record(self.name, FetchActivity::Abandoned, Some(attempt.id()), None);
        }
    }
}

/// One caller's interest in an attempt.
///
/// Dropping the last waiter before the attempt settles hands the attempt off, so the key never
/// stays pending on a call nobody drives.
struct Waiter<'a, K, V, U>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    U: Upstream<K, V> + 'static,
{
    cache: &'a FetchCache<K, V, U>,
    key: &'a K,
    attempt: Attempt<V>,
}

impl<K, V, U> Waiter<'_, K, V, U>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    U: Upstream<K, V> + 'static,
{
    async fn wait(self) -> Result<V> {
        self.attempt.clone().wait().await
    }
}

impl<K, V, U> Drop for Waiter<'_, K, V, U>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    U: Upstream<K, V> + 'static,
{
    fn drop(&mut self) {
        if self.attempt.release() && !self.attempt.is_settled() {
            self.cache.abandon(self.key, &self.attempt);
        }
    }
}

impl<K, V, U> FetchCache<K, V, U>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Returns the name of this cache for telemetry identification.
    #[must_use]
    pub fn name(&self) -> CacheName {
        self.name
    }

    /// Returns a reference to the clock used to time upstream calls.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Returns a reference to the wrapped upstream.
    #[must_use]
    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    /// Returns the value for `key` if it has already been fetched, without contacting upstream.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<V> {
        self.registry.peek(key)
    }

    /// Returns `true` if an upstream call for `key` is currently in flight.
    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.registry.is_pending(key)
    }

    /// Returns the number of keys with a value.
    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.registry.resolved_count()
    }

    /// Returns the number of keys with an upstream call in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }
}
