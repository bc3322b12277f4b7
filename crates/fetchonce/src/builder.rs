// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for configuring a [`FetchCache`].

use std::{
    fmt::{self, Debug},
    hash::Hash,
    marker::PhantomData,
};

use tick::Clock;

use crate::{
    FetchCache, Upstream,
    cache::{CacheName, DEFAULT_NAME},
    telemetry::TelemetryConfig,
};

/// Builder for constructing a [`FetchCache`].
///
/// Created by calling [`FetchCache::builder`]. The cache can only be built once an upstream has
/// been supplied.
///
/// # Examples
///
/// ```
/// use fetchonce::{FetchCache, UpstreamFailure, upstream};
/// use tick::Clock;
///
/// let cache = FetchCache::builder::<String, usize>(Clock::new_frozen())
///     .name("lengths")
///     .upstream(upstream::from_fn(|key: String| async move { Ok::<_, UpstreamFailure>(key.len()) }))
///     .build();
/// ```
pub struct FetchCacheBuilder<K, V, U = ()> {
    name: CacheName,
    upstream: U,
    clock: Clock,
    telemetry: TelemetryConfig,
    _phantom: PhantomData<fn(K) -> V>,
}

impl<K, V, U> Debug for FetchCacheBuilder<K, V, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCacheBuilder")
            .field("name", &self.name)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl<K, V> FetchCacheBuilder<K, V, ()> {
    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            name: DEFAULT_NAME,
            upstream: (),
            clock,
            telemetry: TelemetryConfig::default(),
            _phantom: PhantomData,
        }
    }

    /// Sets the upstream the cache fetches values from.
    pub fn upstream<U>(self, upstream: U) -> FetchCacheBuilder<K, V, U>
    where
        U: Upstream<K, V>,
    {
        FetchCacheBuilder {
            name: self.name,
            upstream,
            clock: self.clock,
            telemetry: self.telemetry,
            _phantom: PhantomData,
        }
    }
}

impl<K, V, U> FetchCacheBuilder<K, V, U> {
    /// Sets the name that identifies this cache in logs and metrics.
    ///
    /// Defaults to `"fetchonce"`.
    #[must_use]
    pub fn name(mut self, name: CacheName) -> Self {
        self.name = name;
        self
    }

    /// Emits a `tracing` event for every lookup and every settled upstream attempt.
    ///
    /// Lookups are logged at `DEBUG`, successful attempts at `INFO` and failed attempts at `WARN`.
    #[must_use]
    pub fn enable_logs(mut self) -> Self {
        self.telemetry = self.telemetry.with_logs();
        self
    }

    /// Records OpenTelemetry metrics through `provider`.
    ///
    /// Every lookup and settled attempt increments `fetch.event.count`, and every settled attempt
    /// records its duration in `fetch.upstream.duration`.
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    #[must_use]
    pub fn metrics(mut self, provider: &dyn opentelemetry::metrics::MeterProvider) -> Self {
        self.telemetry = self.telemetry.with_metrics(provider);
        self
    }

    /// Returns a reference to the builder's clock.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

impl<K, V, U> FetchCacheBuilder<K, V, U>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    U: Upstream<K, V> + 'static,
{
    /// Builds the cache.
    #[must_use]
    pub fn build(self) -> FetchCache<K, V, U> {
        FetchCache::from_parts(self.name, self.upstream, self.clock, self.telemetry)
    }
}
