// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The upstream fetch capability wrapped by the cache.
//!
//! [`Upstream`] is the only thing [`FetchCache`](crate::FetchCache) consumes from its environment.
//! Implement it for a client type, or adapt a closure with [`from_fn`].

use std::fmt::{self, Debug};

use crate::Result;

/// A slow, unreliable source of values.
///
/// Implementations may take arbitrarily long and may fail on any call, but a call that succeeds
/// must return the same value for the same key every time. The cache relies on this: it keeps the
/// first successful value forever and never asks upstream for that key again.
///
/// # Examples
///
/// ```
/// use fetchonce::{Upstream, UpstreamFailure};
///
/// struct Profiles;
///
/// impl Upstream<u64, String> for Profiles {
///     async fn fetch(&self, key: &u64) -> Result<String, UpstreamFailure> {
///         if *key == 0 {
///             return Err(UpstreamFailure::from_cause("no such profile"));
///         }
///         Ok(format!("profile-{key}"))
///     }
/// }
/// ```
pub trait Upstream<K, V>: Send + Sync {
    /// Fetches the value for `key`.
    fn fetch(&self, key: &K) -> impl Future<Output = Result<V>> + Send;
}

/// An [`Upstream`] backed by a closure, created by [`from_fn`].
pub struct FromFn<F> {
    f: F,
}

impl<F> Debug for FromFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FromFn").finish_non_exhaustive()
    }
}

/// Adapts a closure returning a future into an [`Upstream`].
///
/// The closure receives an owned copy of the key so the returned future does not borrow from the
/// caller.
///
/// # Examples
///
/// ```
/// use fetchonce::{FetchCache, UpstreamFailure, upstream};
/// use tick::Clock;
/// # futures::executor::block_on(async {
///
/// let cache = FetchCache::new(
///     upstream::from_fn(|key: String| async move { Ok::<_, UpstreamFailure>(key.to_uppercase()) }),
///     Clock::new_frozen(),
/// );
///
/// assert_eq!(cache.get(&"abc".to_string()).await?, "ABC");
/// # Ok::<(), fetchonce::UpstreamFailure>(())
/// # });
/// ```
pub fn from_fn<F>(f: F) -> FromFn<F> {
    FromFn { f }
}

impl<K, V, F, Fut> Upstream<K, V> for FromFn<F>
where
    K: Clone,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V>> + Send,
{
    fn fetch(&self, key: &K) -> impl Future<Output = Result<V>> + Send {
        (self.f)(key.clone())
    }
}
