// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Fetches each key from a slow, unreliable upstream at most once.
//!
//! [`FetchCache`] wraps an [`Upstream`] that may take a long time and may fail on any call. It
//! guarantees that:
//!
//! - every key is successfully fetched from upstream **at most once** for the lifetime of the cache;
//! - concurrent callers for a key that is being fetched **attach** to the running call instead of
//!   starting another one, so at most one upstream call per key is ever in flight;
//! - failures are **never cached**: every caller attached to a failed call receives the same
//!   [`UpstreamFailure`], and the next caller starts a fresh call. A panicking upstream call is
//!   reported the same way;
//! - waiting never blocks a thread.
//!
//! The cache does not retry on its own. Callers that want a value eventually retry `get` in a
//! loop, typically behind their own backoff.
//!
//! # Examples
//!
//! ```
//! use fetchonce::{FetchCache, UpstreamFailure, upstream};
//! use tick::Clock;
//! # futures::executor::block_on(async {
//!
//! let cache = FetchCache::builder::<String, String>(Clock::new_frozen())
//!     .name("resources")
//!     .enable_logs()
//!     .upstream(upstream::from_fn(|key: String| async move {
//!         Ok::<_, UpstreamFailure>(format!("DataFor:{key}"))
//!     }))
//!     .build();
//!
//! let key = "res_1".to_string();
//! let first = cache.get(&key).await?;
//! let second = cache.get(&key).await?;
//! assert_eq!(first, second);
//! # Ok::<(), UpstreamFailure>(())
//! # });
//! ```
//!
//! # Retrying failures
//!
//! ```
//! # #[cfg(feature = "test-util")]
//! # fn main() {
//! use fetchonce::{FetchCache, testing::MockUpstream};
//! use tick::Clock;
//! # futures::executor::block_on(async {
//!
//! let upstream = MockUpstream::<String>::new(Clock::new_frozen());
//! upstream.fail_when(|_key, attempt| attempt <= 2);
//! let cache = FetchCache::new(upstream.clone(), Clock::new_frozen());
//!
//! let key = "res_1".to_string();
//! let value = loop {
//!     if let Ok(value) = cache.get(&key).await {
//!         break value;
//!     }
//! };
//!
//! assert!(value.starts_with("DataFor:res_1"));
//! assert_eq!(upstream.stats().key(&key).total, 3);
//! # });
//! # }
//! # #[cfg(not(feature = "test-util"))]
//! # fn main() {}
//! ```
//!
//! # Features
//!
//! - `metrics`: records OpenTelemetry metrics through a caller-supplied meter provider.
//! - `test-util`: exposes the `testing` module with a simulated upstream.
//! - `tokio`: when every caller of an in-flight upstream call is dropped, the call is spawned on
//!   the current Tokio runtime and runs to completion. Without it, or outside a runtime, such a
//!   call is discarded and the next `get` starts a new one.

pub mod builder;
mod cache;
mod error;
mod registry;
mod telemetry;
#[cfg(any(feature = "test-util", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;
pub mod upstream;

#[doc(inline)]
pub use builder::FetchCacheBuilder;
#[doc(inline)]
pub use cache::{CacheName, FetchCache};
#[doc(inline)]
pub use error::{Result, UpstreamFailure};
#[doc(inline)]
pub use upstream::Upstream;
