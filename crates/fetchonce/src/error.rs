// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The error returned when an upstream fetch attempt fails.

use std::any::Any;

use recoverable::{Recovery, RecoveryInfo};

/// A failed upstream fetch attempt.
///
/// This is the only error [`FetchCache::get`](crate::FetchCache::get) produces. It is handed to
/// every caller that was attached to the failed attempt, which is why it is cheap to clone. The
/// failure is never cached: calling `get` again for the same key starts a new attempt.
///
/// The underlying cause, if any, is available through [`std::error::Error::source()`].
///
/// # Examples
///
/// ```
/// use fetchonce::UpstreamFailure;
///
/// let failure = UpstreamFailure::from_cause("connection reset");
/// assert!(failure.to_string().contains("connection reset"));
/// ```
#[ohno::error]
#[derive(Clone)]
pub struct UpstreamFailure {}

impl UpstreamFailure {
    /// Creates a failure from any type that can be converted to an error.
    pub fn from_cause(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(cause)
    }

    /// Creates a failure from the payload of an upstream call that panicked.
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string payload".to_string());
        Self::caused_by(format!("upstream panicked: {message}"))
    }
}

/// Every upstream failure is transient from the cache's point of view.
impl Recovery for UpstreamFailure {
    fn recovery(&self) -> RecoveryInfo {
        RecoveryInfo::retry()
    }
}

/// A specialized [`Result`] type for fetch operations.
pub type Result<T> = std::result::Result<T, UpstreamFailure>;
