// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[cfg(any(feature = "metrics", test))]
pub(crate) const FETCH_CACHE_NAME: &str = "fetch.cache";

#[cfg(any(feature = "metrics", test))]
pub(crate) const FETCH_ACTIVITY_NAME: &str = "fetch.activity";

#[cfg(test)]
pub(crate) const FETCH_EVENT_NAME: &str = "fetch.event";

#[cfg(test)]
pub(crate) const FETCH_ATTEMPT_NAME: &str = "fetch.attempt";

#[cfg(test)]
pub(crate) const FETCH_DURATION_NAME: &str = "fetch.duration_ns";
