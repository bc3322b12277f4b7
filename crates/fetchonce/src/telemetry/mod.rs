// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured logs and metrics for cache activity.
//!
//! Logs are emitted through `tracing` when enabled on the builder. Metrics are recorded through
//! OpenTelemetry when the `metrics` feature is enabled and a meter provider is supplied.

use std::{sync::Arc, time::Duration};

#[cfg(any(feature = "metrics", test))]
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter, MeterProvider},
};

use crate::{cache::CacheName, registry::AttemptId};

pub(crate) mod attributes;
#[cfg(any(feature = "metrics", test))]
pub(crate) mod metrics;
#[cfg(test)]
pub(crate) mod testing;

/// What happened to a single `get` call, or to the attempt it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchActivity {
    /// Served from a resolved entry.
    Hit,
    /// Joined an attempt another caller started.
    Attached,
    /// Installed a new attempt.
    Started,
    /// Upstream succeeded; the entry is now resolved.
    Resolved,
    /// Upstream failed; the entry was removed.
    Failed,
    /// Every caller gave up before upstream answered; the entry was removed.
    Abandoned,
}

impl FetchActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "fetch.hit",
            Self::Attached => "fetch.attached",
            Self::Started => "fetch.started",
            Self::Resolved => "fetch.resolved",
            Self::Failed => "fetch.failed",
            Self::Abandoned => "fetch.abandoned",
        }
    }
}

/// Telemetry configuration collected by the builder.
#[derive(Clone, Debug, Default)]
pub(crate) struct TelemetryConfig {
    logs_enabled: bool,
    #[cfg(any(feature = "metrics", test))]
    meter: Option<Meter>,
}

impl TelemetryConfig {
    #[must_use]
    pub(crate) fn with_logs(self) -> Self {
        Self {
            logs_enabled: true,
            ..self
        }
    }

    #[cfg(any(feature = "metrics", test))]
    #[must_use]
    pub(crate) fn with_metrics(mut self, provider: &dyn MeterProvider) -> Self {
        self.meter = Some(metrics::create_meter(provider));
        self
    }

    /// Builds the recorder. Nothing is allocated when everything is disabled.
    pub(crate) fn build(self) -> FetchTelemetry {
        #[cfg(any(feature = "metrics", test))]
        let metrics_enabled = self.meter.is_some();
        #[cfg(not(any(feature = "metrics", test)))]
        let metrics_enabled = false;

        if !self.logs_enabled && !metrics_enabled {
            return FetchTelemetry::default();
        }

        FetchTelemetry {
            inner: Some(Arc::new(TelemetryInner {
                logs_enabled: self.logs_enabled,
                #[cfg(any(feature = "metrics", test))]
                event_counter: self.meter.as_ref().map(metrics::create_event_counter),
                #[cfg(any(feature = "metrics", test))]
                upstream_duration: self.meter.as_ref().map(metrics::create_upstream_duration_histogram),
            })),
        }
    }
}

#[derive(Debug)]
struct TelemetryInner {
    logs_enabled: bool,
    #[cfg(any(feature = "metrics", test))]
    event_counter: Option<Counter<u64>>,
    #[cfg(any(feature = "metrics", test))]
    upstream_duration: Option<Histogram<f64>>,
}

/// Records cache activity. Cloning is cheap and disabled telemetry is a no-op.
#[derive(Clone, Debug, Default)]
pub(crate) struct FetchTelemetry {
    inner: Option<Arc<TelemetryInner>>,
}

impl FetchTelemetry {
    pub(crate) fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub(crate) fn record(&self, cache: CacheName, activity: FetchActivity, attempt: Option<AttemptId>, duration: Option<Duration>) {
        let Some(inner) = &self.inner else {
            return;
        };

        #[cfg(any(feature = "metrics", test))]
        {
            let attrs = [
                KeyValue::new(attributes::FETCH_CACHE_NAME, cache),
                KeyValue::new(attributes::FETCH_ACTIVITY_NAME, activity.as_str()),
            ];

            if let Some(counter) = &inner.event_counter {
                counter.add(1, &attrs);
            }

            if let (Some(d), Some(h)) = (duration, &inner.upstream_duration) {
                h.record(d.as_secs_f64(), &attrs);
            }
        }

        if inner.logs_enabled {
            Self::emit(cache, activity, attempt, duration);
        }
    }

    fn emit(cache: CacheName, activity: FetchActivity, attempt: Option<AttemptId>, duration: Option<Duration>) {
        let activity_name = activity.as_str();
        let attempt = attempt.map(AttemptId::get);
        let duration_ns = duration.map(|d| d.as_nanos());

        // Tracing level must be constant, so we use a macro to select the appropriate level.
        // Field names must match constants in attributes.rs.
        macro_rules! emit_event {
            ($level:ident) => {
                tracing::$level!(
                    fetch.cache = cache,
                    fetch.activity = activity_name,
                    fetch.attempt = ?attempt,
                    fetch.duration_ns = ?duration_ns,
                    "fetch.event"
                )
            };
        }

        match activity {
            FetchActivity::Hit | FetchActivity::Attached | FetchActivity::Started => emit_event!(debug),
            FetchActivity::Resolved | FetchActivity::Abandoned => emit_event!(info),
            FetchActivity::Failed => emit_event!(warn),
        }
    }
}
