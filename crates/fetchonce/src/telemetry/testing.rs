// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory sinks for fetch telemetry, so tests assert on recorded events rather than on text.

use std::{fmt::Debug, str::FromStr, sync::Arc};

use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::{
    InMemoryMetricExporter, SdkMeterProvider,
    data::{AggregatedMetrics, Metric, MetricData},
};
use parking_lot::Mutex;
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{Layer, layer::Context};

use super::{FetchActivity, attributes};

/// A `fetch.event` log record, decoded from its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FetchEvent {
    pub level: Level,
    pub cache: String,
    pub activity: String,
    pub attempt: Option<u64>,
    pub duration_ns: Option<u128>,
}

/// A `tracing` layer that keeps every `fetch.event` it sees.
///
/// Install with `tracing::subscriber::set_default(capture.subscriber())`, which only affects the
/// current thread. Other events are ignored.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventCapture {
    events: Arc<Mutex<Vec<FetchEvent>>>,
}

impl EventCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber(&self) -> impl Subscriber {
        use tracing_subscriber::layer::SubscriberExt;
        tracing_subscriber::registry().with(self.clone())
    }

    pub fn events(&self) -> Vec<FetchEvent> {
        self.events.lock().clone()
    }

    /// Returns the activity names in the order they were logged.
    pub fn activities(&self) -> Vec<String> {
        self.events.lock().iter().map(|event| event.activity.clone()).collect()
    }

    /// Returns the only event logged for `activity`.
    pub fn single(&self, activity: FetchActivity) -> FetchEvent {
        let events = self.events();
        let matching: Vec<_> = events.iter().filter(|event| event.activity == activity.as_str()).collect();
        assert_eq!(matching.len(), 1, "expected one {} event, got: {events:#?}", activity.as_str());
        matching[0].clone()
    }
}

impl<S: Subscriber> Layer<S> for EventCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        if fields.message.as_deref() != Some(attributes::FETCH_EVENT_NAME) {
            return;
        }

        self.events.lock().push(FetchEvent {
            level: *event.metadata().level(),
            cache: fields.cache.unwrap_or_default(),
            activity: fields.activity.unwrap_or_default(),
            attempt: fields.attempt.as_deref().and_then(parse_some),
            duration_ns: fields.duration_ns.as_deref().and_then(parse_some),
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    cache: Option<String>,
    activity: Option<String>,
    attempt: Option<String>,
    duration_ns: Option<String>,
}

impl FieldVisitor {
    fn slot(&mut self, field: &Field) -> Option<&mut Option<String>> {
        match field.name() {
            "message" => Some(&mut self.message),
            attributes::FETCH_CACHE_NAME => Some(&mut self.cache),
            attributes::FETCH_ACTIVITY_NAME => Some(&mut self.activity),
            attributes::FETCH_ATTEMPT_NAME => Some(&mut self.attempt),
            attributes::FETCH_DURATION_NAME => Some(&mut self.duration_ns),
            _ => None,
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if let Some(slot) = self.slot(field) {
            *slot = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if let Some(slot) = self.slot(field) {
            *slot = Some(format!("{value:?}"));
        }
    }
}

// Optional fields are logged with `?`, so they arrive as `Some(..)` or `None`.
fn parse_some<T: FromStr>(debug: &str) -> Option<T> {
    debug.strip_prefix("Some(")?.strip_suffix(')')?.parse().ok()
}

/// One aggregated data point of a fetch instrument.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MetricPoint {
    pub metric: String,
    pub attributes: Vec<KeyValue>,
    /// The sum for counters, the number of recordings for histograms.
    pub count: u64,
}

/// Collects fetch metrics in memory.
#[derive(Debug)]
pub(crate) struct MetricCapture {
    exporter: InMemoryMetricExporter,
    provider: SdkMeterProvider,
}

impl MetricCapture {
    pub fn new() -> Self {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder().with_periodic_exporter(exporter.clone()).build();
        Self { exporter, provider }
    }

    pub fn provider(&self) -> &SdkMeterProvider {
        &self.provider
    }

    /// Flushes the provider and returns every data point of the latest export.
    pub fn points(&self) -> Vec<MetricPoint> {
        self.provider.force_flush().expect("flushing in-memory metrics should succeed");
        let exports = self.exporter.get_finished_metrics().expect("in-memory exporter should be readable");

        exports
            .last()
            .into_iter()
            .flat_map(|resource| resource.scope_metrics())
            .flat_map(|scope| scope.metrics())
            .flat_map(points_of)
            .collect()
    }

    /// Returns the count of the `metric` data point whose attributes include all of `expected`.
    pub fn count(&self, metric: &str, expected: &[KeyValue]) -> Option<u64> {
        self.points()
            .into_iter()
            .find(|point| point.metric == metric && expected.iter().all(|kv| point.attributes.contains(kv)))
            .map(|point| point.count)
    }
}

// Only the instrument kinds this crate creates are decoded.
fn points_of(metric: &Metric) -> Vec<MetricPoint> {
    let point = |attributes: Vec<KeyValue>, count: u64| MetricPoint {
        metric: metric.name().to_string(),
        attributes,
        count,
    };

    match metric.data() {
        AggregatedMetrics::U64(MetricData::Sum(sum)) => sum
            .data_points()
            .map(|p| point(p.attributes().cloned().collect(), p.value()))
            .collect(),
        AggregatedMetrics::F64(MetricData::Histogram(histogram)) => histogram
            .data_points()
            .map(|p| point(p.attributes().cloned().collect(), p.count()))
            .collect(),
        _ => Vec::new(),
    }
}
