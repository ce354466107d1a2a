//! Metrics façade.
//!
//! # Responsibilities
//! - Resolve `(name, scope tags)` to an instrument and record on it
//! - Memoize instruments so the hot path is a map lookup
//! - Expose a Prometheus scrape endpoint
//!
//! # Metrics
//! - Endpoint: `endpoint.request`, `endpoint.success`, `endpoint.status`,
//!   `endpoint.system-errors`, `endpoint.app-errors`, `endpoint.panic`,
//!   `endpoint.latency`, `endpoint.latency-hist`, `endpoint.overhead.latency`,
//!   `endpoint.overhead.latency-hist`, `endpoint.overhead.latency.ratio`
//! - Client: `client.request`, `client.success`, `client.status`,
//!   `client.errors`, `client.app-errors`, `client.system-errors`,
//!   `client.latency`, `client.latency-hist`, `client.http-unmarshal-error`,
//!   `client.binary-unmarshal-error`
//! - Logger: `log.emitted.<level>`
//!
//! # Design Decisions
//! - Tags come only from the context; call sites never pass ad-hoc labels
//! - Timers and histograms are both `metrics` histograms recorded in seconds
//! - `*-hist` metrics get explicit latency buckets on the exporter

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use thiserror::Error;

use crate::config::ObservabilityConfig;
use crate::context::RequestContext;

/// Stable metric names.
pub mod names {
    pub const ENDPOINT_REQUEST: &str = "endpoint.request";
    pub const ENDPOINT_SUCCESS: &str = "endpoint.success";
    pub const ENDPOINT_STATUS: &str = "endpoint.status";
    pub const ENDPOINT_SYSTEM_ERRORS: &str = "endpoint.system-errors";
    pub const ENDPOINT_APP_ERRORS: &str = "endpoint.app-errors";
    pub const ENDPOINT_PANIC: &str = "endpoint.panic";
    pub const ENDPOINT_LATENCY: &str = "endpoint.latency";
    pub const ENDPOINT_LATENCY_HIST: &str = "endpoint.latency-hist";
    pub const ENDPOINT_OVERHEAD_LATENCY: &str = "endpoint.overhead.latency";
    pub const ENDPOINT_OVERHEAD_LATENCY_HIST: &str = "endpoint.overhead.latency-hist";
    pub const ENDPOINT_OVERHEAD_RATIO: &str = "endpoint.overhead.latency.ratio";

    pub const CLIENT_REQUEST: &str = "client.request";
    pub const CLIENT_SUCCESS: &str = "client.success";
    pub const CLIENT_STATUS: &str = "client.status";
    pub const CLIENT_ERRORS: &str = "client.errors";
    pub const CLIENT_APP_ERRORS: &str = "client.app-errors";
    pub const CLIENT_SYSTEM_ERRORS: &str = "client.system-errors";
    pub const CLIENT_LATENCY: &str = "client.latency";
    pub const CLIENT_LATENCY_HIST: &str = "client.latency-hist";
    pub const CLIENT_HTTP_UNMARSHAL_ERROR: &str = "client.http-unmarshal-error";
    pub const CLIENT_BINARY_UNMARSHAL_ERROR: &str = "client.binary-unmarshal-error";
}

/// Stable tag keys and fixed tag values.
pub mod tags {
    pub const CLIENT: &str = "client";
    pub const CLIENT_METHOD: &str = "client_method";
    pub const TARGET_SERVICE: &str = "target_service";
    pub const TARGET_ENDPOINT: &str = "target_endpoint";
    pub const ENDPOINT: &str = "endpoint";
    pub const HANDLER: &str = "handler";
    pub const ENDPOINT_METHOD: &str = "endpoint_method";
    pub const PROTOCOL: &str = "protocol";
    pub const STATUS: &str = "status";
    pub const ERROR: &str = "error";
    pub const CLIENT_TYPE: &str = "client_type";

    pub const PROTOCOL_HTTP: &str = "http";
    pub const PROTOCOL_RPC: &str = "rpc";
}

/// Latency buckets (seconds) for `*-hist` metrics.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Context-scoped metric emission.
///
/// Every method resolves the instrument under the tag set carried by `ctx`.
pub trait ContextMetrics: Send + Sync {
    fn inc_counter(&self, ctx: &RequestContext, name: &str, delta: i64);
    fn record_timer(&self, ctx: &RequestContext, name: &str, dur: Duration);
    fn record_histogram_duration(&self, ctx: &RequestContext, name: &str, dur: Duration);
    fn gauge(&self, ctx: &RequestContext, name: &str, value: f64);
}

/// Instrument identity: metric name plus its sorted tag pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentKey {
    pub name: String,
    pub tags: Vec<(String, String)>,
}

impl InstrumentKey {
    pub fn new(ctx: &RequestContext, name: &str) -> Self {
        Self {
            name: name.to_string(),
            tags: ctx
                .scope_tags()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn labels(&self) -> Vec<::metrics::Label> {
        self.tags
            .iter()
            .map(|(k, v)| ::metrics::Label::new(k.clone(), v.clone()))
            .collect()
    }
}

/// [`ContextMetrics`] backed by the globally installed `metrics` recorder.
#[derive(Default)]
pub struct RecorderMetrics {
    counters: DashMap<InstrumentKey, ::metrics::Counter>,
    histograms: DashMap<InstrumentKey, ::metrics::Histogram>,
    gauges: DashMap<InstrumentKey, ::metrics::Gauge>,
}

impl std::fmt::Debug for RecorderMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderMetrics")
            .field("counters", &self.counters.len())
            .field("histograms", &self.histograms.len())
            .field("gauges", &self.gauges.len())
            .finish()
    }
}

impl RecorderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, key: InstrumentKey) -> ::metrics::Counter {
        if let Some(counter) = self.counters.get(&key) {
            return counter.value().clone();
        }
        let name = key.name.clone();
        let labels = key.labels();
        self.counters
            .entry(key)
            .or_insert_with(|| ::metrics::counter!(name, labels))
            .value()
            .clone()
    }

    fn histogram(&self, key: InstrumentKey) -> ::metrics::Histogram {
        if let Some(histogram) = self.histograms.get(&key) {
            return histogram.value().clone();
        }
        let name = key.name.clone();
        let labels = key.labels();
        self.histograms
            .entry(key)
            .or_insert_with(|| ::metrics::histogram!(name, labels))
            .value()
            .clone()
    }

    fn gauge_handle(&self, key: InstrumentKey) -> ::metrics::Gauge {
        if let Some(gauge) = self.gauges.get(&key) {
            return gauge.value().clone();
        }
        let name = key.name.clone();
        let labels = key.labels();
        self.gauges
            .entry(key)
            .or_insert_with(|| ::metrics::gauge!(name, labels))
            .value()
            .clone()
    }
}

impl ContextMetrics for RecorderMetrics {
    fn inc_counter(&self, ctx: &RequestContext, name: &str, delta: i64) {
        match u64::try_from(delta) {
            Ok(delta) => self.counter(InstrumentKey::new(ctx, name)).increment(delta),
            Err(_) => tracing::warn!(metric = name, delta, "Ignoring negative counter delta"),
        }
    }

    fn record_timer(&self, ctx: &RequestContext, name: &str, dur: Duration) {
        self.histogram(InstrumentKey::new(ctx, name))
            .record(dur.as_secs_f64());
    }

    fn record_histogram_duration(&self, ctx: &RequestContext, name: &str, dur: Duration) {
        self.histogram(InstrumentKey::new(ctx, name))
            .record(dur.as_secs_f64());
    }

    fn gauge(&self, ctx: &RequestContext, name: &str, value: f64) {
        self.gauge_handle(InstrumentKey::new(ctx, name)).set(value);
    }
}

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("-hist".to_string()), LATENCY_BUCKETS)?
        .install()?;

    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

#[derive(Debug, Error)]
pub enum MetricsInitError {
    #[error("invalid metrics address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Install the exporter as configured. Returns `false` when metrics are
/// disabled and nothing was installed.
pub fn init_metrics_from(config: &ObservabilityConfig) -> Result<bool, MetricsInitError> {
    if !config.metrics_enabled {
        tracing::info!("Metrics exporter disabled");
        return Ok(false);
    }
    let addr: SocketAddr =
        config
            .metrics_address
            .parse()
            .map_err(|e: std::net::AddrParseError| MetricsInitError::Address {
                address: config.metrics_address.clone(),
                reason: e.to_string(),
            })?;
    init_metrics(addr)?;
    Ok(true)
}
