//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every call site (inbound endpoint, outbound client):
//!     → metrics.rs   (counter / timer / histogram / gauge under ctx scope tags)
//!     → logging.rs   (ContextLogger merges ctx log fields, counts per level)
//!     → tracing.rs   (span per outbound call, traceparent inject/extract)
//!
//! Consumers:
//!     → Prometheus scrape endpoint (metrics-exporter-prometheus)
//!     → tracing-subscriber fmt layer (JSON or pretty)
//! ```
//!
//! # Design Decisions
//! - The three capabilities travel together as one `Instrumentation` handle
//! - All three are trait objects so tests can swap in in-memory doubles
//! - Request ID and scope tags flow through the context, never globals

pub mod logging;
pub mod metrics;
pub mod tracing;

use std::sync::Arc;

pub use self::logging::{ContextLogger, LogEntry, LogLevel, LogSink, TracingSink};
pub use self::metrics::{ContextMetrics, MetricsInitError, RecorderMetrics};
pub use self::tracing::{NoopTracer, Span, SpanContext, Tracer, W3cTracer};

/// Metrics, logger and tracer shared by every client and endpoint.
#[derive(Clone)]
pub struct Instrumentation {
    pub metrics: Arc<dyn ContextMetrics>,
    pub logger: ContextLogger,
    pub tracer: Arc<dyn Tracer>,
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation").finish_non_exhaustive()
    }
}

impl Instrumentation {
    pub fn new(
        metrics: Arc<dyn ContextMetrics>,
        sink: Arc<dyn LogSink>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let logger = ContextLogger::new(sink, metrics.clone());
        Self {
            metrics,
            logger,
            tracer,
        }
    }

    /// Production wiring: global `metrics` recorder, `tracing` sink, W3C tracer.
    pub fn from_recorder() -> Self {
        Self::new(
            Arc::new(RecorderMetrics::new()),
            Arc::new(TracingSink),
            Arc::new(W3cTracer),
        )
    }
}
