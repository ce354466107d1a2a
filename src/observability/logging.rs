//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the `tracing` subscriber (JSON or pretty, env-filtered)
//! - Provide the context logger that every call site logs through
//! - Count emitted entries per level
//!
//! # Design Decisions
//! - The logger holds no call data; everything per-call comes from the context
//! - Entries go to a pluggable sink so tests can capture them verbatim
//! - `fatal` and `panic` are recorded at error level and never abort

use std::fmt;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::context::{FieldValue, LogField, RequestContext};
use crate::observability::metrics::ContextMetrics;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    DPanic,
    Panic,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::DPanic => "dpanic",
            LogLevel::Panic => "panic",
            LogLevel::Fatal => "fatal",
        }
    }

    /// Name of the per-level emission counter.
    pub fn metric_name(&self) -> &'static str {
        match self {
            LogLevel::Debug => "log.emitted.debug",
            LogLevel::Info => "log.emitted.info",
            LogLevel::Warn => "log.emitted.warn",
            LogLevel::Error => "log.emitted.error",
            LogLevel::DPanic => "log.emitted.dpanic",
            LogLevel::Panic => "log.emitted.panic",
            LogLevel::Fatal => "log.emitted.fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully merged log entry: context fields first, then call-site fields.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub fields: Vec<LogField>,
}

impl LogEntry {
    /// Last value written under `key`.
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .rev()
            .find(|f| f.key == key)
            .map(|f| &f.value)
    }
}

/// Destination for log entries.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: &LogEntry);
}

struct RenderedFields<'a>(&'a [LogField]);

impl fmt::Display for RenderedFields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}

/// Forwards entries to `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, entry: &LogEntry) {
        let fields = RenderedFields(&entry.fields);
        let message = entry.message.as_str();
        match entry.level {
            LogLevel::Debug => tracing::debug!(fields = %fields, "{message}"),
            LogLevel::Info => tracing::info!(fields = %fields, "{message}"),
            LogLevel::Warn => tracing::warn!(fields = %fields, "{message}"),
            LogLevel::Error | LogLevel::DPanic | LogLevel::Panic | LogLevel::Fatal => {
                tracing::error!(level_name = entry.level.as_str(), fields = %fields, "{message}")
            }
        }
    }
}

/// Logger that merges context-carried fields into every entry.
#[derive(Clone)]
pub struct ContextLogger {
    sink: Arc<dyn LogSink>,
    metrics: Arc<dyn ContextMetrics>,
    root: RequestContext,
}

impl fmt::Debug for ContextLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextLogger").finish_non_exhaustive()
    }
}

impl ContextLogger {
    pub fn new(sink: Arc<dyn LogSink>, metrics: Arc<dyn ContextMetrics>) -> Self {
        Self {
            sink,
            metrics,
            root: RequestContext::background(),
        }
    }

    pub fn log(&self, level: LogLevel, ctx: &RequestContext, message: &str, fields: Vec<LogField>) {
        let mut merged = Vec::with_capacity(ctx.log_fields().len() + fields.len());
        merged.extend_from_slice(ctx.log_fields());
        merged.extend(fields);

        self.sink.write(&LogEntry {
            level,
            message: message.to_string(),
            fields: merged,
        });
        // Level counters are host-wide, not per-call.
        self.metrics.inc_counter(&self.root, level.metric_name(), 1);
    }

    pub fn debug(&self, ctx: &RequestContext, message: &str, fields: Vec<LogField>) {
        self.log(LogLevel::Debug, ctx, message, fields);
    }

    pub fn info(&self, ctx: &RequestContext, message: &str, fields: Vec<LogField>) {
        self.log(LogLevel::Info, ctx, message, fields);
    }

    pub fn warn(&self, ctx: &RequestContext, message: &str, fields: Vec<LogField>) {
        self.log(LogLevel::Warn, ctx, message, fields);
    }

    pub fn error(&self, ctx: &RequestContext, message: &str, fields: Vec<LogField>) {
        self.log(LogLevel::Error, ctx, message, fields);
    }

    pub fn dpanic(&self, ctx: &RequestContext, message: &str, fields: Vec<LogField>) {
        self.log(LogLevel::DPanic, ctx, message, fields);
    }

    pub fn panic(&self, ctx: &RequestContext, message: &str, fields: Vec<LogField>) {
        self.log(LogLevel::Panic, ctx, message, fields);
    }

    pub fn fatal(&self, ctx: &RequestContext, message: &str, fields: Vec<LogField>) {
        self.log(LogLevel::Fatal, ctx, message, fields);
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_logging(
    config: &ObservabilityConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.json_logs).then(|| tracing_subscriber::fmt::layer()))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CapturingSink, InMemoryMetrics};

    #[test]
    fn merges_context_fields_before_call_fields() {
        let sink = Arc::new(CapturingSink::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let logger = ContextLogger::new(sink.clone(), metrics.clone());

        let ctx = RequestContext::background()
            .with_log_fields([LogField::string("endpointID", "bar")]);
        logger.warn(&ctx, "Something odd", vec![LogField::int("attempt_count", 2)]);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(entries[0].fields[0].key, "endpointID");
        assert_eq!(entries[0].field("attempt_count"), Some(&FieldValue::Int(2)));
        assert_eq!(metrics.counter("log.emitted.warn", &[]), 1);
    }

    #[test]
    fn fatal_is_counted_but_does_not_abort() {
        let sink = Arc::new(CapturingSink::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let logger = ContextLogger::new(sink.clone(), metrics.clone());

        logger.fatal(&RequestContext::background(), "Unrecoverable", vec![]);
        logger.fatal(&RequestContext::background(), "Unrecoverable", vec![]);

        assert_eq!(metrics.counter("log.emitted.fatal", &[]), 2);
        assert_eq!(sink.entries_with_message("Unrecoverable").len(), 2);
    }
}
