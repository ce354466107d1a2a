//! Distributed tracing support.
//!
//! # Responsibilities
//! - Extract trace context from inbound headers
//! - Inject trace context into outbound headers
//! - Open spans around outbound calls
//!
//! # Design Decisions
//! - Supports W3C Trace Context (`traceparent`) only
//! - Works over any [`HeaderCarrier`], so HTTP and RPC share one codepath
//! - Each span also opens a local `tracing` span for log correlation

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::context::LogField;
use crate::headers::HeaderCarrier;

/// W3C trace context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Identity of a span as propagated between services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    /// 32 lowercase hex characters.
    pub trace_id: String,
    /// 16 lowercase hex characters.
    pub span_id: String,
    pub sampled: bool,
}

impl SpanContext {
    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("00-{}-{}-{}", self.trace_id, self.span_id, flags)
    }

    /// Parse a `traceparent` value; `None` for anything malformed.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        let is_hex = |s: &str, len: usize| {
            s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
        };
        if !is_hex(version, 2) || version == "ff" || !is_hex(trace_id, 32) || !is_hex(span_id, 16) || !is_hex(flags, 2) {
            return None;
        }
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;

        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
            sampled: flags & 0x01 == 0x01,
        })
    }

    /// `trace.traceId`, `trace.span`, `trace.sampled` for sampled spans.
    pub fn log_fields(&self) -> Vec<LogField> {
        if !self.sampled {
            return Vec::new();
        }
        vec![
            LogField::string("trace.traceId", self.trace_id.clone()),
            LogField::string("trace.span", self.span_id.clone()),
            LogField::bool("trace.sampled", true),
        ]
    }
}

/// An open span. Dropping it without [`Span::finish`] records nothing.
#[derive(Debug)]
pub struct Span {
    operation: String,
    context: Option<SpanContext>,
    parent_span_id: Option<String>,
    tags: Vec<(String, String)>,
    started: Instant,
    local: ::tracing::Span,
}

impl Span {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// `None` for spans created by [`NoopTracer`].
    pub fn context(&self) -> Option<&SpanContext> {
        self.context.as_ref()
    }

    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    pub fn set_tag(&mut self, key: &str, value: &str) {
        self.tags.push((key.to_string(), value.to_string()));
    }

    pub fn log_fields(&self) -> Vec<LogField> {
        self.context
            .as_ref()
            .map(SpanContext::log_fields)
            .unwrap_or_default()
    }

    /// Close the span and return how long it was open.
    pub fn finish(self) -> Duration {
        let elapsed = self.started.elapsed();
        self.local.in_scope(|| {
            ::tracing::trace!(
                operation = %self.operation,
                elapsed_ms = elapsed.as_millis() as u64,
                "Span finished"
            );
        });
        elapsed
    }
}

/// Inject/extract capability consumed by both transports.
pub trait Tracer: Send + Sync {
    fn start_span(&self, operation: &str, parent: Option<&SpanContext>, tags: &[(&str, &str)]) -> Span;

    fn inject(&self, span: &Span, carrier: &mut dyn HeaderCarrier);

    fn extract(&self, carrier: &dyn HeaderCarrier) -> Option<SpanContext>;
}

/// W3C trace-context tracer that samples every span.
#[derive(Debug, Clone, Copy, Default)]
pub struct W3cTracer;

impl W3cTracer {
    fn new_span_id() -> String {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(16);
        id
    }
}

impl Tracer for W3cTracer {
    fn start_span(&self, operation: &str, parent: Option<&SpanContext>, tags: &[(&str, &str)]) -> Span {
        let context = SpanContext {
            trace_id: parent
                .map(|p| p.trace_id.clone())
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            span_id: Self::new_span_id(),
            sampled: true,
        };
        let local = ::tracing::info_span!(
            "outbound",
            operation = %operation,
            trace_id = %context.trace_id,
            span_id = %context.span_id,
        );

        Span {
            operation: operation.to_string(),
            parent_span_id: parent.map(|p| p.span_id.clone()),
            context: Some(context),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            started: Instant::now(),
            local,
        }
    }

    fn inject(&self, span: &Span, carrier: &mut dyn HeaderCarrier) {
        if let Some(ctx) = span.context() {
            carrier.set_header(TRACEPARENT_HEADER, &ctx.to_traceparent());
        }
    }

    fn extract(&self, carrier: &dyn HeaderCarrier) -> Option<SpanContext> {
        carrier
            .get_header(TRACEPARENT_HEADER)
            .and_then(SpanContext::from_traceparent)
    }
}

/// Tracer that opens no spans and propagates nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, operation: &str, _parent: Option<&SpanContext>, _tags: &[(&str, &str)]) -> Span {
        Span {
            operation: operation.to_string(),
            context: None,
            parent_span_id: None,
            tags: Vec::new(),
            started: Instant::now(),
            local: ::tracing::Span::none(),
        }
    }

    fn inject(&self, _span: &Span, _carrier: &mut dyn HeaderCarrier) {}

    fn extract(&self, _carrier: &dyn HeaderCarrier) -> Option<SpanContext> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::RpcHeaders;
    use axum::http::HeaderMap;

    #[test]
    fn traceparent_round_trips_through_headers() {
        let tracer = W3cTracer;
        let parent = tracer.start_span("bar.DoStuff(/foo)", None, &[("URL", "/foo")]);
        let mut headers = HeaderMap::new();
        tracer.inject(&parent, &mut headers);

        let extracted = tracer.extract(&headers).unwrap();
        assert_eq!(Some(&extracted), parent.context());

        let child = tracer.start_span("child", Some(&extracted), &[]);
        assert_eq!(child.context().unwrap().trace_id, extracted.trace_id);
        assert_eq!(child.parent_span_id(), Some(extracted.span_id.as_str()));
    }

    #[test]
    fn rejects_malformed_traceparent() {
        assert!(SpanContext::from_traceparent("00-abc-def-01").is_none());
        assert!(SpanContext::from_traceparent(
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01"
        )
        .is_none());
        let ok = SpanContext::from_traceparent(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00",
        )
        .unwrap();
        assert!(!ok.sampled);
        assert!(ok.log_fields().is_empty());
    }

    #[test]
    fn sampled_span_adds_trace_fields() {
        let span = W3cTracer.start_span("op", None, &[]);
        let keys: Vec<_> = span.log_fields().into_iter().map(|f| f.key).collect();
        assert_eq!(keys, ["trace.traceId", "trace.span", "trace.sampled"]);
    }

    #[test]
    fn noop_tracer_leaves_carrier_untouched() {
        let span = NoopTracer.start_span("op", None, &[]);
        let mut headers = RpcHeaders::new();
        NoopTracer.inject(&span, &mut headers);
        assert!(headers.is_empty());
        assert!(span.finish() < Duration::from_secs(1));
    }
}
