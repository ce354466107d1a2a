//! Inbound HTTP response wrapper.
//!
//! # Responsibilities
//! - Stage status, headers and body without sending anything
//! - Let callers peek at or replace the staged JSON body
//! - Commit the staged response once and emit endpoint metrics
//!
//! # Design Decisions
//! - Writing stages; `flush` commits. `flush` consumes the wrapper, so a
//!   response cannot be committed twice
//! - 204 and 304 are committed without a body
//! - Overhead metrics only appear once a downstream duration was recorded

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::time::Instant;

use crate::context::{LogField, RequestContext};
use crate::http::status::{is_error_status, is_known_status, is_no_content_status};
use crate::observability::metrics::{names, tags};
use crate::observability::Instrumentation;

/// Response handed to an [`HttpHandler`](crate::http::HttpHandler).
pub struct ServerHttpResponse {
    ctx: RequestContext,
    instrumentation: Instrumentation,
    start_time: Instant,
    headers: HeaderMap,
    pending_status: u16,
    pending_body: Bytes,
    pending: bool,
    downstream: Option<Duration>,
}

impl std::fmt::Debug for ServerHttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHttpResponse")
            .field("pending_status", &self.pending_status)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl ServerHttpResponse {
    pub fn new(ctx: RequestContext, instrumentation: Instrumentation, start_time: Instant) -> Self {
        Self {
            ctx,
            instrumentation,
            start_time,
            headers: HeaderMap::new(),
            pending_status: 200,
            pending_body: Bytes::new(),
            pending: false,
            downstream: None,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Whether anything has been staged.
    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn pending_status(&self) -> u16 {
        self.pending_status
    }

    pub fn pending_body(&self) -> &Bytes {
        &self.pending_body
    }

    pub fn is_ok_response(&self) -> bool {
        (200..300).contains(&self.pending_status)
    }

    /// Serialize `body` as JSON and stage it.
    pub fn write_json<T: Serialize + ?Sized>(
        &mut self,
        status: u16,
        headers: &[(&str, &str)],
        body: &T,
    ) {
        match serde_json::to_vec(body) {
            Ok(bytes) => self.write_json_bytes(status, headers, bytes),
            Err(err) => self.send_error(500, "Could not serialize json response", &err),
        }
    }

    /// Stage already-encoded JSON.
    pub fn write_json_bytes(&mut self, status: u16, headers: &[(&str, &str)], body: impl Into<Bytes>) {
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.write_bytes(status, headers, body);
    }

    /// Stage raw bytes; `headers` overwrite any staged header of the same name.
    pub fn write_bytes(&mut self, status: u16, headers: &[(&str, &str)], body: impl Into<Bytes>) {
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    self.headers.insert(name, value);
                }
                _ => self.instrumentation.logger.warn(
                    &self.ctx,
                    "Dropping invalid response header",
                    vec![LogField::string("header", *name)],
                ),
            }
        }
        self.pending_status = status;
        self.pending_body = body.into();
        self.pending = true;
    }

    /// Log `message` with its cause and stage it as an error body.
    pub fn send_error(&mut self, status: u16, message: &str, cause: &dyn std::error::Error) {
        self.instrumentation.logger.warn(
            &self.ctx,
            "Sending error for endpoint request",
            vec![
                LogField::error(cause),
                LogField::string("errorMessage", message),
                LogField::int("statusCode", i64::from(status)),
            ],
        );
        self.send_error_string(status, message);
    }

    /// Stage `{"error":"<message>"}` as JSON.
    pub fn send_error_string(&mut self, status: u16, message: &str) {
        #[derive(Serialize)]
        struct ErrorBody<'a> {
            error: &'a str,
        }
        let body = serde_json::to_vec(&ErrorBody { error: message }).unwrap_or_default();
        self.write_json_bytes(status, &[], body);
    }

    /// Replace the staged body, keeping status and headers.
    pub fn set_pending_body(&mut self, body: impl Into<Bytes>) {
        self.pending_body = body.into();
    }

    /// Bytes of the staged JSON body at `path`; the whole body for an empty
    /// path. `None` when the body is not JSON or the path does not exist.
    pub fn peek_body(&self, path: &[&str]) -> Option<Bytes> {
        let text = std::str::from_utf8(&self.pending_body).ok()?;
        let mut current: &RawValue = serde_json::from_str(text).ok()?;
        for key in path {
            let object: HashMap<String, &RawValue> = serde_json::from_str(current.get()).ok()?;
            current = object.get(*key).copied()?;
        }
        Some(Bytes::copy_from_slice(current.get().as_bytes()))
    }

    /// Record how long the downstream work of this request took; used for
    /// the overhead metrics.
    pub fn set_downstream_finish(&mut self, downstream: Duration) {
        self.downstream = Some(downstream);
    }

    /// Commit the staged response and emit endpoint metrics.
    pub fn flush(mut self) -> Response {
        if !self.pending {
            self.instrumentation.logger.error(
                &self.ctx,
                "Endpoint handler did not write a response",
                vec![],
            );
            self.send_error_string(500, "Endpoint handler did not write a response");
        }

        let status = StatusCode::from_u16(self.pending_status).unwrap_or_else(|_| {
            self.instrumentation.logger.error(
                &self.ctx,
                "Invalid status code, sending 500",
                vec![LogField::int("statusCode", i64::from(self.pending_status))],
            );
            StatusCode::INTERNAL_SERVER_ERROR
        });
        let code = status.as_u16();
        let body = if is_no_content_status(code) {
            Body::empty()
        } else {
            Body::from(self.pending_body.clone())
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        self.finish(code, response.headers());
        response
    }

    fn finish(&self, code: u16, headers: &HeaderMap) {
        let metrics = &self.instrumentation.metrics;
        let logger = &self.instrumentation.logger;
        let latency = self.start_time.elapsed();

        let ctx = if is_known_status(code) {
            let ctx = self.ctx.with_scope_tags([(tags::STATUS, code.to_string())]);
            metrics.inc_counter(&ctx, names::ENDPOINT_STATUS, 1);
            ctx
        } else {
            logger.error(
                &self.ctx,
                "Unknown status code",
                vec![LogField::int("UnknownStatusCode", i64::from(code))],
            );
            self.ctx.clone()
        };
        metrics.record_timer(&ctx, names::ENDPOINT_LATENCY, latency);
        metrics.record_histogram_duration(&ctx, names::ENDPOINT_LATENCY_HIST, latency);

        if let Some(downstream) = self.downstream {
            let overhead = latency.saturating_sub(downstream);
            metrics.record_timer(&ctx, names::ENDPOINT_OVERHEAD_LATENCY, overhead);
            metrics.record_histogram_duration(&ctx, names::ENDPOINT_OVERHEAD_LATENCY_HIST, overhead);
            if !latency.is_zero() {
                metrics.gauge(
                    &ctx,
                    names::ENDPOINT_OVERHEAD_RATIO,
                    overhead.as_secs_f64() / latency.as_secs_f64(),
                );
            }
        }

        let finished_at = SystemTime::now();
        let started_at = finished_at.checked_sub(latency).unwrap_or(finished_at);
        let mut fields = vec![
            LogField::time("timestamp-started", started_at),
            LogField::time("timestamp-finished", finished_at),
            LogField::int("statusCode", i64::from(code)),
        ];
        fields.extend(
            crate::headers::header_map_to_strings(headers)
                .into_iter()
                .map(|(name, value)| LogField::string(format!("Res-Header-{name}"), value)),
        );

        if is_error_status(code) {
            metrics.inc_counter(&ctx, names::ENDPOINT_APP_ERRORS, 1);
            logger.warn(&ctx, "Finished an incoming server HTTP request with error", fields);
        } else {
            logger.debug(&ctx, "Finished an incoming server HTTP request", fields);
        }
    }
}
