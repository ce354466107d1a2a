//! The response side of one outbound HTTP call.
//!
//! # Responsibilities
//! - Expose status, headers and the buffered body
//! - Finalize the call once: latency, status and error metrics plus the
//!   "Finished an outgoing client HTTP request" log entry
//! - Decode JSON bodies, optionally against several candidate types
//!
//! # Design Decisions
//! - The body is already buffered when this wrapper exists, so `read_all`
//!   only memoizes the finish step
//! - Unknown status codes never become metric tags

use std::any::type_name;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::http::{response::Parts, HeaderMap, StatusCode};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::context::{LogField, RequestContext};
use crate::errors::ClientError;
use crate::http::client::HttpClient;
use crate::http::client_request::OutgoingRequest;
use crate::http::status::{is_error_status, is_known_status};
use crate::observability::metrics::{names, tags};

/// A decode target for [`ClientHttpResponse::read_and_unmarshal_body_multiple_options`].
pub trait JsonCandidate {
    /// Decode `bytes` into this candidate.
    fn try_fill(&mut self, bytes: &[u8]) -> Result<(), serde_json::Error>;

    fn type_name(&self) -> &'static str;
}

impl<T: DeserializeOwned> JsonCandidate for Option<T> {
    fn try_fill(&mut self, bytes: &[u8]) -> Result<(), serde_json::Error> {
        *self = Some(serde_json::from_slice(bytes)?);
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

/// Response wrapper returned by [`ClientHttpRequest::send`].
///
/// [`ClientHttpRequest::send`]: crate::http::ClientHttpRequest::send
#[derive(Debug)]
pub struct ClientHttpResponse {
    client: Arc<HttpClient>,
    ctx: RequestContext,
    method_name: String,
    request: OutgoingRequest,
    start_time: Instant,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    duration: Option<Duration>,
    finished: bool,
}

impl ClientHttpResponse {
    pub(crate) fn new(
        client: Arc<HttpClient>,
        ctx: RequestContext,
        method_name: String,
        request: OutgoingRequest,
        start_time: Instant,
        parts: Parts,
        body: Bytes,
    ) -> Self {
        Self {
            client,
            ctx,
            method_name,
            request,
            start_time,
            status: parts.status,
            headers: parts.headers,
            body,
            duration: None,
            finished: false,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// Call duration, known once the response has been finished.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// The whole response body. Repeated calls return the same bytes and
    /// finish the call only the first time.
    pub fn read_all(&mut self) -> Result<Bytes, ClientError> {
        if !self.finished {
            self.finish();
        }
        Ok(self.body.clone())
    }

    pub fn read_and_unmarshal_body<T: DeserializeOwned>(&mut self) -> Result<T, ClientError> {
        let body = self.read_all()?;
        serde_json::from_slice(&body).map_err(|e| {
            self.unmarshal_failed(&e);
            ClientError::Unmarshal {
                client_id: self.client.client_id().to_string(),
                method: self.method_name.clone(),
                type_name: type_name::<T>(),
                reason: e.to_string(),
            }
        })
    }

    /// Try each candidate in order; returns the index of the first one that
    /// decodes. Fails with every attempted type when none does.
    pub fn read_and_unmarshal_body_multiple_options(
        &mut self,
        candidates: &mut [&mut dyn JsonCandidate],
    ) -> Result<usize, ClientError> {
        let body = self.read_all()?;
        let mut failures = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter_mut().enumerate() {
            match candidate.try_fill(&body) {
                Ok(()) => return Ok(index),
                Err(e) => failures.push((candidate.type_name(), e.to_string())),
            }
        }

        self.client.instrumentation().metrics.inc_counter(
            &self.ctx,
            names::CLIENT_HTTP_UNMARSHAL_ERROR,
            1,
        );
        self.client.instrumentation().logger.warn(
            &self.ctx,
            "Could not parse response json into any of the candidates",
            vec![LogField::int("candidates", failures.len() as i64)],
        );
        Err(ClientError::UnmarshalMultiple {
            client_id: self.client.client_id().to_string(),
            method: self.method_name.clone(),
            failures,
        })
    }

    fn unmarshal_failed(&self, err: &serde_json::Error) {
        let instrumentation = self.client.instrumentation();
        instrumentation
            .metrics
            .inc_counter(&self.ctx, names::CLIENT_HTTP_UNMARSHAL_ERROR, 1);
        instrumentation.logger.warn(
            &self.ctx,
            "Could not parse response json",
            vec![LogField::error(err)],
        );
    }

    /// Fail with `UnexpectedStatus` unless the status is in `ok_statuses`.
    pub fn check_ok_response(&self, ok_statuses: &[u16]) -> Result<(), ClientError> {
        let code = self.status_code();
        if ok_statuses.contains(&code) {
            return Ok(());
        }
        self.client.instrumentation().logger.warn(
            &self.ctx,
            "Unknown response status code",
            vec![
                LogField::int("client_status_code", i64::from(code)),
                LogField::string(
                    "error_location",
                    format!("client::{}", self.client.client_id()),
                ),
            ],
        );
        Err(ClientError::UnexpectedStatus {
            code,
            body: self.body.clone(),
        })
    }

    /// Record latency, status and error metrics and the finish log entry.
    /// A second call logs an error and emits nothing.
    pub fn finish(&mut self) {
        let instrumentation = self.client.instrumentation();
        if self.finished {
            instrumentation.logger.error(
                &self.ctx,
                "Finished an outgoing client HTTP request twice",
                vec![LogField::string("method", self.method_name.as_str())],
            );
            return;
        }
        self.finished = true;

        let duration = self.start_time.elapsed();
        self.duration = Some(duration);
        instrumentation
            .metrics
            .record_timer(&self.ctx, names::CLIENT_LATENCY, duration);
        instrumentation
            .metrics
            .record_histogram_duration(&self.ctx, names::CLIENT_LATENCY_HIST, duration);

        let code = self.status_code();
        if is_known_status(code) {
            self.ctx = self.ctx.with_scope_tags([(tags::STATUS, code.to_string())]);
            instrumentation
                .metrics
                .inc_counter(&self.ctx, names::CLIENT_STATUS, 1);
        } else {
            instrumentation.logger.warn(
                &self.ctx,
                "Unknown status code",
                vec![LogField::int("UnknownStatusCode", i64::from(code))],
            );
        }

        let finished_at = SystemTime::now();
        let started_at = finished_at.checked_sub(duration).unwrap_or(finished_at);
        let mut fields = vec![
            LogField::string("method", self.request.method.as_str()),
            LogField::string("URL", self.request.uri.to_string()),
            LogField::time("timestamp-started", started_at),
            LogField::time("timestamp-finished", finished_at),
            LogField::int("statusCode", i64::from(code)),
        ];
        fields.extend(header_fields("Client-Req-Header-", &self.request.headers));
        fields.extend(header_fields("Client-Res-Header-", &self.headers));

        if is_error_status(code) {
            instrumentation
                .metrics
                .inc_counter(&self.ctx, names::CLIENT_ERRORS, 1);
            instrumentation.logger.warn(
                &self.ctx,
                "Finished an outgoing client HTTP request",
                fields,
            );
        } else {
            instrumentation.logger.debug(
                &self.ctx,
                "Finished an outgoing client HTTP request",
                fields,
            );
        }
    }
}

fn header_fields(prefix: &str, headers: &HeaderMap) -> Vec<LogField> {
    crate::headers::header_map_to_strings(headers)
        .into_iter()
        .map(|(name, value)| LogField::string(format!("{prefix}{name}"), value))
        .collect()
}
