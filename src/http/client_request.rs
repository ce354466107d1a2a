//! One outbound HTTP call.
//!
//! # Responsibilities
//! - Materialize the outgoing request from JSON or raw bytes
//! - Validate mandatory headers before anything touches the network
//! - Drive the attempt loop under the context's timeout/retry options
//! - Emit `client.request`, the outbound span and the capture event
//!
//! # Design Decisions
//! - Lifecycle is start → write → send; `started` guards double start
//! - Request body is kept as `Bytes` so every attempt replays it
//! - The retry loop is capped by `overall_timeout` on top of per-attempt deadlines

use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri};
use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;

use crate::capture::{CaptureEvent, HttpOutgoingEvent};
use crate::context::{LogField, RequestContext};
use crate::errors::ClientError;
use crate::headers::missing_headers;
use crate::http::client::{HttpClient, RawResponse};
use crate::http::client_response::ClientHttpResponse;
use crate::observability::metrics::{names, tags};

/// The materialized request, kept for retries, logs and capture.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Per-call outbound HTTP request wrapper.
#[derive(Debug)]
pub struct ClientHttpRequest {
    client: Arc<HttpClient>,
    method_name: String,
    target_endpoint: String,
    ctx: RequestContext,
    raw_body: Bytes,
    outgoing: Option<OutgoingRequest>,
    start_time: Instant,
    started: bool,
}

impl ClientHttpRequest {
    pub fn new(client: Arc<HttpClient>, ctx: &RequestContext, method_name: &str) -> Self {
        let target_endpoint = client
            .target_endpoint(method_name)
            .unwrap_or_default()
            .to_string();
        let ctx = ctx
            .with_scope_tags([
                (tags::CLIENT, client.client_id()),
                (tags::CLIENT_METHOD, method_name),
                (tags::TARGET_ENDPOINT, target_endpoint.as_str()),
                (tags::CLIENT_TYPE, tags::PROTOCOL_HTTP),
            ])
            .with_log_fields([
                LogField::string("clientID", client.client_id()),
                LogField::string("clientMethod", method_name),
            ]);

        let mut request = Self {
            client,
            method_name: method_name.to_string(),
            target_endpoint,
            ctx,
            raw_body: Bytes::new(),
            outgoing: None,
            start_time: Instant::now(),
            started: false,
        };
        request.start();
        request
    }

    /// Mark the call as started. A second call logs an error and changes nothing.
    pub fn start(&mut self) {
        if self.started {
            self.client.instrumentation().logger.error(
                &self.ctx,
                "Cannot start ClientHTTPRequest twice",
                vec![LogField::string("method", self.method_name.as_str())],
            );
            return;
        }
        self.started = true;
        self.start_time = Instant::now();
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn target_endpoint(&self) -> &str {
        &self.target_endpoint
    }

    /// The request as materialized by the last successful write.
    pub fn outgoing(&self) -> Option<&OutgoingRequest> {
        self.outgoing.as_ref()
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    /// Serialize `body` as JSON and materialize the request.
    ///
    /// `None` sends an empty body.
    pub fn write_json<T: Serialize + ?Sized>(
        &mut self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<&T>,
    ) -> Result<(), ClientError> {
        let bytes = match body {
            Some(body) => serde_json::to_vec(body).map_err(|source| {
                self.client.instrumentation().logger.error(
                    &self.ctx,
                    "Could not serialize request json",
                    vec![LogField::error(&source)],
                );
                ClientError::Serialize {
                    client_id: self.client.client_id().to_string(),
                    method: self.method_name.clone(),
                    source,
                }
            })?,
            None => Vec::new(),
        };
        self.write_bytes(method, url, headers, bytes)?;

        if let Some(outgoing) = self.outgoing.as_mut() {
            if !outgoing.headers.contains_key(header::CONTENT_TYPE) {
                outgoing.headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
        }
        Ok(())
    }

    /// Materialize the request from raw bytes.
    ///
    /// Default headers go first, then `headers` overwrite them by name, then
    /// the request UUID is propagated when the context carries one.
    pub fn write_bytes(
        &mut self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| self.build_error(format!("invalid HTTP method \"{method}\"")))?;
        let uri = self.client.resolve_url(url).map_err(|e| self.build_error(e))?;

        let mut header_map = self.client.default_headers().clone();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| self.build_error(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| self.build_error(format!("invalid header value {value:?}: {e}")))?;
            header_map.insert(name, value);
        }

        let uuid_key = self.client.request_uuid_header_key();
        if let Some(uuid) = self.ctx.request_uuid().filter(|_| !uuid_key.is_empty()) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(uuid_key.as_bytes()),
                HeaderValue::from_str(uuid),
            ) {
                header_map.insert(name, value);
            }
        }

        self.raw_body = body.into();
        self.outgoing = Some(OutgoingRequest {
            method,
            uri,
            headers: header_map,
        });
        Ok(())
    }

    fn build_error(&self, reason: String) -> ClientError {
        self.client.instrumentation().logger.error(
            &self.ctx,
            "Could not create outbound request",
            vec![LogField::string("error", reason.as_str())],
        );
        ClientError::RequestBuild {
            client_id: self.client.client_id().to_string(),
            method: self.method_name.clone(),
            reason,
        }
    }

    /// Fail with `MissingHeaders` unless every name in `expected` is present
    /// and non-empty on the outgoing request.
    pub fn check_headers(&self, expected: &[&str]) -> Result<(), ClientError> {
        let empty = HeaderMap::new();
        let headers = self.outgoing.as_ref().map_or(&empty, |o| &o.headers);
        let missing = missing_headers(headers, expected);
        if missing.is_empty() {
            return Ok(());
        }
        self.client.instrumentation().logger.warn(
            &self.ctx,
            "Got outbound request without mandatory header",
            vec![LogField::string("headers", missing.join(","))],
        );
        Err(ClientError::MissingHeaders { names: missing })
    }

    /// Send the request, retrying per the context's timeout/retry options.
    pub async fn send(&mut self) -> Result<ClientHttpResponse, ClientError> {
        let client = Arc::clone(&self.client);
        let instrumentation = client.instrumentation();

        let Some(mut outgoing) = self.outgoing.clone() else {
            let err = self.build_error("request has not been written".to_string());
            return Err(ClientError::outbound(client.client_id(), &self.method_name, err));
        };

        let operation = format!(
            "{}.{}({})",
            client.client_id(),
            self.method_name,
            self.target_endpoint
        );
        let url = outgoing.uri.to_string();
        let span = instrumentation.tracer.start_span(
            &operation,
            self.ctx.span_context(),
            &[("URL", url.as_str()), ("Method", outgoing.method.as_str())],
        );
        instrumentation.tracer.inject(&span, &mut outgoing.headers);
        self.ctx = self.ctx.with_log_fields(span.log_fields());
        self.outgoing = Some(outgoing.clone());

        let options = self
            .ctx
            .timeout_retry()
            .copied()
            .or_else(|| client.default_timeout_retry().copied())
            .filter(|options| options.retries_enabled());

        let (result, attempts) = match options {
            None => {
                let attempt_ctx = self.ctx.with_timeout(client.timeout());
                (attempt(&client, &attempt_ctx, &outgoing, &self.raw_body).await, 1)
            }
            Some(options) => {
                let harness_ctx = self.ctx.with_timeout(options.overall_timeout);
                let mut number = 0;
                loop {
                    number += 1;
                    let attempt_ctx = harness_ctx.with_timeout(options.per_attempt_timeout);
                    match attempt(&client, &attempt_ctx, &outgoing, &self.raw_body).await {
                        Ok(raw) => break (Ok(raw), number),
                        Err(err) => {
                            if number >= options.max_attempts
                                || !client
                                    .retry_policy()
                                    .should_retry(&harness_ctx, number, &options)
                                    .await
                            {
                                break (Err(err), number);
                            }
                            tracing::debug!(
                                client_id = %client.client_id(),
                                method = %self.method_name,
                                attempt = number,
                                error = %err,
                                "Retrying outbound http request"
                            );
                        }
                    }
                }
            }
        };

        span.finish();
        self.ctx = self
            .ctx
            .with_log_fields([LogField::int("attempt_count", i64::from(attempts))]);
        instrumentation
            .metrics
            .inc_counter(&self.ctx, names::CLIENT_REQUEST, i64::from(attempts));

        match result {
            Ok((parts, body)) => {
                if let Some(events) = self.ctx.event_container().filter(|_| self.ctx.to_capture()) {
                    events.push(CaptureEvent::HttpOutgoing(HttpOutgoingEvent {
                        client_id: client.client_id().to_string(),
                        target: self.target_endpoint.clone(),
                        url,
                        method: outgoing.method.clone(),
                        req_headers: outgoing.headers.clone(),
                        req_body: self.raw_body.clone(),
                        status: parts.status.as_u16(),
                        res_headers: parts.headers.clone(),
                        res_body: body.clone(),
                    }));
                }
                Ok(ClientHttpResponse::new(
                    Arc::clone(&client),
                    self.ctx.clone(),
                    self.method_name.clone(),
                    outgoing,
                    self.start_time,
                    parts,
                    body,
                ))
            }
            Err(err) => {
                instrumentation.logger.warn(
                    &self.ctx,
                    "Could not make outbound request",
                    vec![LogField::string("error", err.to_string())],
                );
                Err(ClientError::outbound(client.client_id(), &self.method_name, err))
            }
        }
    }
}

async fn attempt(
    client: &HttpClient,
    ctx: &RequestContext,
    outgoing: &OutgoingRequest,
    body: &Bytes,
) -> Result<RawResponse, ClientError> {
    ctx.run(client.execute(&outgoing.method, &outgoing.uri, &outgoing.headers, body))
        .await
        .map_err(ClientError::Context)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestInstrumentation;

    fn client(test: &TestInstrumentation) -> Arc<HttpClient> {
        Arc::new(
            HttpClient::builder("bar", "http://127.0.0.1:1")
                .method("Normal", "/bar-path")
                .default_header("x-client", "gateway")
                .default_header("accept", "text/plain")
                .request_uuid_header_key("x-request-uuid")
                .instrumentation(test.instrumentation.clone())
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn per_call_headers_override_defaults() {
        let test = TestInstrumentation::new();
        let ctx = RequestContext::background().with_request_uuid("uuid-1");
        let mut req = client(&test).new_request(&ctx, "Normal");
        req.write_json("POST", "/bar-path", &[("Accept", "application/test+json")], Some(&1))
            .unwrap();

        let outgoing = req.outgoing().unwrap();
        assert_eq!(outgoing.headers["accept"], "application/test+json");
        assert_eq!(outgoing.headers["x-client"], "gateway");
        assert_eq!(outgoing.headers["x-request-uuid"], "uuid-1");
        assert_eq!(outgoing.headers["content-type"], "application/json");
        assert_eq!(outgoing.uri.to_string(), "http://127.0.0.1:1/bar-path");
        assert_eq!(req.raw_body().as_ref(), b"1");
    }

    #[test]
    fn invalid_method_is_a_build_error() {
        let test = TestInstrumentation::new();
        let mut req = client(&test).new_request(&RequestContext::background(), "Normal");
        let err = req
            .write_json("@INVALIDMETHOD", "/foo", &[], None::<&()>)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Could not create outbound"));
        assert!(msg.contains("@INVALIDMETHOD"));
        assert_eq!(test.logs.entries_with_message("Could not create outbound request").len(), 1);
    }

    #[test]
    fn second_start_logs_error() {
        let test = TestInstrumentation::new();
        let mut req = client(&test).new_request(&RequestContext::background(), "Normal");
        req.start();
        assert_eq!(test.logs.entries_with_message("Cannot start ClientHTTPRequest twice").len(), 1);
    }

    #[test]
    fn scope_tags_name_client_and_target() {
        let test = TestInstrumentation::new();
        let req = client(&test).new_request(&RequestContext::background(), "Normal");
        let tags = req.context().scope_tags();
        assert_eq!(tags["client"], "bar");
        assert_eq!(tags["client_method"], "Normal");
        assert_eq!(tags["target_endpoint"], "/bar-path");
        assert_eq!(tags["client_type"], "http");
    }

    #[tokio::test]
    async fn missing_headers_block_send() {
        let test = TestInstrumentation::new();
        let mut req = client(&test).new_request(&RequestContext::background(), "Normal");
        req.write_bytes("GET", "/bar-path", &[("x-token", "")], Bytes::new())
            .unwrap();
        let err = req.check_headers(&["x-uuid", "x-token", "x-client"]).unwrap_err();
        assert_eq!(err.to_string(), "missing mandatory headers: x-uuid, x-token");
        assert_eq!(test.metrics.counter("client.request", &[]), 0);
    }
}
