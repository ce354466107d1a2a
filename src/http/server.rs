//! HTTP endpoint dispatch.
//!
//! # Responsibilities
//! - Seed the per-request context (tags, log fields, request UUID, span)
//! - Run user extractors and the endpoint handler
//! - Recover handler panics as a 500 and count them
//! - Mount endpoints on an Axum router with trace and timeout layers
//! - Bind and serve the router from `HttpServerConfig` until shutdown
//!
//! # Design Decisions
//! - Handlers take request and response by value and hand the response back;
//!   the dispatcher owns the final flush
//! - Path params come from `RawPathParams`, so routes without captures work

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::RawPathParamsRejection, RawPathParams, Request},
    http::Method,
    response::Response,
    routing::{on, MethodFilter},
    Router,
};
use futures_util::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::HttpServerConfig;
use crate::context::{ContextExtractors, LogField, RequestContext};
use crate::headers::header_map_to_strings;
use crate::http::request::ServerHttpRequest;
use crate::http::response::ServerHttpResponse;
use crate::observability::metrics::{names, tags};
use crate::observability::Instrumentation;

/// Body sent when a handler panics.
pub const PANIC_RESPONSE_MESSAGE: &str = "Unexpected workflow panic, recovered at endpoint.";

/// An endpoint's business logic.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle(
        &self,
        req: ServerHttpRequest,
        res: ServerHttpResponse,
    ) -> BoxFuture<'static, ServerHttpResponse>;
}

impl<F, Fut> HttpHandler for F
where
    F: Fn(ServerHttpRequest, ServerHttpResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerHttpResponse> + Send + 'static,
{
    fn handle(
        &self,
        req: ServerHttpRequest,
        res: ServerHttpResponse,
    ) -> BoxFuture<'static, ServerHttpResponse> {
        Box::pin(self(req, res))
    }
}

/// Errors while mounting endpoints.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("endpoint {endpoint_id}: method {method} cannot be routed")]
    UnsupportedMethod { endpoint_id: String, method: String },

    #[error("endpoint {endpoint_id}: path '{path}' must start with '/'")]
    InvalidPath { endpoint_id: String, path: String },
}

/// One inbound HTTP endpoint.
pub struct HttpEndpoint {
    endpoint_id: String,
    handler_id: String,
    method: Method,
    path: String,
    handler: Arc<dyn HttpHandler>,
    instrumentation: Instrumentation,
    extractors: ContextExtractors,
    request_uuid_header_key: String,
    capture: bool,
}

impl std::fmt::Debug for HttpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEndpoint")
            .field("endpoint_id", &self.endpoint_id)
            .field("handler_id", &self.handler_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl HttpEndpoint {
    pub fn new(
        endpoint_id: impl Into<String>,
        handler_id: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        handler: impl HttpHandler,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            handler_id: handler_id.into(),
            method,
            path: path.into(),
            handler: Arc::new(handler),
            instrumentation: Instrumentation::from_recorder(),
            extractors: ContextExtractors::default(),
            request_uuid_header_key: String::new(),
            capture: false,
        }
    }

    pub fn with_instrumentation(mut self, instrumentation: Instrumentation) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    pub fn with_extractors(mut self, extractors: ContextExtractors) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn with_request_uuid_header_key(mut self, key: impl Into<String>) -> Self {
        self.request_uuid_header_key = key.into();
        self
    }

    /// Record every outbound call made while serving this endpoint.
    pub fn with_capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Serve one request.
    pub async fn handle(&self, params: HashMap<String, String>, request: Request) -> Response {
        let start = Instant::now();
        let (parts, body) = request.into_parts();

        let mut ctx = RequestContext::background()
            .with_scope_tags([
                (tags::ENDPOINT, self.endpoint_id.as_str()),
                (tags::HANDLER, self.handler_id.as_str()),
                (tags::ENDPOINT_METHOD, parts.method.as_str()),
                (tags::PROTOCOL, tags::PROTOCOL_HTTP),
            ])
            .with_log_fields([
                LogField::string("endpointID", self.endpoint_id.as_str()),
                LogField::string("handlerID", self.handler_id.as_str()),
                LogField::string("method", parts.method.as_str()),
                LogField::string("URL", parts.uri.to_string()),
            ]);

        let uuid = Some(self.request_uuid_header_key.as_str())
            .filter(|key| !key.is_empty())
            .and_then(|key| parts.headers.get(key))
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        ctx = ctx
            .with_request_uuid(&uuid)
            .with_log_fields([LogField::string("requestUUID", uuid)])
            .with_endpoint_request_headers(header_map_to_strings(&parts.headers));

        if let Some(span) = self.instrumentation.tracer.extract(&parts.headers) {
            ctx = ctx.with_log_fields(span.log_fields()).with_span_context(span);
        }
        if self.capture {
            ctx = ctx.with_capture();
        }
        let ctx = self.extractors.apply(&ctx);

        self.instrumentation
            .metrics
            .inc_counter(&ctx, names::ENDPOINT_REQUEST, 1);

        let req = ServerHttpRequest::new(
            ctx.clone(),
            self.instrumentation.clone(),
            parts,
            body,
            params,
        );
        let res = ServerHttpResponse::new(ctx.clone(), self.instrumentation.clone(), start);

        let res = match AssertUnwindSafe(self.handler.handle(req, res))
            .catch_unwind()
            .await
        {
            Ok(res) => res,
            Err(panic) => {
                self.instrumentation
                    .metrics
                    .inc_counter(&ctx, names::ENDPOINT_PANIC, 1);
                self.instrumentation.logger.error(
                    &ctx,
                    "Endpoint failure: endpoint panic",
                    vec![LogField::string("error", panic_message(panic.as_ref()))],
                );
                let mut res = ServerHttpResponse::new(ctx, self.instrumentation.clone(), start);
                res.send_error_string(500, PANIC_RESPONSE_MESSAGE);
                res
            }
        };
        res.flush()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Mount `endpoints` on a router with request tracing and a request timeout.
pub fn router(endpoints: Vec<HttpEndpoint>, request_timeout: Duration) -> Result<Router, RouterError> {
    let mut router = Router::new();
    for endpoint in endpoints {
        if !endpoint.path.starts_with('/') {
            return Err(RouterError::InvalidPath {
                endpoint_id: endpoint.endpoint_id.clone(),
                path: endpoint.path.clone(),
            });
        }
        let filter = MethodFilter::try_from(endpoint.method.clone()).map_err(|_| {
            RouterError::UnsupportedMethod {
                endpoint_id: endpoint.endpoint_id.clone(),
                method: endpoint.method.to_string(),
            }
        })?;

        tracing::debug!(
            endpoint_id = %endpoint.endpoint_id,
            method = %endpoint.method,
            path = %endpoint.path,
            "Mounting HTTP endpoint"
        );
        let path = endpoint.path.clone();
        let endpoint = Arc::new(endpoint);
        router = router.route(
            &path,
            on(
                filter,
                move |params: Result<RawPathParams, RawPathParamsRejection>, request: Request| {
                    let endpoint = Arc::clone(&endpoint);
                    async move {
                        let params = params
                            .map(|raw| {
                                raw.iter()
                                    .map(|(k, v)| (k.to_string(), v.to_string()))
                                    .collect()
                            })
                            .unwrap_or_default();
                        endpoint.handle(params, request).await
                    }
                },
            ),
        );
    }

    Ok(router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(request_timeout)),
    ))
}

/// Errors while starting or running [`HttpServer`].
#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Inbound HTTP server for a set of endpoints.
#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// Mount `endpoints` with the configured request timeout and bind the
    /// configured address.
    pub async fn bind(
        config: &HttpServerConfig,
        endpoints: Vec<HttpEndpoint>,
    ) -> Result<Self, HttpServerError> {
        let router = router(endpoints, config.request_timeout())?;
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|source| HttpServerError::Bind {
                address: config.bind_address.clone(),
                source,
            })?;

        tracing::info!(
            address = %config.bind_address,
            request_timeout_secs = config.request_timeout_secs,
            "HTTP server bound"
        );
        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires (or its sender is dropped), then finish
    /// in-flight requests.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), HttpServerError> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
            .map_err(HttpServerError::Serve)?;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestInstrumentation;
    use axum::body::Body;
    use axum::http::StatusCode;

    async fn echo(req: ServerHttpRequest, mut res: ServerHttpResponse) -> ServerHttpResponse {
        let id = req.param("id").unwrap_or("none").to_string();
        let uuid = req.context().request_uuid().unwrap_or_default().to_string();
        res.write_json(200, &[], &serde_json::json!({"id": id, "uuid": uuid}));
        res
    }

    fn request(uri: &str) -> Request {
        Request::builder()
            .uri(uri)
            .header("x-request-uuid", "uuid-1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn seeds_context_and_counts_request() {
        let test = TestInstrumentation::new();
        let endpoint = HttpEndpoint::new("foo", "bar", Method::GET, "/foo/{id}", echo)
            .with_instrumentation(test.instrumentation.clone())
            .with_request_uuid_header_key("x-request-uuid");

        let params = HashMap::from([("id".to_string(), "7".to_string())]);
        let response = endpoint.handle(params, request("/foo/7")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, r#"{"id":"7","uuid":"uuid-1"}"#);

        let tags = [
            ("endpoint", "foo"),
            ("handler", "bar"),
            ("endpoint_method", "GET"),
            ("protocol", "http"),
        ];
        assert_eq!(test.metrics.counter("endpoint.request", &tags), 1);
        assert_eq!(test.metrics.counter("endpoint.status", &[("status", "200")]), 1);
    }

    #[tokio::test]
    async fn generates_uuid_when_header_absent() {
        let test = TestInstrumentation::new();
        let endpoint = HttpEndpoint::new("foo", "bar", Method::GET, "/foo", echo)
            .with_instrumentation(test.instrumentation.clone())
            .with_request_uuid_header_key("x-other-uuid");
        let response = endpoint.handle(HashMap::new(), request("/foo")).await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let uuid = value["uuid"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(uuid).is_ok());
    }

    #[tokio::test]
    async fn recovers_handler_panic() {
        let test = TestInstrumentation::new();
        let endpoint = HttpEndpoint::new(
            "foo",
            "panic",
            Method::GET,
            "/panic",
            |_req: ServerHttpRequest, res: ServerHttpResponse| async move {
                if res.pending_status() == 200 {
                    panic!("handler blew up");
                }
                res
            },
        )
        .with_instrumentation(test.instrumentation.clone());

        let response = endpoint.handle(HashMap::new(), request("/panic")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            body,
            r#"{"error":"Unexpected workflow panic, recovered at endpoint."}"#
        );
        assert_eq!(test.metrics.counter("endpoint.panic", &[]), 1);
        let entry = &test.logs.entries_with_message("Endpoint failure: endpoint panic")[0];
        assert_eq!(entry.field("error").unwrap().to_string(), "handler blew up");
    }

    #[tokio::test]
    async fn bind_reports_address_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = HttpServerConfig {
            bind_address: taken.local_addr().unwrap().to_string(),
            ..Default::default()
        };
        let err = HttpServer::bind(&config, Vec::new()).await.unwrap_err();
        assert!(matches!(err, HttpServerError::Bind { .. }));
    }

    #[test]
    fn router_rejects_relative_path() {
        let endpoint = HttpEndpoint::new("foo", "bar", Method::GET, "foo", echo);
        let err = router(vec![endpoint], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RouterError::InvalidPath { .. }));
    }
}
