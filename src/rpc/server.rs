//! Inbound binary-RPC server.
//!
//! # Responsibilities
//! - Keep the `Service::method` → endpoint registry
//! - Seed the per-call context from endpoint identity, arg2 headers and
//!   transport hints, then run user extractors
//! - Run the handler on its own task, racing it against the call context
//! - Emit endpoint metrics and turn failures into error frames
//! - Accept connections and drain them on shutdown
//!
//! # Design Decisions
//! - One call per connection; a peer closing its socket cancels the call
//! - Handler errors that are `SystemError`s keep their code, anything else
//!   becomes `UnexpectedError`
//! - Unparseable or unregistered methods are logged and dropped without a
//!   response frame

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config::RpcServerConfig;
use crate::context::{ContextExtractors, LogField, RequestContext};
use crate::headers::{HeaderCarrier, RpcHeaders};
use crate::http::server::panic_message;
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics::{names, tags};
use crate::observability::Instrumentation;
use crate::rpc::codec::{CodecError, WireStruct};
use crate::rpc::errors::{ProtocolError, RegistryError, SystemError, SystemErrorCode};
use crate::rpc::frame::{transport_headers, CallRequest, CallResponse, ErrorFrame, Frame};
use crate::rpc::headers::{ensure_empty, read_headers, write_headers};

/// Time in-flight calls get to finish after shutdown before they are
/// cancelled.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Error type handlers return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler answers with.
#[derive(Debug, Clone, Default)]
pub struct RpcHandlerResponse {
    /// `false` sets the application-error flag; `body` then carries the
    /// declared error struct.
    pub success: bool,
    pub headers: RpcHeaders,
    pub body: Bytes,
}

impl RpcHandlerResponse {
    pub fn ok<T: WireStruct>(body: &T) -> Result<Self, CodecError> {
        Ok(Self {
            success: true,
            headers: RpcHeaders::new(),
            body: body.encode()?,
        })
    }

    pub fn app_error<T: WireStruct>(body: &T) -> Result<Self, CodecError> {
        Ok(Self {
            success: false,
            headers: RpcHeaders::new(),
            body: body.encode()?,
        })
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Decode a request body, rejecting trailing bytes.
///
/// Failures are `BadRequest` system errors.
pub fn decode_body<T: WireStruct>(mut body: Bytes) -> Result<T, HandlerError> {
    let value = T::decode(&mut body).map_err(|e| {
        SystemError::new(
            SystemErrorCode::BadRequest,
            format!("could not decode {}: {e}", T::type_name()),
        )
    })?;
    ensure_empty(&body, "reading request body")
        .map_err(|e| SystemError::new(SystemErrorCode::BadRequest, e.to_string()))?;
    Ok(value)
}

/// An RPC endpoint's business logic.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(
        &self,
        ctx: RequestContext,
        headers: RpcHeaders,
        body: Bytes,
    ) -> BoxFuture<'static, Result<RpcHandlerResponse, HandlerError>>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(RequestContext, RpcHeaders, Bytes) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<RpcHandlerResponse, HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        ctx: RequestContext,
        headers: RpcHeaders,
        body: Bytes,
    ) -> BoxFuture<'static, Result<RpcHandlerResponse, HandlerError>> {
        Box::pin(self(ctx, headers, body))
    }
}

/// Called after a successful handler response was turned into a frame.
pub type PostResponseCallback = Arc<dyn Fn(&RequestContext, &str, &RpcHandlerResponse) + Send + Sync>;

/// One registered RPC method.
pub struct RpcEndpoint {
    endpoint_id: String,
    handler_id: String,
    method: String,
    handler: Arc<dyn RpcHandler>,
    post_response: Option<PostResponseCallback>,
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("endpoint_id", &self.endpoint_id)
            .field("handler_id", &self.handler_id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl RpcEndpoint {
    /// `method` is the full `Service::method` name.
    pub fn new(
        endpoint_id: impl Into<String>,
        handler_id: impl Into<String>,
        method: impl Into<String>,
        handler: impl RpcHandler,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            handler_id: handler_id.into(),
            method: method.into(),
            handler: Arc::new(handler),
            post_response: None,
        }
    }

    pub fn with_post_response<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RequestContext, &str, &RpcHandlerResponse) + Send + Sync + 'static,
    {
        self.post_response = Some(Arc::new(callback));
        self
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

enum Outcome {
    Responded(RpcHandlerResponse),
    Failed(SystemError),
}

/// Method registry and per-call dispatch.
#[derive(Debug)]
pub struct RpcRouter {
    endpoints: RwLock<HashMap<String, Arc<RpcEndpoint>>>,
    instrumentation: Instrumentation,
    extractors: ContextExtractors,
    request_uuid_header_key: String,
}

impl RpcRouter {
    pub fn new(instrumentation: Instrumentation) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            instrumentation,
            extractors: ContextExtractors::new(),
            request_uuid_header_key: String::new(),
        }
    }

    pub fn with_extractors(mut self, extractors: ContextExtractors) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn with_request_uuid_header_key(mut self, key: impl Into<String>) -> Self {
        self.request_uuid_header_key = key.into();
        self
    }

    pub fn register(&self, endpoint: RpcEndpoint) -> Result<(), RegistryError> {
        if !endpoint.method.contains("::") {
            return Err(RegistryError::InvalidMethod {
                method: endpoint.method,
            });
        }
        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(&endpoint.method) {
            return Err(RegistryError::AlreadyRegistered {
                method: endpoint.method,
            });
        }
        tracing::debug!(method = %endpoint.method, endpoint_id = %endpoint.endpoint_id, "Registered RPC endpoint");
        endpoints.insert(endpoint.method.clone(), Arc::new(endpoint));
        Ok(())
    }

    /// Registered `Service::method` names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
        let mut methods: Vec<String> = endpoints.keys().cloned().collect();
        methods.sort();
        methods
    }

    fn lookup(&self, method: &str) -> Option<Arc<RpcEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Dispatch one call. `None` means the call was dropped.
    pub async fn handle(&self, call: CallRequest, parent: &RequestContext) -> Option<Frame> {
        if !call.method.contains("::") {
            tracing::warn!(method = %call.method, "Dropping RPC call with malformed method name");
            return None;
        }
        let Some(endpoint) = self.lookup(&call.method) else {
            tracing::warn!(method = %call.method, "Dropping RPC call for unregistered method");
            return None;
        };

        let start = Instant::now();
        let id = call.id;
        let ctx = parent
            .with_scope_tags([
                (tags::ENDPOINT, endpoint.endpoint_id.as_str()),
                (tags::HANDLER, endpoint.handler_id.as_str()),
                (tags::ENDPOINT_METHOD, endpoint.method.as_str()),
                (tags::PROTOCOL, tags::PROTOCOL_RPC),
            ])
            .with_log_fields([
                LogField::string("endpointID", endpoint.endpoint_id.as_str()),
                LogField::string("handlerID", endpoint.handler_id.as_str()),
                LogField::string("method", endpoint.method.as_str()),
            ]);

        let mut arg2 = call.arg2;
        let headers = match read_headers(&mut arg2)
            .and_then(|headers| ensure_empty(&arg2, "reading request headers").map(|()| headers))
        {
            Ok(headers) => headers,
            Err(err) => {
                let err = SystemError::new(SystemErrorCode::BadRequest, err.to_string());
                self.finish(&ctx, start, Err(&err));
                return Some(error_frame(id, err));
            }
        };

        let ctx = self.seed_context(ctx, &headers, &call.transport_headers, call.ttl);
        self.instrumentation
            .metrics
            .inc_counter(&ctx, names::ENDPOINT_REQUEST, 1);

        let outcome = self.run_handler(&endpoint, &ctx, headers, call.arg3).await;
        match outcome {
            Outcome::Responded(response) => {
                let arg2 = match write_headers(&response.headers) {
                    Ok(arg2) => arg2,
                    Err(err) => {
                        let err = SystemError::new(SystemErrorCode::UnexpectedError, err.to_string());
                        self.finish(&ctx, start, Err(&err));
                        return Some(error_frame(id, err));
                    }
                };
                self.finish(&ctx, start, Ok(response.success));
                let frame = Frame::CallResponse(CallResponse {
                    id,
                    application_error: !response.success,
                    arg2,
                    arg3: response.body.clone(),
                });
                if let Some(callback) = &endpoint.post_response {
                    callback(&ctx, &endpoint.method, &response);
                }
                Some(frame)
            }
            Outcome::Failed(err) => {
                self.finish(&ctx, start, Err(&err));
                Some(error_frame(id, err))
            }
        }
    }

    fn seed_context(
        &self,
        mut ctx: RequestContext,
        headers: &RpcHeaders,
        transport: &std::collections::BTreeMap<String, String>,
        ttl: Duration,
    ) -> RequestContext {
        let uuid = Some(self.request_uuid_header_key.as_str())
            .filter(|key| !key.is_empty())
            .and_then(|key| headers.get_header(key))
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        ctx = ctx
            .with_request_uuid(&uuid)
            .with_log_fields([LogField::string("requestUUID", uuid)])
            .with_endpoint_request_headers(headers.clone());

        if let Some(key) = transport.get(transport_headers::ROUTING_KEY) {
            ctx = ctx.with_routing_key(key);
        }
        if let Some(key) = transport.get(transport_headers::SHARD_KEY) {
            ctx = ctx.with_shard_key(key);
        }
        if let Some(delegate) = transport.get(transport_headers::ROUTING_DELEGATE) {
            ctx = ctx.with_routing_delegate(delegate);
        }
        if !ttl.is_zero() {
            ctx = ctx.with_timeout(ttl);
        }
        if let Some(span) = self.instrumentation.tracer.extract(headers) {
            ctx = ctx.with_log_fields(span.log_fields()).with_span_context(span);
        }
        self.extractors.apply(&ctx)
    }

    async fn run_handler(
        &self,
        endpoint: &RpcEndpoint,
        ctx: &RequestContext,
        headers: RpcHeaders,
        body: Bytes,
    ) -> Outcome {
        let mut task = tokio::spawn(endpoint.handler.handle(ctx.clone(), headers, body));
        tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(response)) => Outcome::Responded(response),
                Ok(Err(err)) => {
                    let err = match err.downcast::<SystemError>() {
                        Ok(system) => *system,
                        Err(other) => {
                            self.instrumentation.logger.warn(
                                ctx,
                                "Endpoint failure: handler returned error",
                                vec![LogField::string("error", other.to_string())],
                            );
                            SystemError::new(SystemErrorCode::UnexpectedError, "Server Error")
                        }
                    };
                    Outcome::Failed(err)
                }
                Err(join) if join.is_panic() => {
                    let panic = join.into_panic();
                    self.instrumentation
                        .metrics
                        .inc_counter(ctx, names::ENDPOINT_PANIC, 1);
                    self.instrumentation.logger.error(
                        ctx,
                        "Endpoint failure: endpoint panic",
                        vec![LogField::string("error", panic_message(panic.as_ref()))],
                    );
                    Outcome::Failed(SystemError::new(
                        SystemErrorCode::UnexpectedError,
                        "Unexpected workflow panic, recovered at endpoint.",
                    ))
                }
                Err(join) => Outcome::Failed(SystemError::new(
                    SystemErrorCode::Cancelled,
                    join.to_string(),
                )),
            },
            reason = ctx.done() => {
                task.abort();
                Outcome::Failed(SystemError::new(SystemErrorCode::Cancelled, reason.to_string()))
            }
        }
    }

    /// Latency plus exactly one outcome counter.
    fn finish(&self, ctx: &RequestContext, start: Instant, outcome: Result<bool, &SystemError>) {
        let metrics = &self.instrumentation.metrics;
        let logger = &self.instrumentation.logger;
        let elapsed = start.elapsed();
        metrics.record_timer(ctx, names::ENDPOINT_LATENCY, elapsed);
        metrics.record_histogram_duration(ctx, names::ENDPOINT_LATENCY_HIST, elapsed);

        match outcome {
            Ok(true) => {
                metrics.inc_counter(ctx, names::ENDPOINT_SUCCESS, 1);
                logger.debug(ctx, "Finished an incoming server RPC request", Vec::new());
            }
            Ok(false) => {
                metrics.inc_counter(ctx, names::ENDPOINT_APP_ERRORS, 1);
                logger.debug(ctx, "Finished an incoming server RPC request", Vec::new());
            }
            Err(err) => {
                let ctx = ctx.with_scope_tags([(tags::ERROR, err.code.metric_tag())]);
                metrics.inc_counter(&ctx, names::ENDPOINT_SYSTEM_ERRORS, 1);
                logger.warn(
                    &ctx,
                    "Failed to handle incoming server RPC request",
                    vec![
                        LogField::string("error", err.message.as_str()),
                        LogField::string("code", err.code.name()),
                    ],
                );
            }
        }
    }
}

fn error_frame(id: u32, err: SystemError) -> Frame {
    Frame::Error(ErrorFrame {
        id,
        code: err.code,
        message: err.message,
    })
}

#[derive(Debug, Error)]
enum ServeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Accepts connections and feeds their calls to an [`RpcRouter`].
#[derive(Debug)]
pub struct RpcServer {
    service_name: String,
    listener: Listener,
    router: Arc<RpcRouter>,
    tracker: ConnectionTracker,
    drain_timeout: Duration,
}

impl RpcServer {
    pub async fn bind(config: &RpcServerConfig, router: Arc<RpcRouter>) -> Result<Self, ListenerError> {
        let listener = Listener::bind(&config.bind_address, config.max_connections).await?;
        Ok(Self {
            service_name: config.service_name.clone(),
            listener,
            router,
            tracker: ConnectionTracker::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn router(&self) -> &Arc<RpcRouter> {
        &self.router
    }

    /// Serve until `shutdown` fires (or its sender is dropped), then drain.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let (root_ctx, root_token) = RequestContext::background().with_cancel();
        tracing::info!(service = %self.service_name, "RPC server started");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer, permit)) => {
                    let guard = self.tracker.track();
                    let router = Arc::clone(&self.router);
                    let ctx = root_ctx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = serve_connection(stream, &router, &ctx).await {
                            tracing::debug!(
                                connection_id = %guard.id(),
                                peer_addr = %peer,
                                error = %err,
                                "RPC connection ended with error"
                            );
                        }
                        drop(guard);
                    });
                }
                Err(ListenerError::Closed) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to accept RPC connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        tracing::info!(
            service = %self.service_name,
            active_connections = self.tracker.active_count(),
            "RPC server draining"
        );
        if tokio::time::timeout(self.drain_timeout, self.tracker.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                active_connections = self.tracker.active_count(),
                "Drain timeout elapsed, cancelling in-flight RPC calls"
            );
            root_token.cancel();
            self.tracker.wait_idle().await;
        }
        tracing::info!(service = %self.service_name, "RPC server stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    router: &RpcRouter,
    parent: &RequestContext,
) -> Result<(), ServeError> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let Some(bytes) = framed.next().await.transpose()? else {
        return Ok(());
    };
    let call = match Frame::decode(bytes.freeze())? {
        Frame::CallRequest(call) => call,
        other => return Err(ProtocolError::UnexpectedFrame { got: other.kind() }.into()),
    };

    let (ctx, token) = parent.with_cancel();
    let handled = router.handle(call, &ctx);
    tokio::pin!(handled);

    let mut peer_open = true;
    let frame = loop {
        tokio::select! {
            frame = &mut handled => break frame,
            next = framed.next(), if peer_open => match next {
                Some(Ok(_)) => tracing::warn!("Ignoring extra frame on RPC connection"),
                Some(Err(_)) | None => {
                    peer_open = false;
                    token.cancel();
                }
            },
        }
    };

    if let (Some(frame), true) = (frame, peer_open) {
        framed.send(frame.encode()?).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec::JsonStruct;
    use crate::testing::TestInstrumentation;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Echo {
        message: String,
    }

    fn call(method: &str, headers: &RpcHeaders, body: Bytes) -> CallRequest {
        CallRequest {
            id: 7,
            ttl: Duration::from_secs(1),
            service: "Backend".into(),
            method: method.into(),
            transport_headers: Default::default(),
            arg2: write_headers(headers).unwrap(),
            arg3: body,
        }
    }

    async fn echo(
        ctx: RequestContext,
        _headers: RpcHeaders,
        body: Bytes,
    ) -> Result<RpcHandlerResponse, HandlerError> {
        let req: JsonStruct<Echo> = decode_body(body)?;
        let uuid = ctx.request_uuid().unwrap_or_default().to_string();
        Ok(RpcHandlerResponse::ok(&req)?.with_header("x-uuid", uuid))
    }

    async fn timeout(
        _ctx: RequestContext,
        _headers: RpcHeaders,
        _body: Bytes,
    ) -> Result<RpcHandlerResponse, HandlerError> {
        Err(SystemError::new(SystemErrorCode::Timeout, "too slow").into())
    }

    async fn boom(
        _ctx: RequestContext,
        _headers: RpcHeaders,
        _body: Bytes,
    ) -> Result<RpcHandlerResponse, HandlerError> {
        Err("boom".into())
    }

    async fn explode(
        _ctx: RequestContext,
        headers: RpcHeaders,
        _body: Bytes,
    ) -> Result<RpcHandlerResponse, HandlerError> {
        if headers.is_empty() {
            panic!("handler exploded");
        }
        Ok(RpcHandlerResponse::default())
    }

    async fn hang(
        _ctx: RequestContext,
        _headers: RpcHeaders,
        _body: Bytes,
    ) -> Result<RpcHandlerResponse, HandlerError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(RpcHandlerResponse::default())
    }

    fn echo_endpoint() -> RpcEndpoint {
        RpcEndpoint::new("backend", "echo", "Backend::echo", echo)
    }

    fn router(test: &TestInstrumentation) -> RpcRouter {
        RpcRouter::new(test.instrumentation.clone()).with_request_uuid_header_key("x-uuid")
    }

    #[test]
    fn duplicate_registration_fails() {
        let test = TestInstrumentation::new();
        let router = router(&test);
        router.register(echo_endpoint()).unwrap();
        let err = router.register(echo_endpoint()).unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyRegistered {
                method: "Backend::echo".into()
            }
        );
    }

    #[test]
    fn method_without_separator_is_rejected() {
        let test = TestInstrumentation::new();
        let endpoint = RpcEndpoint::new("e", "h", "echo", echo);
        assert!(matches!(
            router(&test).register(endpoint),
            Err(RegistryError::InvalidMethod { .. })
        ));
    }

    #[tokio::test]
    async fn echo_round_trip_counts_success() {
        let test = TestInstrumentation::new();
        let router = router(&test);
        router.register(echo_endpoint()).unwrap();

        let mut headers = RpcHeaders::new();
        headers.insert("x-uuid".into(), "abc-123".into());
        let body = JsonStruct(Echo {
            message: "hi".into(),
        })
        .encode()
        .unwrap();

        let frame = router
            .handle(call("Backend::echo", &headers, body.clone()), &RequestContext::background())
            .await
            .unwrap();
        let Frame::CallResponse(response) = frame else {
            panic!("expected call response, got {frame:?}");
        };
        assert!(!response.application_error);
        assert_eq!(response.arg3, body);
        let mut arg2 = response.arg2;
        assert_eq!(read_headers(&mut arg2).unwrap()["x-uuid"], "abc-123");

        let tags = [("endpoint", "backend"), ("protocol", "rpc")];
        assert_eq!(test.metrics.counter("endpoint.request", &tags), 1);
        assert_eq!(test.metrics.counter("endpoint.success", &tags), 1);
        assert_eq!(test.metrics.timer_samples("endpoint.latency", &tags).len(), 1);
    }

    #[tokio::test]
    async fn unknown_method_is_dropped() {
        let test = TestInstrumentation::new();
        let frame = router(&test)
            .handle(
                call("Backend::missing", &RpcHeaders::new(), Bytes::new()),
                &RequestContext::background(),
            )
            .await;
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn system_error_keeps_its_code() {
        let test = TestInstrumentation::new();
        let router = router(&test);
        router
            .register(RpcEndpoint::new("backend", "slow", "Backend::slow", timeout))
            .unwrap();

        let frame = router
            .handle(
                call("Backend::slow", &RpcHeaders::new(), Bytes::new()),
                &RequestContext::background(),
            )
            .await
            .unwrap();
        let Frame::Error(err) = frame else {
            panic!("expected error frame");
        };
        assert_eq!(err.code, SystemErrorCode::Timeout);
        assert_eq!(
            test.metrics
                .counter("endpoint.system-errors", &[("error", "timeout")]),
            1
        );
    }

    #[tokio::test]
    async fn other_errors_become_unexpected() {
        let test = TestInstrumentation::new();
        let router = router(&test);
        router
            .register(RpcEndpoint::new("backend", "bad", "Backend::bad", boom))
            .unwrap();

        let frame = router
            .handle(
                call("Backend::bad", &RpcHeaders::new(), Bytes::new()),
                &RequestContext::background(),
            )
            .await
            .unwrap();
        let Frame::Error(err) = frame else {
            panic!("expected error frame");
        };
        assert_eq!(err.code, SystemErrorCode::UnexpectedError);
        assert_eq!(err.message, "Server Error");
    }

    #[tokio::test]
    async fn handler_panic_is_recovered() {
        let test = TestInstrumentation::new();
        let router = router(&test);
        router
            .register(RpcEndpoint::new("backend", "panics", "Backend::panics", explode))
            .unwrap();

        let frame = router
            .handle(
                call("Backend::panics", &RpcHeaders::new(), Bytes::new()),
                &RequestContext::background(),
            )
            .await
            .unwrap();
        assert!(matches!(
            frame,
            Frame::Error(ErrorFrame {
                code: SystemErrorCode::UnexpectedError,
                ..
            })
        ));
        assert_eq!(test.metrics.counter("endpoint.panic", &[]), 1);
        assert_eq!(
            test.logs
                .entries_with_message("Endpoint failure: endpoint panic")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn cancelled_context_abandons_handler() {
        let test = TestInstrumentation::new();
        let router = router(&test);
        router
            .register(RpcEndpoint::new("backend", "hang", "Backend::hang", hang))
            .unwrap();

        let (ctx, token) = RequestContext::background().with_cancel();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let frame = router
            .handle(call("Backend::hang", &RpcHeaders::new(), Bytes::new()), &ctx)
            .await
            .unwrap();
        canceller.await.unwrap();
        assert!(matches!(
            frame,
            Frame::Error(ErrorFrame {
                code: SystemErrorCode::Cancelled,
                ..
            })
        ));
        assert_eq!(
            test.metrics
                .counter("endpoint.system-errors", &[("error", "cancelled")]),
            1
        );
    }

    #[tokio::test]
    async fn trailing_header_bytes_are_a_bad_request() {
        let test = TestInstrumentation::new();
        let router = router(&test);
        router.register(echo_endpoint()).unwrap();

        let mut request = call("Backend::echo", &RpcHeaders::new(), Bytes::new());
        let mut arg2 = request.arg2.to_vec();
        arg2.push(0xab);
        request.arg2 = Bytes::from(arg2);

        let frame = router.handle(request, &RequestContext::background()).await.unwrap();
        let Frame::Error(err) = frame else {
            panic!("expected error frame");
        };
        assert_eq!(err.code, SystemErrorCode::BadRequest);
        assert!(err.message.contains("found unexpected bytes after reading request headers"));
    }

    #[tokio::test]
    async fn post_response_callback_sees_response() {
        let test = TestInstrumentation::new();
        let router = router(&test);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        router
            .register(echo_endpoint().with_post_response(move |_ctx, method, response| {
                sink.lock().unwrap().push((method.to_string(), response.success));
            }))
            .unwrap();

        let body = JsonStruct(Echo {
            message: "hi".into(),
        })
        .encode()
        .unwrap();
        router
            .handle(call("Backend::echo", &RpcHeaders::new(), body), &RequestContext::background())
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![("Backend::echo".to_string(), true)]);
    }
}
