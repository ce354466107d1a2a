//! Outbound HTTP client.
//!
//! # Responsibilities
//! - Own the pooled hyper transport shared by every call to one backend
//! - Hold per-client defaults: base URL, default headers, method map,
//!   timeout, retry policy
//! - Send one materialized request, following redirects when enabled
//!
//! # Design Decisions
//! - Immutable after construction; shared as `Arc<HttpClient>`
//! - Bodies are fully buffered so any attempt or redirect can be replayed
//! - Redirects are followed by hand so the toggle stays per client
//! - Credential headers are dropped when a redirect leaves the origin

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri};
use bytes::Bytes;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::config::HttpClientConfig;
use crate::context::RequestContext;
use crate::errors::ClientError;
use crate::http::client_request::ClientHttpRequest;
use crate::observability::Instrumentation;
use crate::resilience::{DefaultRetryPolicy, RetryPolicy, TimeoutAndRetryOptions};

/// Upper bound on redirects followed for one attempt.
pub const MAX_REDIRECTS: usize = 10;

/// Idle pooled connections kept per host unless configured otherwise.
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 500;

const KEEPALIVE: Duration = Duration::from_secs(90);

/// A response as read off the wire: head plus fully buffered body.
pub(crate) type RawResponse = (axum::http::response::Parts, Bytes);

/// Shared outbound HTTP client for one downstream service.
pub struct HttpClient {
    client_id: String,
    base_url: String,
    default_headers: HeaderMap,
    methods: HashMap<String, String>,
    follow_redirect: bool,
    timeout: Duration,
    default_timeout_retry: Option<TimeoutAndRetryOptions>,
    retry_policy: Arc<dyn RetryPolicy>,
    request_uuid_header_key: String,
    transport: Client<HttpConnector, Body>,
    instrumentation: Instrumentation,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("client_id", &self.client_id)
            .field("base_url", &self.base_url)
            .field("follow_redirect", &self.follow_redirect)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn builder(client_id: impl Into<String>, base_url: impl Into<String>) -> HttpClientBuilder {
        HttpClientBuilder::new(client_id.into(), base_url.into())
    }

    /// Build a client from its configuration block.
    pub fn from_config(
        config: &HttpClientConfig,
        request_uuid_header_key: &str,
        instrumentation: Instrumentation,
    ) -> Result<Self, ClientError> {
        let mut builder = Self::builder(&config.client_id, &config.base_url)
            .timeout(config.timeout())
            .follow_redirect(config.follow_redirect)
            .max_idle_per_host(config.max_idle_per_host)
            .request_uuid_header_key(request_uuid_header_key)
            .instrumentation(instrumentation);
        for (name, value) in &config.default_headers {
            builder = builder.default_header(name, value);
        }
        for (method, target) in &config.methods {
            builder = builder.method(method, target);
        }
        if let Some(retry) = &config.retry {
            builder = builder.default_timeout_retry(retry.options());
        }
        builder.build()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    /// Downstream endpoint for a client method, if mapped.
    pub fn target_endpoint(&self, method_name: &str) -> Option<&str> {
        self.methods.get(method_name).map(String::as_str)
    }

    pub fn follow_redirect(&self) -> bool {
        self.follow_redirect
    }

    /// Per-attempt timeout used when the context carries no retry options.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn default_timeout_retry(&self) -> Option<&TimeoutAndRetryOptions> {
        self.default_timeout_retry.as_ref()
    }

    pub fn retry_policy(&self) -> &dyn RetryPolicy {
        self.retry_policy.as_ref()
    }

    pub fn request_uuid_header_key(&self) -> &str {
        &self.request_uuid_header_key
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    /// Start a new call for `method_name`.
    pub fn new_request(self: &Arc<Self>, ctx: &RequestContext, method_name: &str) -> ClientHttpRequest {
        ClientHttpRequest::new(Arc::clone(self), ctx, method_name)
    }

    /// Resolve a path against the base URL; absolute URLs pass through.
    pub(crate) fn resolve_url(&self, url: &str) -> Result<Uri, String> {
        let full = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{}", self.base_url, url)
        };
        full.parse::<Uri>()
            .map_err(|e| format!("invalid URL {full:?}: {e}"))
    }

    /// Issue one attempt and buffer the whole response body.
    pub(crate) async fn execute(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<RawResponse, ClientError> {
        let mut method = method.clone();
        let mut uri = uri.clone();
        let mut body = body.clone();
        let mut headers = headers.clone();
        let mut redirects = 0;

        loop {
            let mut request = Request::builder()
                .method(method.clone())
                .uri(uri.clone())
                .body(Body::from(body.clone()))
                .map_err(|e| ClientError::Transport { reason: e.to_string() })?;
            *request.headers_mut() = headers.clone();

            let response = self
                .transport
                .request(request)
                .await
                .map_err(|e| ClientError::Transport { reason: e.to_string() })?;

            if self.follow_redirect && response.status().is_redirection() && redirects < MAX_REDIRECTS {
                if let Some(next) = redirect_target(&uri, response.headers()) {
                    redirects += 1;
                    let status = response.status();
                    if status == StatusCode::SEE_OTHER
                        || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                            && method == Method::POST)
                    {
                        method = Method::GET;
                        body = Bytes::new();
                    }
                    if !same_origin(&uri, &next) {
                        strip_credentials(&mut headers);
                    }
                    tracing::debug!(
                        client_id = %self.client_id,
                        status = status.as_u16(),
                        location = %next,
                        "Following redirect"
                    );
                    uri = next;
                    continue;
                }
            }

            let (parts, incoming): (_, hyper::body::Incoming) = response.into_parts();
            let bytes = axum::body::to_bytes(Body::new(incoming), usize::MAX)
                .await
                .map_err(|e| ClientError::Read { reason: e.to_string() })?;
            return Ok((parts, bytes));
        }
    }
}

fn same_origin(a: &Uri, b: &Uri) -> bool {
    a.scheme() == b.scheme() && a.host() == b.host() && a.port_u16() == b.port_u16()
}

/// Credentials never follow a redirect to another origin.
fn strip_credentials(headers: &mut HeaderMap) {
    for name in [
        header::AUTHORIZATION,
        header::COOKIE,
        header::PROXY_AUTHORIZATION,
        header::WWW_AUTHENTICATE,
    ] {
        headers.remove(name);
    }
}

fn redirect_target(current: &Uri, headers: &HeaderMap) -> Option<Uri> {
    let location = headers.get(header::LOCATION)?.to_str().ok()?;
    let base = url::Url::parse(&current.to_string()).ok()?;
    let next = base.join(location).ok()?;
    next.as_str().parse::<Uri>().ok()
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
    client_id: String,
    base_url: String,
    default_headers: Vec<(String, String)>,
    methods: HashMap<String, String>,
    follow_redirect: bool,
    timeout: Duration,
    default_timeout_retry: Option<TimeoutAndRetryOptions>,
    retry_policy: Arc<dyn RetryPolicy>,
    request_uuid_header_key: String,
    max_idle_per_host: usize,
    instrumentation: Option<Instrumentation>,
}

impl HttpClientBuilder {
    fn new(client_id: String, base_url: String) -> Self {
        Self {
            client_id,
            base_url,
            default_headers: Vec::new(),
            methods: HashMap::new(),
            follow_redirect: true,
            timeout: Duration::from_secs(10),
            default_timeout_retry: None,
            retry_policy: Arc::new(DefaultRetryPolicy),
            request_uuid_header_key: String::new(),
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            instrumentation: None,
        }
    }

    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Map a client method to its downstream endpoint name.
    pub fn method(mut self, method_name: impl Into<String>, target: impl Into<String>) -> Self {
        self.methods.insert(method_name.into(), target.into());
        self
    }

    pub fn follow_redirect(mut self, follow: bool) -> Self {
        self.follow_redirect = follow;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn default_timeout_retry(mut self, options: TimeoutAndRetryOptions) -> Self {
        self.default_timeout_retry = Some(options);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn request_uuid_header_key(mut self, key: impl Into<String>) -> Self {
        self.request_uuid_header_key = key.into();
        self
    }

    pub fn max_idle_per_host(mut self, max: usize) -> Self {
        self.max_idle_per_host = max;
        self
    }

    pub fn instrumentation(mut self, instrumentation: Instrumentation) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    pub fn build(self) -> Result<HttpClient, ClientError> {
        let build_error = |reason: String| ClientError::RequestBuild {
            client_id: self.client_id.clone(),
            method: "default_headers".to_string(),
            reason,
        };

        let mut default_headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| build_error(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| build_error(format!("invalid header value {value:?}: {e}")))?;
            default_headers.insert(name, value);
        }

        let mut connector = HttpConnector::new();
        connector.set_keepalive(Some(KEEPALIVE));
        connector.set_nodelay(true);
        let transport = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(KEEPALIVE)
            .build(connector);

        Ok(HttpClient {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            client_id: self.client_id,
            default_headers,
            methods: self.methods,
            follow_redirect: self.follow_redirect,
            timeout: self.timeout,
            default_timeout_retry: self.default_timeout_retry,
            retry_policy: self.retry_policy,
            request_uuid_header_key: self.request_uuid_header_key,
            transport,
            instrumentation: self
                .instrumentation
                .unwrap_or_else(Instrumentation::from_recorder),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpClient {
        HttpClient::builder("bar", "http://127.0.0.1:9000/")
            .method("DoStuff", "/bar-path")
            .default_header("x-client", "gateway")
            .build()
            .unwrap()
    }

    #[test]
    fn resolves_relative_and_absolute_urls() {
        let client = client();
        assert_eq!(
            client.resolve_url("/bar-path").unwrap().to_string(),
            "http://127.0.0.1:9000/bar-path"
        );
        assert_eq!(
            client.resolve_url("http://other:1/x").unwrap().to_string(),
            "http://other:1/x"
        );
        assert!(client.resolve_url(" bad url").is_err());
    }

    #[test]
    fn rejects_invalid_default_header() {
        let err = HttpClient::builder("bar", "http://127.0.0.1:9000")
            .default_header("bad header", "x")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Could not create outbound bar.default_headers request"));
    }

    #[test]
    fn exposes_method_map_and_defaults() {
        let client = client();
        assert_eq!(client.target_endpoint("DoStuff"), Some("/bar-path"));
        assert_eq!(client.target_endpoint("Other"), None);
        assert_eq!(client.default_headers()["x-client"], "gateway");
        assert!(client.follow_redirect());
    }

    #[test]
    fn redirect_location_resolves_relative_paths() {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/next?x=1"));
        let current: Uri = "http://127.0.0.1:9000/start".parse().unwrap();
        let next = redirect_target(&current, &headers).unwrap();
        assert_eq!(next.to_string(), "http://127.0.0.1:9000/next?x=1");
    }

    #[test]
    fn credentials_stay_within_the_origin() {
        let start: Uri = "http://127.0.0.1:9000/start".parse().unwrap();
        assert!(same_origin(&start, &"http://127.0.0.1:9000/next".parse().unwrap()));
        assert!(!same_origin(&start, &"http://127.0.0.1:9001/next".parse().unwrap()));
        assert!(!same_origin(&start, &"http://localhost:9000/next".parse().unwrap()));
        assert!(!same_origin(&start, &"https://127.0.0.1:9000/next".parse().unwrap()));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(header::COOKIE, HeaderValue::from_static("a=b"));
        headers.insert("x-client", HeaderValue::from_static("gateway"));
        strip_credentials(&mut headers);
        assert!(headers.get(header::AUTHORIZATION).is_none());
        assert!(headers.get(header::COOKIE).is_none());
        assert_eq!(headers["x-client"], "gateway");
    }
}
