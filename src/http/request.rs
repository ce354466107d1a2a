//! Inbound HTTP request wrapper.
//!
//! # Responsibilities
//! - Expose method, URL, path params, query values and headers
//! - Validate mandatory headers, staging a 400 on the response when missing
//! - Read the body once and decode JSON from the memoized bytes
//!
//! # Design Decisions
//! - One wrapper for every endpoint; handlers receive it by value
//! - Header reads are case-insensitive through `HeaderMap`
//! - Query pairs are decoded eagerly; they are small and read repeatedly

use std::collections::HashMap;

use axum::body::Body;
use axum::http::{request::Parts, HeaderMap, Method, Uri};
use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::context::{LogField, RequestContext};
use crate::errors::InboundError;
use crate::headers::missing_headers;
use crate::http::response::ServerHttpResponse;
use crate::observability::Instrumentation;

/// Request handed to an [`HttpHandler`](crate::http::HttpHandler).
pub struct ServerHttpRequest {
    ctx: RequestContext,
    instrumentation: Instrumentation,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    params: HashMap<String, String>,
    query: Vec<(String, String)>,
    body: Option<Body>,
    raw_body: Option<Bytes>,
}

impl std::fmt::Debug for ServerHttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHttpRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl ServerHttpRequest {
    pub fn new(
        ctx: RequestContext,
        instrumentation: Instrumentation,
        parts: Parts,
        body: Body,
        params: HashMap<String, String>,
    ) -> Self {
        let query = parts
            .uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Self {
            ctx,
            instrumentation,
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            params,
            query,
            body: Some(body),
            raw_body: None,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// A named path parameter from the matched route.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// First query value under `key`.
    pub fn get_query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every query value under `key`, in URL order.
    pub fn get_query_values(&self, key: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn has_query_value(&self, key: &str) -> bool {
        self.query.iter().any(|(k, _)| k == key)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns `false` and stages a 400 on `res` when any of `expected` is
    /// absent or empty.
    pub fn check_headers(&self, expected: &[&str], res: &mut ServerHttpResponse) -> bool {
        let missing = missing_headers(&self.headers, expected);
        if missing.is_empty() {
            return true;
        }
        self.instrumentation.logger.warn(
            &self.ctx,
            "Got request without mandatory header",
            vec![LogField::string("headers", missing.join(","))],
        );
        res.send_error_string(400, &format!("missing mandatory headers: {}", missing.join(", ")));
        false
    }

    /// The whole request body. The first call drains the stream; later calls
    /// return the same bytes.
    pub async fn read_all(&mut self) -> Result<Bytes, InboundError> {
        if let Some(bytes) = &self.raw_body {
            return Ok(bytes.clone());
        }
        let body = self.body.take().unwrap_or_else(Body::empty);
        let bytes = axum::body::to_bytes(body, usize::MAX).await.map_err(|e| {
            self.instrumentation.logger.error(
                &self.ctx,
                "Could not read request body",
                vec![LogField::string("error", e.to_string())],
            );
            InboundError::ReadBody {
                reason: e.to_string(),
            }
        })?;
        self.raw_body = Some(bytes.clone());
        Ok(bytes)
    }

    /// Read and decode the JSON body. A decode failure stages a 400 on `res`.
    pub async fn read_and_unmarshal_body<T: DeserializeOwned>(
        &mut self,
        res: &mut ServerHttpResponse,
    ) -> Result<T, InboundError> {
        let bytes = match self.read_all().await {
            Ok(bytes) => bytes,
            Err(err) => {
                res.send_error_string(500, "Could not read request body");
                return Err(err);
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| {
            self.instrumentation.logger.warn(
                &self.ctx,
                "Could not parse json",
                vec![LogField::error(&source)],
            );
            res.send_error_string(400, "Could not parse json");
            InboundError::Unmarshal { source }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestInstrumentation;
    use axum::http::Request;
    use serde::Deserialize;
    use tokio::time::Instant;

    fn request(test: &TestInstrumentation, uri: &str, body: &'static str) -> ServerHttpRequest {
        let (parts, ()) = Request::builder()
            .method("POST")
            .uri(uri)
            .header("X-Token", "abc")
            .body(())
            .unwrap()
            .into_parts();
        let params = HashMap::from([("id".to_string(), "42".to_string())]);
        ServerHttpRequest::new(
            RequestContext::background(),
            test.instrumentation.clone(),
            parts,
            Body::from(body),
            params,
        )
    }

    fn response(test: &TestInstrumentation) -> ServerHttpResponse {
        ServerHttpResponse::new(
            RequestContext::background(),
            test.instrumentation.clone(),
            Instant::now(),
        )
    }

    #[test]
    fn query_and_params() {
        let test = TestInstrumentation::new();
        let req = request(&test, "/foo/42?a=1&b=x%20y&a=2", "");
        assert_eq!(req.param("id"), Some("42"));
        assert_eq!(req.get_query_value("a"), Some("1"));
        assert_eq!(req.get_query_values("a"), vec!["1", "2"]);
        assert_eq!(req.get_query_value("b"), Some("x y"));
        assert!(req.has_query_value("b"));
        assert!(!req.has_query_value("c"));
        assert_eq!(req.header("x-token"), Some("abc"));
    }

    #[test]
    fn missing_headers_stage_bad_request() {
        let test = TestInstrumentation::new();
        let req = request(&test, "/foo", "");
        let mut res = response(&test);
        assert!(req.check_headers(&["x-token"], &mut res));
        assert!(!req.check_headers(&["x-token", "x-uuid"], &mut res));
        assert_eq!(res.pending_status(), 400);
        assert_eq!(
            res.pending_body().as_ref(),
            br#"{"error":"missing mandatory headers: x-uuid"}"#
        );
    }

    #[tokio::test]
    async fn read_all_is_memoized() {
        let test = TestInstrumentation::new();
        let mut req = request(&test, "/foo", r#"{"name":"a"}"#);
        assert_eq!(req.read_all().await.unwrap(), r#"{"name":"a"}"#);
        assert_eq!(req.read_all().await.unwrap(), r#"{"name":"a"}"#);

        #[derive(Deserialize)]
        struct Payload {
            name: String,
        }
        let mut res = response(&test);
        let body: Payload = req.read_and_unmarshal_body(&mut res).await.unwrap();
        assert_eq!(body.name, "a");
        assert!(!res.pending());
    }

    #[tokio::test]
    async fn bad_json_stages_bad_request() {
        let test = TestInstrumentation::new();
        let mut req = request(&test, "/foo", "nope");
        let mut res = response(&test);
        let err = req
            .read_and_unmarshal_body::<serde_json::Value>(&mut res)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Could not parse json"));
        assert_eq!(res.pending_status(), 400);
    }
}
