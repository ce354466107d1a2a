//! Per-call context carriers.
//!
//! # Data Flow
//! ```text
//! Inbound boundary (HTTP endpoint / RPC router)
//!     → RequestContext::background()
//!     → with_scope_tags / with_log_fields / with_request_uuid (endpoint seed)
//!     → extractors.rs (user-derived tags and fields)
//!     → handler
//!         → outbound client derives its own sub-context
//!             → with_timeout (per attempt)
//!             → metrics / logs / capture events read from the context
//! ```
//!
//! # Design Decisions
//! - A typed record instead of a dynamic key/value bag
//! - Every setter returns a derived context; the receiver never changes
//! - Shared parts sit behind `Arc`, so deriving is a handful of refcount bumps
//! - Cancellation uses a `CancellationToken` tree plus an optional deadline;
//!   a derived context is cancelled whenever its parent is

pub mod extractors;
pub mod fields;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capture::EventContainer;
use crate::observability::tracing::SpanContext;

pub use crate::resilience::timeouts::TimeoutAndRetryOptions;
pub use extractors::ContextExtractors;
pub use fields::{FieldValue, LogField};

/// Why a context stopped being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("context canceled")]
    Cancelled,
}

/// The per-call key/value carrier.
///
/// Cloning is cheap and yields a context that shares the cancellation scope
/// of the original.
#[derive(Debug, Clone)]
pub struct RequestContext {
    scope_tags: Arc<BTreeMap<String, String>>,
    log_fields: Arc<Vec<LogField>>,
    request_uuid: Option<Arc<str>>,
    routing_key: Option<Arc<str>>,
    shard_key: Option<Arc<str>>,
    routing_delegate: Option<Arc<str>>,
    timeout_retry: Option<TimeoutAndRetryOptions>,
    to_capture: bool,
    events: Option<EventContainer>,
    endpoint_request_headers: Arc<BTreeMap<String, String>>,
    span: Option<SpanContext>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}

impl RequestContext {
    /// An empty, never-expiring root context.
    pub fn background() -> Self {
        Self {
            scope_tags: Arc::new(BTreeMap::new()),
            log_fields: Arc::new(Vec::new()),
            request_uuid: None,
            routing_key: None,
            shard_key: None,
            routing_delegate: None,
            timeout_retry: None,
            to_capture: false,
            events: None,
            endpoint_request_headers: Arc::new(BTreeMap::new()),
            span: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    // ---- scope tags -------------------------------------------------------

    pub fn scope_tags(&self) -> &BTreeMap<String, String> {
        &self.scope_tags
    }

    /// Derive a context whose tag set is this one's merged with `tags`.
    /// Later writes replace earlier values for the same key.
    pub fn with_scope_tags<K, V>(&self, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = (*self.scope_tags).clone();
        for (k, v) in tags {
            merged.insert(k.into(), v.into());
        }
        Self {
            scope_tags: Arc::new(merged),
            ..self.clone()
        }
    }

    // ---- log fields -------------------------------------------------------

    pub fn log_fields(&self) -> &[LogField] {
        &self.log_fields
    }

    /// Derive a context with `fields` appended to the carried log fields.
    pub fn with_log_fields(&self, fields: impl IntoIterator<Item = LogField>) -> Self {
        let mut appended = (*self.log_fields).clone();
        appended.extend(fields);
        Self {
            log_fields: Arc::new(appended),
            ..self.clone()
        }
    }

    // ---- identifiers and routing hints -----------------------------------

    pub fn request_uuid(&self) -> Option<&str> {
        self.request_uuid.as_deref()
    }

    pub fn with_request_uuid(&self, uuid: impl AsRef<str>) -> Self {
        Self {
            request_uuid: Some(Arc::from(uuid.as_ref())),
            ..self.clone()
        }
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub fn with_routing_key(&self, key: impl AsRef<str>) -> Self {
        Self {
            routing_key: Some(Arc::from(key.as_ref())),
            ..self.clone()
        }
    }

    pub fn shard_key(&self) -> Option<&str> {
        self.shard_key.as_deref()
    }

    pub fn with_shard_key(&self, key: impl AsRef<str>) -> Self {
        Self {
            shard_key: Some(Arc::from(key.as_ref())),
            ..self.clone()
        }
    }

    pub fn routing_delegate(&self) -> Option<&str> {
        self.routing_delegate.as_deref()
    }

    pub fn with_routing_delegate(&self, delegate: impl AsRef<str>) -> Self {
        Self {
            routing_delegate: Some(Arc::from(delegate.as_ref())),
            ..self.clone()
        }
    }

    pub fn timeout_retry(&self) -> Option<&TimeoutAndRetryOptions> {
        self.timeout_retry.as_ref()
    }

    pub fn with_timeout_retry(&self, options: TimeoutAndRetryOptions) -> Self {
        Self {
            timeout_retry: Some(options),
            ..self.clone()
        }
    }

    // ---- capture ----------------------------------------------------------

    pub fn to_capture(&self) -> bool {
        self.to_capture
    }

    /// Derive a context that records outbound capture events.
    ///
    /// Reuses the existing event container if one is already attached.
    pub fn with_capture(&self) -> Self {
        Self {
            to_capture: true,
            events: Some(self.events.clone().unwrap_or_default()),
            ..self.clone()
        }
    }

    pub fn event_container(&self) -> Option<&EventContainer> {
        self.events.as_ref()
    }

    // ---- inbound headers and tracing --------------------------------------

    pub fn endpoint_request_headers(&self) -> &BTreeMap<String, String> {
        &self.endpoint_request_headers
    }

    pub fn with_endpoint_request_headers(&self, headers: BTreeMap<String, String>) -> Self {
        Self {
            endpoint_request_headers: Arc::new(headers),
            ..self.clone()
        }
    }

    pub fn span_context(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }

    pub fn with_span_context(&self, span: SpanContext) -> Self {
        Self {
            span: Some(span),
            ..self.clone()
        }
    }

    // ---- cancellation -----------------------------------------------------

    /// Derive a cancellable context and hand back its token.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = self.cancel.child_token();
        let ctx = Self {
            cancel: token.clone(),
            ..self.clone()
        };
        (ctx, token)
    }

    /// Derive a context that expires after `timeout`.
    ///
    /// The effective deadline never extends past the parent's.
    /// A timeout too large to represent keeps the parent's deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(at) => self.with_deadline(at),
            None => Self {
                cancel: self.cancel.child_token(),
                ..self.clone()
            },
        }
    }

    pub fn with_deadline(&self, at: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < at => parent,
            _ => at,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `None` while live; the reason once expired or cancelled.
    /// An expired deadline wins over cancellation.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(ContextError::DeadlineExceeded);
            }
        }
        if self.cancel.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        None
    }

    /// Resolves once the context expires or is cancelled.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                _ = self.cancel.cancelled() => ContextError::Cancelled,
            },
            None => {
                self.cancel.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }
}
