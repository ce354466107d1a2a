//! Retry logic.
//!
//! # Responsibilities
//! - Decide whether an outbound HTTP attempt may be followed by another
//! - Run the RPC transport retry harness with per-attempt deadlines
//!
//! # Design Decisions
//! - The default HTTP policy retries on any error, POST timeouts included;
//!   callers that need idempotency-aware retries supply their own policy
//! - Backoff is a fixed sleep that aborts as soon as the context finishes
//! - The RPC harness only retries transient system errors

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::context::{ContextError, RequestContext};
use crate::errors::{ClientError, SystemError, SystemErrorCode};
use crate::resilience::backoff::{sleep_unless_done, DEFAULT_BACKOFF_BETWEEN_ATTEMPTS};
use crate::resilience::timeouts::TimeoutAndRetryOptions;

/// Decides whether a failed HTTP attempt is followed by another one.
pub trait RetryPolicy: Send + Sync {
    /// Called after attempt number `attempt` (1-based) failed and more
    /// attempts remain. Returning `true` starts the next attempt.
    fn should_retry<'a>(
        &'a self,
        ctx: &'a RequestContext,
        attempt: u32,
        options: &'a TimeoutAndRetryOptions,
    ) -> BoxFuture<'a, bool>;
}

/// Sleep `backoff_between_attempts`, then retry, unless the parent context
/// has already finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry<'a>(
        &'a self,
        ctx: &'a RequestContext,
        _attempt: u32,
        options: &'a TimeoutAndRetryOptions,
    ) -> BoxFuture<'a, bool> {
        Box::pin(sleep_unless_done(ctx, options.backoff_between_attempts))
    }
}

/// Attempt budget for the RPC transport harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub timeout_per_attempt: Duration,
    pub backoff: Duration,
}

impl RetryOptions {
    pub fn new(max_attempts: u32, timeout_per_attempt: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            timeout_per_attempt,
            backoff: DEFAULT_BACKOFF_BETWEEN_ATTEMPTS,
        }
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, the
/// attempt budget is spent, or `ctx` finishes.
///
/// Each attempt gets a child context bounded by `timeout_per_attempt`. An
/// attempt that hits its own deadline while `ctx` is still live fails with a
/// `Timeout` system error; once `ctx` itself has finished the context error
/// is returned instead.
pub async fn run_with_retry<T, F, Fut>(
    ctx: &RequestContext,
    options: RetryOptions,
    mut attempt: F,
) -> Result<T, ClientError>
where
    F: FnMut(RequestContext, u32) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut number = 0;
    loop {
        number += 1;
        let attempt_ctx = ctx.with_timeout(options.timeout_per_attempt);

        let err = match attempt_ctx.run(attempt(attempt_ctx.clone(), number)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(err) => ClientError::Context(err),
        };

        if let Some(parent) = ctx.err() {
            return Err(ClientError::Context(parent));
        }
        // The parent is live, so a context error here came from the attempt deadline.
        let err = match err.context_error() {
            Some(ContextError::DeadlineExceeded) => ClientError::System(SystemError::new(
                SystemErrorCode::Timeout,
                "timeout per attempt exceeded",
            )),
            _ => err,
        };
        if number >= options.max_attempts || !err.is_retryable() {
            return Err(err);
        }
        tracing::debug!(attempt = number, error = %err, "Retrying rpc call");
        if !sleep_unless_done(ctx, options.backoff).await {
            return Err(ctx.err().map(ClientError::Context).unwrap_or(err));
        }
    }
}
