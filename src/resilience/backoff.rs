//! Backoff between retry attempts.

use std::time::Duration;

/// Time to wait before starting a new attempt.
pub const DEFAULT_BACKOFF_BETWEEN_ATTEMPTS: Duration = Duration::from_millis(10);

/// Multiplier applied to per-attempt budgets when deriving an overall timeout.
pub const DEFAULT_SCALE_FACTOR: f64 = 1.1;

/// Sleep for `backoff`, waking early if `ctx` finishes first.
///
/// Returns `false` when the context was cancelled or expired before the
/// sleep completed.
pub async fn sleep_unless_done(ctx: &crate::context::RequestContext, backoff: Duration) -> bool {
    if ctx.err().is_some() {
        return false;
    }
    if backoff.is_zero() {
        return true;
    }
    tokio::select! {
        biased;
        _ = ctx.done() => false,
        _ = tokio::time::sleep(backoff) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use std::time::Instant;

    #[tokio::test]
    async fn sleeps_full_backoff_on_live_context() {
        let ctx = RequestContext::background();
        let start = Instant::now();
        assert!(sleep_unless_done(&ctx, Duration::from_millis(20)).await);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn stops_early_when_cancelled() {
        let (ctx, token) = RequestContext::background().with_cancel();
        token.cancel();
        assert!(!sleep_unless_done(&ctx, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn stops_when_deadline_hits_mid_sleep() {
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(10));
        let start = Instant::now();
        assert!(!sleep_unless_done(&ctx, Duration::from_secs(5)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
