//! State of one outbound RPC call and its finalization.
//!
//! The call is finished exactly once, after the response has been read or
//! the call failed. Finishing records latency and exactly one of
//! `client.success`, `client.app-errors` or `client.system-errors`.

use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use crate::context::{ContextError, LogField, RequestContext};
use crate::errors::{ClientError, SystemErrorCode};
use crate::headers::RpcHeaders;
use crate::observability::metrics::{names, tags};
use crate::observability::Instrumentation;

#[derive(Debug)]
pub struct RpcOutboundCall {
    ctx: RequestContext,
    instrumentation: Instrumentation,
    method_name: String,
    service_method: String,
    start_time: Instant,
    started_at: SystemTime,
    duration: Option<Duration>,
    success: Option<bool>,
    req_headers: RpcHeaders,
    res_headers: RpcHeaders,
    finished: bool,
}

impl RpcOutboundCall {
    pub fn start(
        ctx: RequestContext,
        instrumentation: Instrumentation,
        method_name: &str,
        service_method: &str,
    ) -> Self {
        Self {
            ctx,
            instrumentation,
            method_name: method_name.to_string(),
            service_method: service_method.to_string(),
            start_time: Instant::now(),
            started_at: SystemTime::now(),
            duration: None,
            success: None,
            req_headers: RpcHeaders::new(),
            res_headers: RpcHeaders::new(),
            finished: false,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn set_req_headers(&mut self, headers: RpcHeaders) {
        self.req_headers = headers;
    }

    /// Latch the response headers and the application-error flag.
    pub fn set_response(&mut self, headers: RpcHeaders, success: bool) {
        self.res_headers = headers;
        self.success = Some(success);
    }

    /// `None` until response headers were read.
    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn res_headers(&self) -> &RpcHeaders {
        &self.res_headers
    }

    /// Emit latency and outcome metrics plus the finish log entry.
    pub fn finish(&mut self, err: Option<&ClientError>) -> Duration {
        let metrics = &self.instrumentation.metrics;
        let logger = &self.instrumentation.logger;
        if self.finished {
            logger.error(
                &self.ctx,
                "Finished an outgoing client RPC request twice",
                vec![LogField::string("serviceMethod", self.service_method.as_str())],
            );
            return self.duration.unwrap_or_default();
        }
        self.finished = true;

        let duration = self.start_time.elapsed();
        self.duration = Some(duration);
        metrics.record_timer(&self.ctx, names::CLIENT_LATENCY, duration);
        metrics.record_histogram_duration(&self.ctx, names::CLIENT_LATENCY_HIST, duration);

        let mut fields = vec![
            LogField::string("clientMethod", self.method_name.as_str()),
            LogField::string("serviceMethod", self.service_method.as_str()),
            LogField::time("timestamp-started", self.started_at),
            LogField::time("timestamp-finished", SystemTime::now()),
        ];
        fields.extend(
            self.req_headers
                .iter()
                .map(|(k, v)| LogField::string(format!("Client-Req-Header-{k}"), v.as_str())),
        );
        fields.extend(
            self.res_headers
                .iter()
                .map(|(k, v)| LogField::string(format!("Client-Res-Header-{k}"), v.as_str())),
        );

        match (err, self.success) {
            (None, Some(true)) => {
                metrics.inc_counter(&self.ctx, names::CLIENT_SUCCESS, 1);
                logger.debug(&self.ctx, "Finished an outgoing client RPC request", fields);
            }
            (None, _) => {
                metrics.inc_counter(&self.ctx, names::CLIENT_APP_ERRORS, 1);
                logger.debug(&self.ctx, "Finished an outgoing client RPC request", fields);
            }
            (Some(err), _) => {
                let code = system_error_code(err);
                let ctx = self.ctx.with_scope_tags([(tags::ERROR, code.metric_tag())]);
                metrics.inc_counter(&ctx, names::CLIENT_SYSTEM_ERRORS, 1);
                fields.push(LogField::string("error", err.to_string()));
                logger.warn(&ctx, "Failed to send outgoing client RPC request", fields);
            }
        }
        duration
    }
}

/// The code a failed call is counted under.
fn system_error_code(err: &ClientError) -> SystemErrorCode {
    if let Some(system) = err.system_error() {
        return system.code;
    }
    match err.context_error() {
        Some(ContextError::DeadlineExceeded) => SystemErrorCode::Timeout,
        Some(ContextError::Cancelled) => SystemErrorCode::Cancelled,
        None => SystemErrorCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SystemError;
    use crate::testing::TestInstrumentation;

    fn call(test: &TestInstrumentation) -> RpcOutboundCall {
        RpcOutboundCall::start(
            RequestContext::background().with_scope_tags([("client", "baz")]),
            test.instrumentation.clone(),
            "Echo",
            "Backend::echo",
        )
    }

    #[test]
    fn success_and_app_error_are_distinct() {
        let test = TestInstrumentation::new();
        let mut ok = call(&test);
        ok.set_response(RpcHeaders::new(), true);
        ok.finish(None);

        let mut app = call(&test);
        app.set_response(RpcHeaders::new(), false);
        app.finish(None);

        assert_eq!(test.metrics.counter("client.success", &[]), 1);
        assert_eq!(test.metrics.counter("client.app-errors", &[]), 1);
        assert_eq!(test.metrics.timer_samples("client.latency", &[]).len(), 2);
    }

    #[test]
    fn system_errors_are_tagged_by_code() {
        let test = TestInstrumentation::new();
        let err = ClientError::System(SystemError::new(SystemErrorCode::Timeout, "slow"));
        call(&test).finish(Some(&err));

        let busy = ClientError::System(SystemError::new(SystemErrorCode::Busy, "busy"));
        call(&test).finish(Some(&busy));

        let deadline = ClientError::Context(ContextError::DeadlineExceeded);
        call(&test).finish(Some(&deadline));

        assert_eq!(test.metrics.counter("client.system-errors", &[("error", "timeout")]), 2);
        assert_eq!(test.metrics.counter("client.system-errors", &[("error", "unknown")]), 1);
    }

    #[test]
    fn second_finish_logs_error() {
        let test = TestInstrumentation::new();
        let mut c = call(&test);
        c.set_response(RpcHeaders::new(), true);
        c.finish(None);
        c.finish(None);
        assert_eq!(test.metrics.counter("client.success", &[]), 1);
        assert_eq!(
            test.logs
                .entries_with_message("Finished an outgoing client RPC request twice")
                .len(),
            1
        );
    }
}
