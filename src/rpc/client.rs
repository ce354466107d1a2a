//! Outbound binary-RPC client.
//!
//! # Responsibilities
//! - Encode arg2 headers and the arg3 body of one call
//! - Pick the subchannel, consulting the rule engine when configured
//! - Run the call under the transport retry harness
//! - Decode the response, check framing residue, finish metrics and capture
//!
//! # Design Decisions
//! - System errors come back unwrapped so callers can match on the code;
//!   everything else is wrapped with client and method
//! - Channel selection runs once per call, so a routing delegate from the
//!   rule engine is applied exactly once

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::capture::{CaptureEvent, RpcOutgoingEvent};
use crate::config::{RpcClientConfig, ValidationError};
use crate::context::{LogField, RequestContext};
use crate::errors::ClientError;
use crate::headers::{HeaderCarrier, RpcHeaders, CLIENT_RESPONSE_DURATION_KEY};
use crate::observability::metrics::{names, tags};
use crate::observability::Instrumentation;
use crate::resilience::{run_with_retry, RetryOptions};
use crate::rpc::channel::{Channel, SubChannel};
use crate::rpc::codec::WireStruct;
use crate::rpc::headers::{ensure_empty, read_headers, write_headers};
use crate::rpc::outbound_call::RpcOutboundCall;
use crate::rpc::rule_engine::RuleEngine;

/// A decoded RPC response.
#[derive(Debug, Clone)]
pub struct RpcResponse<T> {
    /// `false` when the server flagged an application error; `body` then
    /// holds the error struct.
    pub success: bool,
    pub headers: RpcHeaders,
    pub body: T,
}

struct Exchange<T> {
    response: RpcResponse<T>,
    req_body: Bytes,
    res_body: Bytes,
}

/// Client for one downstream RPC service.
pub struct RpcClient {
    client_id: String,
    service_name: String,
    default_sub_channel: Arc<SubChannel>,
    alt_sub_channels: HashMap<String, Arc<SubChannel>>,
    method_names: BTreeMap<String, String>,
    timeout: Duration,
    timeout_per_attempt: Duration,
    max_attempts: u32,
    routing_key: Option<String>,
    request_uuid_header_key: String,
    rule_engine: Option<RuleEngine>,
    header_patterns: Vec<String>,
    instrumentation: Instrumentation,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("client_id", &self.client_id)
            .field("service_name", &self.service_name)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    pub fn from_config(
        config: &RpcClientConfig,
        request_uuid_header_key: &str,
        channel: &Channel,
        instrumentation: Instrumentation,
    ) -> Result<Self, ValidationError> {
        let peers = parse_peers(&config.client_id, &config.peers)?;
        let default_sub_channel = channel.sub_channel(&config.service_name, &peers);

        let mut alt_sub_channels = HashMap::new();
        for alt in &config.alt_subchannels {
            let peers = parse_peers(&config.client_id, &alt.peers)?;
            alt_sub_channels.insert(alt.name.clone(), channel.sub_channel(&alt.service_name, &peers));
        }

        let rule_engine = if config.rules.is_empty() {
            None
        } else {
            let engine = RuleEngine::new(&config.rules).map_err(|e| {
                let pattern = config
                    .rules
                    .iter()
                    .flat_map(|rule| &rule.patterns)
                    .find(|p| regex::Regex::new(p).is_err())
                    .cloned()
                    .unwrap_or_default();
                ValidationError::InvalidPattern {
                    client_id: config.client_id.clone(),
                    pattern,
                    reason: e.to_string(),
                }
            })?;
            Some(engine)
        };

        Ok(Self {
            client_id: config.client_id.clone(),
            service_name: config.service_name.clone(),
            default_sub_channel,
            alt_sub_channels,
            method_names: config.method_names.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            timeout_per_attempt: Duration::from_millis(config.timeout_per_attempt_ms),
            max_attempts: config.max_attempts,
            routing_key: config.routing_key.clone(),
            request_uuid_header_key: request_uuid_header_key.to_string(),
            rule_engine,
            header_patterns: config.header_patterns.clone(),
            instrumentation,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The subchannel for a call carrying `headers`, plus the routing
    /// delegate of the matching rule.
    pub fn select_sub_channel(&self, headers: &RpcHeaders) -> (Arc<SubChannel>, Option<String>) {
        let Some(engine) = &self.rule_engine else {
            return (Arc::clone(&self.default_sub_channel), None);
        };
        for pattern in &self.header_patterns {
            let Some(value) = headers.get_header(pattern) else {
                continue;
            };
            let value = value.to_lowercase();
            let Some(rule_value) = engine.get_value(&[pattern.as_str(), value.as_str()]) else {
                continue;
            };
            let Some(name) = rule_value.first() else {
                continue;
            };
            match self.alt_sub_channels.get(name) {
                Some(sub) => return (Arc::clone(sub), rule_value.get(1).cloned()),
                None => {
                    tracing::warn!(
                        client_id = %self.client_id,
                        alt_channel = %name,
                        "Rule selected an unknown alt channel"
                    );
                    break;
                }
            }
        }
        (Arc::clone(&self.default_sub_channel), None)
    }

    /// Call `service_method` (`Service::method`).
    pub async fn call<Req, Res>(
        &self,
        ctx: &RequestContext,
        service_method: &str,
        req_headers: RpcHeaders,
        req: &Req,
    ) -> Result<RpcResponse<Res>, ClientError>
    where
        Req: WireStruct,
        Res: WireStruct,
    {
        let method_name = self
            .method_names
            .get(service_method)
            .cloned()
            .unwrap_or_else(|| service_method.to_string());
        let (service, endpoint) = service_method
            .split_once("::")
            .unwrap_or((self.service_name.as_str(), service_method));
        let ctx = ctx
            .with_scope_tags([
                (tags::CLIENT, self.client_id.as_str()),
                (tags::CLIENT_METHOD, method_name.as_str()),
                (tags::TARGET_SERVICE, service),
                (tags::TARGET_ENDPOINT, endpoint),
                (tags::CLIENT_TYPE, tags::PROTOCOL_RPC),
            ])
            .with_log_fields([
                LogField::string("clientID", self.client_id.as_str()),
                LogField::string("clientMethod", method_name.as_str()),
                LogField::string("serviceMethod", service_method),
            ]);

        let mut headers = req_headers;
        if !self.request_uuid_header_key.is_empty() {
            if let Some(uuid) = ctx.request_uuid() {
                headers.set_header(&self.request_uuid_header_key, uuid);
            }
        }

        let mut call = RpcOutboundCall::start(
            ctx.clone(),
            self.instrumentation.clone(),
            &method_name,
            service_method,
        );
        call.set_req_headers(headers.clone());

        let result = self
            .exchange::<Req, Res>(&ctx, service_method, &headers, req, &mut call)
            .await;
        let duration = call.finish(result.as_ref().err());

        match result {
            Ok(mut exchange) => {
                exchange.response.headers.insert(
                    CLIENT_RESPONSE_DURATION_KEY.to_string(),
                    duration.as_millis().to_string(),
                );
                if let Some(events) = ctx.event_container().filter(|_| ctx.to_capture()) {
                    events.push(CaptureEvent::RpcOutgoing(RpcOutgoingEvent {
                        client_id: self.client_id.clone(),
                        service_method: service_method.to_string(),
                        req_headers: headers,
                        req_body: exchange.req_body,
                        res_headers: exchange.response.headers.clone(),
                        res_body: exchange.res_body,
                        success: exchange.response.success,
                    }));
                }
                Ok(exchange.response)
            }
            Err(err) => match err.system_error() {
                Some(system) => Err(ClientError::System(system.clone())),
                None => Err(ClientError::outbound(&self.client_id, &method_name, err)),
            },
        }
    }

    async fn exchange<Req, Res>(
        &self,
        ctx: &RequestContext,
        service_method: &str,
        headers: &RpcHeaders,
        req: &Req,
        call: &mut RpcOutboundCall,
    ) -> Result<Exchange<Res>, ClientError>
    where
        Req: WireStruct,
        Res: WireStruct,
    {
        let req_body = req.encode().map_err(|e| ClientError::Encode {
            client_id: self.client_id.clone(),
            method: service_method.to_string(),
            reason: e.to_string(),
        })?;
        let arg2 = write_headers(headers)?;

        let (sub_channel, delegate) = self.select_sub_channel(headers);
        let mut call_ctx = ctx.with_timeout(self.timeout);
        if call_ctx.routing_key().is_none() {
            if let Some(key) = &self.routing_key {
                call_ctx = call_ctx.with_routing_key(key);
            }
        }
        if let Some(delegate) = delegate {
            call_ctx = call_ctx.with_routing_delegate(delegate);
        }

        let options = RetryOptions::new(self.max_attempts, self.timeout_per_attempt);
        let response = run_with_retry(&call_ctx, options, |attempt_ctx, _attempt| {
            let sub_channel = Arc::clone(&sub_channel);
            let arg2 = arg2.clone();
            let arg3 = req_body.clone();
            let method = service_method.to_string();
            async move { sub_channel.call(&attempt_ctx, &method, arg2, arg3).await }
        })
        .await?;

        let mut res_arg2 = response.arg2;
        let res_headers = read_headers(&mut res_arg2)?;
        ensure_empty(&res_arg2, "reading response headers")?;
        let success = !response.application_error;
        call.set_response(res_headers.clone(), success);

        let mut res_arg3 = response.arg3.clone();
        let body = Res::decode(&mut res_arg3).map_err(|e| {
            self.instrumentation
                .metrics
                .inc_counter(ctx, names::CLIENT_BINARY_UNMARSHAL_ERROR, 1);
            ClientError::Unmarshal {
                client_id: self.client_id.clone(),
                method: service_method.to_string(),
                type_name: Res::type_name(),
                reason: e.to_string(),
            }
        })?;
        ensure_empty(&res_arg3, "reading response body")?;

        Ok(Exchange {
            response: RpcResponse {
                success,
                headers: res_headers,
                body,
            },
            req_body,
            res_body: response.arg3,
        })
    }
}

fn parse_peers(client_id: &str, peers: &[String]) -> Result<Vec<SocketAddr>, ValidationError> {
    peers
        .iter()
        .map(|peer| {
            peer.parse().map_err(|_| ValidationError::InvalidPeer {
                client_id: client_id.to_string(),
                peer: peer.clone(),
            })
        })
        .collect()
}
