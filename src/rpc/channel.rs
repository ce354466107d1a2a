//! RPC transport channel and per-service subchannels.
//!
//! # Responsibilities
//! - Own one subchannel per downstream service, each with its peer list
//! - Pick peers round-robin
//! - Run a single call attempt: connect, send the call request, read the
//!   matching response or error frame
//!
//! # Design Decisions
//! - One TCP connection per attempt; a dropped attempt closes its socket,
//!   which the server observes as cancellation
//! - Local connect and I/O failures surface as `NetworkError` system errors
//!   so the retry harness treats them as transient

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::context::RequestContext;
use crate::errors::ClientError;
use crate::rpc::errors::{ProtocolError, SystemError, SystemErrorCode};
use crate::rpc::frame::{transport_headers, CallRequest, CallResponse, Frame};

/// TTL sent when the attempt context carries no deadline.
pub const DEFAULT_CALL_TTL: Duration = Duration::from_secs(1);

/// Shared transport for every RPC client of one process.
#[derive(Debug)]
pub struct Channel {
    caller_name: String,
    sub_channels: DashMap<String, Arc<SubChannel>>,
}

impl Channel {
    pub fn new(caller_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            caller_name: caller_name.into(),
            sub_channels: DashMap::new(),
        })
    }

    pub fn caller_name(&self) -> &str {
        &self.caller_name
    }

    /// The subchannel for `service`, created with `peers` on first use.
    /// Later registrations share it and keep the first peer list.
    pub fn sub_channel(&self, service: &str, peers: &[SocketAddr]) -> Arc<SubChannel> {
        let sub = self
            .sub_channels
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(SubChannel {
                    service_name: service.to_string(),
                    caller_name: self.caller_name.clone(),
                    peers: peers.to_vec(),
                    next_peer: AtomicUsize::new(0),
                    next_id: AtomicU32::new(1),
                })
            })
            .value()
            .clone();
        if !peers.is_empty() && sub.peers != peers {
            tracing::warn!(
                service,
                registered = ?sub.peers,
                ignored = ?peers,
                "Subchannel already registered with different peers; keeping the first"
            );
        }
        sub
    }
}

/// Calls to one downstream service.
#[derive(Debug)]
pub struct SubChannel {
    service_name: String,
    caller_name: String,
    peers: Vec<SocketAddr>,
    next_peer: AtomicUsize,
    next_id: AtomicU32,
}

impl SubChannel {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    fn choose_peer(&self) -> Option<SocketAddr> {
        if self.peers.is_empty() {
            return None;
        }
        let index = self.next_peer.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        Some(self.peers[index])
    }

    /// One call attempt. Routing hints are read from `ctx`.
    pub async fn call(
        &self,
        ctx: &RequestContext,
        method: &str,
        arg2: Bytes,
        arg3: Bytes,
    ) -> Result<CallResponse, ClientError> {
        let peer = self.choose_peer().ok_or_else(|| ClientError::Transport {
            reason: format!("no peers available for service {}", self.service_name),
        })?;

        let mut headers = BTreeMap::new();
        headers.insert(
            transport_headers::CALLER_NAME.to_string(),
            self.caller_name.clone(),
        );
        let hints = [
            (transport_headers::ROUTING_KEY, ctx.routing_key()),
            (transport_headers::SHARD_KEY, ctx.shard_key()),
            (transport_headers::ROUTING_DELEGATE, ctx.routing_delegate()),
        ];
        for (key, value) in hints {
            if let Some(value) = value {
                headers.insert(key.to_string(), value.to_string());
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Frame::CallRequest(CallRequest {
            id,
            ttl: ctx.remaining().unwrap_or(DEFAULT_CALL_TTL),
            service: self.service_name.clone(),
            method: method.to_string(),
            transport_headers: headers,
            arg2,
            arg3,
        });

        let stream = TcpStream::connect(peer)
            .await
            .map_err(|e| network_error(format!("connect to {peer}: {e}")))?;
        stream.set_nodelay(true).ok();
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        framed
            .send(request.encode()?)
            .await
            .map_err(|e| network_error(format!("write to {peer}: {e}")))?;

        tracing::trace!(peer = %peer, call_id = id, method = %method, "Sent rpc call");

        let bytes = match framed.next().await {
            Some(Ok(bytes)) => bytes.freeze(),
            Some(Err(e)) => return Err(network_error(format!("read from {peer}: {e}"))),
            None => return Err(network_error(format!("connection to {peer} closed"))),
        };

        match Frame::decode(bytes)? {
            Frame::CallResponse(response) => Ok(response),
            Frame::Error(err) => Err(ClientError::System(err.into_system_error())),
            Frame::CallRequest(_) => Err(ClientError::Protocol(ProtocolError::UnexpectedFrame {
                got: "call-request",
            })),
        }
    }
}

fn network_error(message: String) -> ClientError {
    ClientError::System(SystemError::new(SystemErrorCode::NetworkError, message))
}
