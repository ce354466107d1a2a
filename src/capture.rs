//! Capture spine: per-request record of every outbound call.
//!
//! When the inbound context opts in via [`RequestContext::with_capture`],
//! both outbound paths append a [`CaptureEvent`] as soon as response bytes
//! are available. Payloads are stored verbatim; redaction belongs to
//! whoever reads the container.
//!
//! [`RequestContext::with_capture`]: crate::context::RequestContext::with_capture

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::{HeaderMap, Method};
use bytes::Bytes;

/// An outbound HTTP call as the client saw it.
#[derive(Debug, Clone)]
pub struct HttpOutgoingEvent {
    pub client_id: String,
    pub target: String,
    pub url: String,
    pub method: Method,
    pub req_headers: HeaderMap,
    pub req_body: Bytes,
    pub status: u16,
    pub res_headers: HeaderMap,
    pub res_body: Bytes,
}

/// An outbound RPC call: arg2 maps and encoded arg3 bodies.
#[derive(Debug, Clone)]
pub struct RpcOutgoingEvent {
    pub client_id: String,
    pub service_method: String,
    pub req_headers: BTreeMap<String, String>,
    pub req_body: Bytes,
    pub res_headers: BTreeMap<String, String>,
    pub res_body: Bytes,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    HttpOutgoing(HttpOutgoingEvent),
    RpcOutgoing(RpcOutgoingEvent),
}

impl CaptureEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CaptureEvent::HttpOutgoing(_) => "event-http-outgoing",
            CaptureEvent::RpcOutgoing(_) => "event-rpc-outgoing",
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            CaptureEvent::HttpOutgoing(e) => &e.client_id,
            CaptureEvent::RpcOutgoing(e) => &e.client_id,
        }
    }
}

/// Append-only event list shared by every context derived from the one that
/// enabled capture.
#[derive(Debug, Clone, Default)]
pub struct EventContainer {
    events: Arc<Mutex<Vec<CaptureEvent>>>,
}

impl EventContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: CaptureEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Copy of the events recorded so far, in append order.
    pub fn snapshot(&self) -> Vec<CaptureEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles point at the same underlying list.
    pub fn same_container(&self, other: &EventContainer) -> bool {
        Arc::ptr_eq(&self.events, &other.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_event(client: &str) -> CaptureEvent {
        CaptureEvent::RpcOutgoing(RpcOutgoingEvent {
            client_id: client.to_string(),
            service_method: "Echo::echo".to_string(),
            req_headers: BTreeMap::new(),
            req_body: Bytes::from_static(b"{}"),
            res_headers: BTreeMap::new(),
            res_body: Bytes::from_static(b"{}"),
            success: true,
        })
    }

    #[test]
    fn clones_share_events() {
        let container = EventContainer::new();
        let handle = container.clone();
        handle.push(rpc_event("a"));
        container.push(rpc_event("b"));

        let events = container.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].client_id(), "a");
        assert_eq!(events[1].name(), "event-rpc-outgoing");
        assert!(container.same_container(&handle));
    }
}
