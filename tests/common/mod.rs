//! Shared stub backends for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;

use gateway_runtime::config::{RpcClientConfig, RpcServerConfig};
use gateway_runtime::http::HttpClient;
use gateway_runtime::lifecycle::Shutdown;
use gateway_runtime::rpc::{Channel, RpcClient, RpcRouter, RpcServer};
use gateway_runtime::testing::TestInstrumentation;

pub const UUID_HEADER: &str = "x-request-uuid";

/// Serve `router` on an ephemeral port.
pub async fn start_http_backend(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// An HTTP client named `bar` pointing at `addr`.
pub fn http_client(test: &TestInstrumentation, addr: SocketAddr) -> Arc<HttpClient> {
    let client = HttpClient::builder("bar", format!("http://{addr}"))
        .method("Normal", "bar-endpoint")
        .method("Slow", "slow-endpoint")
        .timeout(Duration::from_secs(5))
        .request_uuid_header_key(UUID_HEADER)
        .instrumentation(test.instrumentation.clone())
        .build()
        .unwrap();
    Arc::new(client)
}

/// Run an RPC server for `router` on an ephemeral port.
///
/// The server stops when the returned `Shutdown` is dropped or triggered.
pub async fn start_rpc_backend(service_name: &str, router: RpcRouter) -> (SocketAddr, Shutdown) {
    let config = RpcServerConfig {
        service_name: service_name.to_string(),
        bind_address: "127.0.0.1:0".to_string(),
        max_connections: 64,
    };
    let server = RpcServer::bind(&config, Arc::new(router))
        .await
        .unwrap()
        .with_drain_timeout(Duration::from_millis(200));
    let addr = server.local_addr().unwrap();
    let shutdown = Shutdown::new();
    tokio::spawn(server.run(shutdown.subscribe()));
    (addr, shutdown)
}

/// Client config `baz` for service `Backend` at `addr`.
pub fn rpc_client_config(addr: SocketAddr) -> RpcClientConfig {
    RpcClientConfig {
        client_id: "baz".to_string(),
        service_name: "Backend".to_string(),
        peers: vec![addr.to_string()],
        method_names: [("Backend::echo".to_string(), "Echo".to_string())]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

pub fn rpc_client(test: &TestInstrumentation, config: &RpcClientConfig) -> RpcClient {
    RpcClient::from_config(
        config,
        UUID_HEADER,
        &Channel::new("gateway"),
        test.instrumentation.clone(),
    )
    .unwrap()
}
