//! Inbound HTTP endpoints mounted on a real listener.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use gateway_runtime::capture::CaptureEvent;
use gateway_runtime::config::HttpServerConfig;
use gateway_runtime::http::{
    router, HttpEndpoint, HttpServer, ServerHttpRequest, ServerHttpResponse,
};
use gateway_runtime::lifecycle::Shutdown;
use gateway_runtime::testing::TestInstrumentation;
use gateway_runtime::ContextExtractors;

mod common;

async fn serve(endpoints: Vec<HttpEndpoint>) -> String {
    let app = router(endpoints, Duration::from_secs(5)).unwrap();
    let addr = common::start_http_backend(app).await;
    format!("http://{addr}")
}

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

#[tokio::test]
async fn endpoint_reads_params_query_and_body() {
    let test = TestInstrumentation::new();
    let endpoint = HttpEndpoint::new(
        "greeter",
        "hello",
        Method::POST,
        "/hello/{lang}",
        |mut req: ServerHttpRequest, mut res: ServerHttpResponse| async move {
            let Ok(greeting) = req.read_and_unmarshal_body::<Greeting>(&mut res).await else {
                return res;
            };
            let lang = req.param("lang").unwrap_or_default().to_string();
            let loud = req.has_query_value("loud");
            let tags = req.get_query_values("tag").join(",");
            res.write_json(
                200,
                &[],
                &json!({"lang": lang, "name": greeting.name, "loud": loud, "tags": tags}),
            );
            res
        },
    )
    .with_instrumentation(test.instrumentation.clone())
    .with_request_uuid_header_key(common::UUID_HEADER);
    let base = serve(vec![endpoint]).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/hello/fr?loud=1&tag=a&tag=b"))
        .header(common::UUID_HEADER, "uuid-7")
        .json(&json!({"name": "Ada"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"lang": "fr", "name": "Ada", "loud": true, "tags": "a,b"})
    );

    let tags = [("endpoint", "greeter"), ("handler", "hello"), ("protocol", "http")];
    assert_eq!(test.metrics.counter("endpoint.request", &tags), 1);
    assert_eq!(
        test.metrics
            .counter("endpoint.status", &[("endpoint", "greeter"), ("status", "200")]),
        1
    );
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let test = TestInstrumentation::new();
    let endpoint = HttpEndpoint::new(
        "greeter",
        "hello",
        Method::POST,
        "/hello",
        |mut req: ServerHttpRequest, mut res: ServerHttpResponse| async move {
            if req.read_and_unmarshal_body::<Greeting>(&mut res).await.is_ok() {
                res.write_json(200, &[], &json!({}));
            }
            res
        },
    )
    .with_instrumentation(test.instrumentation.clone());
    let base = serve(vec![endpoint]).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/hello"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Could not parse json");
    assert_eq!(test.metrics.counter("endpoint.app-errors", &[]), 1);
}

#[tokio::test]
async fn no_content_flushes_without_body() {
    let test = TestInstrumentation::new();
    let endpoint = HttpEndpoint::new(
        "empty",
        "none",
        Method::DELETE,
        "/thing",
        |_req: ServerHttpRequest, mut res: ServerHttpResponse| async move {
            res.write_json(204, &[], &json!({"ignored": true}));
            res
        },
    )
    .with_instrumentation(test.instrumentation.clone());
    let base = serve(vec![endpoint]).await;

    let response = reqwest::Client::new()
        .delete(format!("{base}/thing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn gateway_endpoint_reports_overhead_and_captures() {
    let backend = Router::new().route("/bar-path", get(|| async { r#"{"value":{"n":1}}"# }));
    let backend_addr = common::start_http_backend(backend).await;

    let test = TestInstrumentation::new();
    let client = common::http_client(&test, backend_addr);
    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);

    let endpoint = HttpEndpoint::new(
        "gateway",
        "proxy",
        Method::GET,
        "/proxy",
        move |req: ServerHttpRequest, mut res: ServerHttpResponse| {
            let client = Arc::clone(&client);
            let seen = Arc::clone(&seen);
            async move {
                let mut call = client.new_request(req.context(), "Normal");
                if let Err(err) = call.write_json::<()>("GET", "/bar-path", &[], None) {
                    res.send_error(500, "could not build request", &err);
                    return res;
                }
                match call.send().await {
                    Ok(mut downstream) => {
                        let body = downstream.read_all().unwrap_or_default();
                        if let Some(duration) = downstream.duration() {
                            res.set_downstream_finish(duration);
                        }
                        res.write_json_bytes(200, &[], body);
                    }
                    Err(err) => res.send_error(502, "downstream failed", &err),
                }
                if let Some(container) = req.context().event_container() {
                    seen.lock().unwrap().extend(container.snapshot());
                }
                let peeked = res.peek_body(&["value"]).unwrap_or_default();
                res.set_pending_body(peeked);
                res
            }
        },
    )
    .with_instrumentation(test.instrumentation.clone())
    .with_extractors(ContextExtractors::new().add_scope_tags_extractor(|ctx| {
        let mut tags = BTreeMap::new();
        if let Some(region) = ctx.endpoint_request_headers().get("x-region") {
            tags.insert("region".to_string(), region.clone());
        }
        tags
    }))
    .with_capture();
    let base = serve(vec![endpoint]).await;

    let response = reqwest::Client::new()
        .get(format!("{base}/proxy"))
        .header("x-region", "west")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), r#"{"n":1}"#);

    let tags = [("endpoint", "gateway"), ("region", "west")];
    assert_eq!(test.metrics.timer_samples("endpoint.overhead.latency", &tags).len(), 1);
    let ratio = test
        .metrics
        .gauge_value("endpoint.overhead.latency.ratio", &tags)
        .unwrap();
    assert!((0.0..=1.0).contains(&ratio), "ratio {ratio}");
    assert_eq!(
        test.metrics
            .counter("client.status", &[("client", "bar"), ("region", "west")]),
        1
    );

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], CaptureEvent::HttpOutgoing(e) if e.client_id == "bar"));
}

#[tokio::test]
async fn configured_server_applies_request_timeout_and_stops() {
    let test = TestInstrumentation::new();
    let fast = HttpEndpoint::new(
        "timing",
        "fast",
        Method::GET,
        "/fast",
        |_req: ServerHttpRequest, mut res: ServerHttpResponse| async move {
            res.write_json(200, &[], &json!({"ok": true}));
            res
        },
    )
    .with_instrumentation(test.instrumentation.clone());
    let slow = HttpEndpoint::new(
        "timing",
        "slow",
        Method::GET,
        "/slow",
        |_req: ServerHttpRequest, mut res: ServerHttpResponse| async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            res.write_json(200, &[], &json!({"ok": true}));
            res
        },
    )
    .with_instrumentation(test.instrumentation.clone());

    let config = HttpServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        request_timeout_secs: 1,
    };
    let server = HttpServer::bind(&config, vec![fast, slow]).await.unwrap();
    let base = format!("http://{}", server.local_addr().unwrap());
    let shutdown = Shutdown::new();
    let running = tokio::spawn(server.run(shutdown.subscribe()));

    let client = reqwest::Client::new();
    let response = client.get(format!("{base}/fast")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let started = tokio::time::Instant::now();
    let response = client.get(format!("{base}/slow")).send().await.unwrap();
    assert_eq!(response.status(), 408);
    assert!(started.elapsed() < Duration::from_secs(3));
    drop(client);

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
