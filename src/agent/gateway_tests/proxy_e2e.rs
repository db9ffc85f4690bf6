use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{Request as HttpRequest, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;

use super::common::{body_bytes, get_json, post_json, send, spawn_upstream, test_state};
use crate::agent::gateway::build_router;

const ANTHROPIC_BODY: &str =
    r#"{"id":"msg_01","model":"claude-sonnet-4","usage":{"input_tokens":1000,"output_tokens":500}}"#;

#[derive(Debug, Clone)]
struct Captured {
    method: String,
    uri: String,
    api_key: Option<String>,
}

#[tokio::test]
async fn anthropic_response_is_relayed_verbatim_and_metered() {
    let captured: Arc<Mutex<Option<Captured>>> = Arc::new(Mutex::new(None));
    let captured2 = captured.clone();
    let mock = Router::new().route(
        "/v1/messages",
        post(move |req: Request| {
            let captured = captured2.clone();
            async move {
                *captured.lock() = Some(Captured {
                    method: req.method().to_string(),
                    uri: req.uri().to_string(),
                    api_key: req
                        .headers()
                        .get("x-api-key")
                        .and_then(|v| v.to_str().ok())
                        .map(String::from),
                });
                (
                    StatusCode::OK,
                    [("content-type", "application/json"), ("x-upstream-id", "abc")],
                    ANTHROPIC_BODY,
                )
            }
        }),
    );
    let base = spawn_upstream(mock).await;

    let tmp = tempfile::tempdir().expect("tempdir");
    let app = build_router(test_state(tmp.path(), &base));

    let resp = send(
        &app,
        HttpRequest::builder()
            .method("POST")
            .uri("/anthropic/v1/messages?beta=tools")
            .header("content-type", "application/json")
            .header("x-api-key", "sk-ant-test")
            .body(Body::from(r#"{"model":"claude-sonnet-4","messages":[]}"#))
            .unwrap(),
    )
    .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-upstream-id"], "abc");
    let bytes = body_bytes(resp).await;
    assert_eq!(&bytes[..], ANTHROPIC_BODY.as_bytes());

    // Prefix stripped, query preserved, key forwarded opaquely.
    let seen = captured.lock().clone().expect("upstream was called");
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.uri, "/v1/messages?beta=tools");
    assert_eq!(seen.api_key.as_deref(), Some("sk-ant-test"));

    let (_, stats) = get_json(&app, "/stats").await;
    assert_eq!(stats["requests"], 1);
    assert_eq!(stats["totalInputTokens"], 1000);
    assert_eq!(stats["totalOutputTokens"], 500);
    assert!((stats["totalCost"].as_f64().unwrap() - 0.0105).abs() < 1e-9);
    assert_eq!(stats["byModel"]["claude-sonnet-4"]["requests"], 1);
    assert_eq!(stats["byDay"]["2026-02-14"]["inputTokens"], 1000);
}

#[tokio::test]
async fn openai_token_field_names_are_metered_too() {
    let mock = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::OK,
                [("content-type", "application/json")],
                r#"{"model":"gpt-4o-mini","usage":{"prompt_tokens":200,"completion_tokens":100}}"#,
            )
        }),
    );
    let base = spawn_upstream(mock).await;

    let tmp = tempfile::tempdir().expect("tempdir");
    let app = build_router(test_state(tmp.path(), &base));

    let (status, _) = post_json(&app, "/openai/v1/chat/completions", "{}").await;
    assert_eq!(status, StatusCode::OK);

    let (_, stats) = get_json(&app, "/stats").await;
    assert_eq!(stats["byModel"]["gpt-4o-mini"]["inputTokens"], 200);
    assert_eq!(stats["byModel"]["gpt-4o-mini"]["outputTokens"], 100);
    // (200 * 0.15 + 100 * 0.6) / 1e6
    assert!((stats["totalCost"].as_f64().unwrap() - 0.00009).abs() < 1e-12);
}

#[tokio::test]
async fn upstream_error_statuses_relay_without_metering() {
    let mock = Router::new().route(
        "/v1/messages",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("content-type", "application/json")],
                r#"{"error":{"type":"rate_limit_error"}}"#,
            )
        }),
    );
    let base = spawn_upstream(mock).await;

    let tmp = tempfile::tempdir().expect("tempdir");
    let app = build_router(test_state(tmp.path(), &base));

    let (status, body) = post_json(&app, "/anthropic/v1/messages", "{}").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["type"], "rate_limit_error");

    let (_, stats) = get_json(&app, "/stats").await;
    assert_eq!(stats["requests"], 0);
}

#[tokio::test]
async fn non_json_upstream_bodies_relay_verbatim() {
    const STREAM_BODY: &str = "event: message_start\n\ndata: {\"type\":\"content_block_delta\"}\n\n";
    let mock = Router::new().route(
        "/v1/messages",
        post(|| async {
            (
                StatusCode::OK,
                [("content-type", "text/event-stream")],
                STREAM_BODY,
            )
        }),
    );
    let base = spawn_upstream(mock).await;

    let tmp = tempfile::tempdir().expect("tempdir");
    let app = build_router(test_state(tmp.path(), &base));

    let resp = send(
        &app,
        HttpRequest::builder()
            .method("POST")
            .uri("/anthropic/v1/messages")
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    let bytes = body_bytes(resp).await;
    assert_eq!(&bytes[..], STREAM_BODY.as_bytes());

    let (_, stats) = get_json(&app, "/stats").await;
    assert_eq!(stats["requests"], 0);
}

#[tokio::test]
async fn unreachable_upstream_is_a_gateway_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    // Nothing listens on port 1.
    let app = build_router(test_state(tmp.path(), "http://127.0.0.1:1"));

    let (status, body) = post_json(&app, "/openai/v1/chat/completions", "{}").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "Proxy error");
    assert!(body["details"].as_str().is_some_and(|s| !s.is_empty()));

    let (_, stats) = get_json(&app, "/stats").await;
    assert_eq!(stats["requests"], 0);
}

#[tokio::test]
async fn monthly_block_short_circuits_without_an_upstream_call() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let mock = Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = hits2.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::OK, ANTHROPIC_BODY)
            }
        }),
    );
    let base = spawn_upstream(mock).await;

    let tmp = tempfile::tempdir().expect("tempdir");
    let state = test_state(tmp.path(), &base);
    state.usage.record("openai", "gpt-4o", 340_000, 0); // $0.85 this month
    let app = build_router(state);
    post_json(&app, "/api/budget", r#"{"monthlyLimit": 0.5}"#).await;

    let (status, body) = post_json(&app, "/anthropic/v1/messages", "{}").await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "monthly_budget_exceeded");
    assert_eq!(body["blocked"], true);
    assert_eq!(body["monthly"]["limit"], 0.5);
    assert!((body["monthly"]["spent"].as_f64().unwrap() - 0.85).abs() < 1e-9);
    assert_eq!(body["retryAfter"], "2026-03-01T00:00:00+00:00");
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // The blocked request was never recorded either.
    let (_, stats) = get_json(&app, "/stats").await;
    assert_eq!(stats["requests"], 1);
}
