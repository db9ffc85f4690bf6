use std::path::Path;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use crate::agent::budget::BudgetStore;
use crate::agent::clock;
use crate::agent::config::UpstreamConfig;
use crate::agent::gateway::GatewayState;
use crate::agent::upstream::UpstreamClient;
use crate::agent::usage::UsageStore;

/// A Saturday mid-month, mid-day; far from day/month boundaries.
pub const TEST_NOW: &str = "2026-02-14T12:00:00+00:00";

/// Gateway state with a pinned clock, stores in `dir`, and both providers
/// pointed at `upstream_base`.
pub fn test_state(dir: &Path, upstream_base: &str) -> GatewayState {
    let clk = clock::fixed(TEST_NOW);
    let upstreams = UpstreamConfig {
        anthropic_base_url: upstream_base.to_string(),
        openai_base_url: upstream_base.to_string(),
    };
    GatewayState {
        usage: UsageStore::open(dir.join("usage-data.json"), clk.clone()),
        budget: BudgetStore::open(dir.join("budget-config.json"), clk),
        upstream: UpstreamClient::new(&upstreams, 5),
    }
}

/// Serve a mock upstream on an ephemeral port; returns its base URL.
pub async fn spawn_upstream(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

pub async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

pub async fn body_bytes(resp: Response) -> bytes::Bytes {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let resp = send(
        app,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await;
    let status = resp.status();
    let bytes = body_bytes(resp).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

pub async fn post_json(app: &Router, uri: &str, body: &str) -> (StatusCode, Value) {
    let resp = send(
        app,
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    let status = resp.status();
    let bytes = body_bytes(resp).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}
