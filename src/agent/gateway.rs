use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::budget::{warning_level, BudgetError, BudgetLimitsUpdate, BudgetStore, WarningLevel};
use super::pricing;
use super::upstream::{ForwardedResponse, Provider, UpstreamClient};
use super::usage::UsageStore;

/// Upper bound on a buffered request body. Bodies are held in memory in full
/// so content-length can be recomputed before forwarding.
const MAX_PROXY_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct GatewayState {
    pub usage: UsageStore,
    pub budget: BudgetStore,
    pub upstream: UpstreamClient,
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/reset", post(reset))
        .route("/api/budget", get(budget_status).post(budget_update))
        .route("/api/budget/check", get(budget_check))
        .route("/anthropic/*path", any(proxy_anthropic))
        .route("/openai/*path", any(proxy_openai))
        .fallback(not_found)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: GatewayState) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutting down");
        })
        .await?;
    Ok(())
}

/// The dashboard is a browser app on another origin, so every response
/// carries permissive CORS headers and any preflight gets an empty 204.
async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        append_cors_headers(&mut resp);
        return resp;
    }
    let mut resp = next.run(req).await;
    append_cors_headers(&mut resp);
    resp
}

fn append_cors_headers(resp: &mut Response) {
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "agentcost-local-agent",
        "privacy": "Content is never logged or stored. Only token counts are tracked.",
        "endpoints": {
            "stats": "/stats",
            "budget": "/api/budget",
            "budgetCheck": "/api/budget/check?model=<model>&estimatedTokens=<tokens>",
        },
        "proxy": {
            "anthropic": "/anthropic/v1/messages",
            "openai": "/openai/v1/chat/completions",
        }
    }))
}

async fn stats(State(st): State<GatewayState>) -> impl IntoResponse {
    Json(st.usage.load())
}

async fn reset(State(st): State<GatewayState>) -> Response {
    match st.usage.reset() {
        Ok(()) => Json(json!({"ok": true, "message": "Stats reset"})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Reset failed", "details": e.to_string()})),
        )
            .into_response(),
    }
}

async fn budget_status(State(st): State<GatewayState>) -> impl IntoResponse {
    Json(st.budget.status(&st.usage))
}

async fn budget_update(State(st): State<GatewayState>, body: Bytes) -> Response {
    let update: BudgetLimitsUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid JSON", "details": e.to_string()})),
            )
                .into_response()
        }
    };
    match st.budget.set_limits(&update) {
        Ok(_) => Json(st.budget.status(&st.usage)).into_response(),
        Err(e @ BudgetError::NonPositiveLimit(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BudgetCheckParams {
    model: Option<String>,
    estimated_tokens: Option<u64>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BudgetCheckResponse {
    allowed: bool,
    blocked: bool,
    within_budget: bool,
    warning_level: WarningLevel,
    estimated_cost: f64,
    daily: super::budget::PeriodStatus,
    monthly: super::budget::PeriodStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggested_model: Option<&'static str>,
}

/// Read-only pre-flight projection: would this request fit the budget, and
/// is there a cheaper model worth suggesting? Mutates nothing.
async fn budget_check(
    State(st): State<GatewayState>,
    Query(params): Query<BudgetCheckParams>,
) -> Response {
    let Some(model) = params.model.filter(|m| !m.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "model parameter required"})),
        )
            .into_response();
    };

    let estimated = params.estimated_tokens.unwrap_or(0);
    let mut input_tokens = params.input_tokens.unwrap_or(0);
    let mut output_tokens = params.output_tokens.unwrap_or(0);
    if estimated > 0 && input_tokens == 0 && output_tokens == 0 {
        // Only a total was given; assume an even prompt/completion split.
        input_tokens = estimated / 2;
        output_tokens = estimated - estimated / 2;
    }

    let estimated_cost = pricing::estimate_cost(&model, input_tokens, output_tokens);
    let status = st.budget.status(&st.usage);
    let level = warning_level(&status);
    let blocked = level == WarningLevel::Blocked;
    let within_budget = !blocked
        && (status.daily.limit.is_none()
            || status.daily.remaining.unwrap_or(0.0) >= estimated_cost);

    let warning = match level {
        WarningLevel::Blocked => Some("Monthly budget exceeded".to_string()),
        WarningLevel::Exceeded => Some("Daily budget exceeded".to_string()),
        WarningLevel::High => Some(format!(
            "Daily budget at {}%",
            status.daily.percent_used.unwrap_or(0.0).round() as i64
        )),
        WarningLevel::None => None,
    };
    let suggested_model = if level == WarningLevel::None {
        None
    } else {
        pricing::suggest_downgrade(&model)
    };

    Json(BudgetCheckResponse {
        allowed: !blocked && within_budget,
        blocked,
        within_budget,
        warning_level: level,
        estimated_cost,
        daily: status.daily,
        monthly: status.monthly,
        warning,
        suggested_model,
    })
    .into_response()
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({"error": "Not found"})))
}

async fn proxy_anthropic(State(st): State<GatewayState>, req: Request) -> Response {
    proxy(st, Provider::Anthropic, req).await
}

async fn proxy_openai(State(st): State<GatewayState>, req: Request) -> Response {
    proxy(st, Provider::OpenAi, req).await
}

/// One proxied exchange: budget gate, buffer, forward, extract usage, relay.
///
/// Request and response content pass through memory only. Nothing below
/// logs, parses (beyond the `usage` field) or persists bodies or headers.
async fn proxy(st: GatewayState, provider: Provider, req: Request) -> Response {
    // Hard gate: once the monthly budget is exhausted, no upstream call is
    // made at all.
    if let Some(block) = st.budget.check_monthly(&st.usage) {
        log::info!(
            "blocked {} request: monthly budget exceeded (${:.2}/${:.2})",
            provider.as_str(),
            block.monthly.spent,
            block.monthly.limit
        );
        return (StatusCode::PAYMENT_REQUIRED, Json(block)).into_response();
    }

    let req_id = Uuid::new_v4();
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let upstream_path = path_and_query
        .strip_prefix(provider.route_prefix())
        .unwrap_or(path_and_query);

    let body = match axum::body::to_bytes(body, MAX_PROXY_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Failed to read request body", "details": e.to_string()})),
            )
                .into_response()
        }
    };

    log::debug!(
        "[{req_id}] -> {} {} {} ({} bytes)",
        provider.as_str(),
        parts.method,
        upstream_path,
        body.len()
    );

    match st
        .upstream
        .forward(provider, parts.method, upstream_path, &parts.headers, body)
        .await
    {
        Ok(forwarded) => {
            log::debug!(
                "[{req_id}] <- {} ({} bytes)",
                forwarded.status,
                forwarded.body.len()
            );
            record_usage_if_present(&st, provider, &forwarded.body);
            relay(forwarded)
        }
        Err(e) => {
            // Short diagnostic only; request content never appears in logs.
            log::warn!("[{req_id}] upstream {} error: {e}", provider.as_str());
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "Proxy error", "details": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Best-effort usage extraction. Streaming chunks, error payloads and other
/// bodies without a parseable `usage` field are skipped silently; that is
/// expected traffic, not an error. The parsed document is dropped as soon as
/// the counts are out.
fn record_usage_if_present(st: &GatewayState, provider: Provider, body: &Bytes) {
    let Some((model, input_tokens, output_tokens)) = extract_usage(body) else {
        return;
    };
    st.usage
        .record(provider.as_str(), &model, input_tokens, output_tokens);
}

/// Accepts both Anthropic (`input_tokens`/`output_tokens`) and OpenAI
/// (`prompt_tokens`/`completion_tokens`) field naming; missing counts are 0.
fn extract_usage(body: &Bytes) -> Option<(String, u64, u64)> {
    let v: Value = serde_json::from_slice(body).ok()?;
    let usage = v.get("usage").filter(|u| !u.is_null())?;
    let model = v
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown")
        .to_string();
    let input_tokens = usage
        .get("input_tokens")
        .or_else(|| usage.get("prompt_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);
    let output_tokens = usage
        .get("output_tokens")
        .or_else(|| usage.get("completion_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);
    Some((model, input_tokens, output_tokens))
}

/// Relay the upstream response unmodified: original status, headers and the
/// exact body bytes. Only message-framing headers are dropped since the body
/// is re-framed from the buffer.
fn relay(forwarded: ForwardedResponse) -> Response {
    let ForwardedResponse {
        status,
        headers,
        body,
    } = forwarded;
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    let out = resp.headers_mut();
    for (name, value) in &headers {
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    resp
}
