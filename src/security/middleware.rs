use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::metrics::BlockReason;
use crate::models::RateLimitError;
use crate::state::AppState;

/// Requests slower than this get a log line
const SLOW_REQUEST: Duration = Duration::from_secs(1);

/// Probes that must never count against a client's quota
const UNMETERED_PATHS: &[&str] = &["/api/health", "/metrics"];

/// Security context extracted from request
#[derive(Clone, Debug)]
pub struct SecurityContext {
    pub client_id: String,
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket address.
pub fn client_id_from(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header_value("x-forwarded-for").and_then(|v| v.split(',').next()) {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(real_ip) = header_value("x-real-ip") {
        return real_ip.to_string();
    }
    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware that resolves the client identifier and times the request
pub async fn client_identity_middleware(mut req: Request, next: Next) -> Response {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_id = client_id_from(req.headers(), remote);

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(SecurityContext {
        client_id: client_id.clone(),
    });

    let started = Instant::now();
    let response = next.run(req).await;
    let elapsed = started.elapsed();

    if elapsed > SLOW_REQUEST {
        tracing::info!(
            client = %client_id,
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "slow request"
        );
    }
    response
}

/// Middleware that answers known-malicious requests with a bare 404
pub async fn pattern_gate_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if state.pattern_gate.is_allowed_path(path) {
        return next.run(req).await;
    }

    let client_id = client_of(&req);
    let query = req.uri().query().unwrap_or("");
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let result = state.pattern_gate.evaluate(path, user_agent, query);
    if result.is_malicious {
        tracing::warn!(
            client = %client_id,
            reason = %result.reason,
            target = ?result.target,
            "blocked malicious request"
        );
        tracing::info!(
            client = %client_id,
            method = %req.method(),
            path = %path,
            query = %query,
            user_agent = %user_agent,
            "blocked request details"
        );
        state.metrics.record_blocked(BlockReason::MaliciousPattern);
        return (StatusCode::NOT_FOUND, Json(json!({"error": "Not found"}))).into_response();
    }

    if state.pattern_gate.is_suspicious(path) {
        tracing::info!(client = %client_id, path = %path, "suspicious but allowed");
    }

    next.run(req).await
}

/// Middleware applying the per-client sliding window
pub async fn rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if UNMETERED_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    let client_id = client_of(&req);
    let now = state.clock.now();
    let result = state.rate_limiter.check_rate_limit(&client_id, now);

    if !result.allowed {
        let retry_after = result.retry_after_seconds(now);
        tracing::warn!(client = %client_id, retry_after, "rate limit exceeded");
        state.metrics.record_blocked(BlockReason::RateLimited);

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(RateLimitError::new(retry_after))).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert("x-ratelimit-remaining", HeaderValue::from(result.remaining));
    response
}

fn client_of(req: &Request) -> String {
    req.extensions()
        .get::<SecurityContext>()
        .map(|ctx| ctx.client_id.clone())
        .unwrap_or_else(|| "unknown".to_string())
}
