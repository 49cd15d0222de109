//! Request-pipeline middleware: universal rate limiting, path-traversal
//! defense, demo-mode read-only gate and security headers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

use super::net;
use crate::Error;
use crate::auth::is_state_changing;
use crate::server::router::AppState;

/// Paths that stay writable in demo mode so visitors can log in and out.
const DEMO_WRITABLE: &[&str] = &["/api/login", "/api/logout"];

/// Outer guard: universal rate limit, raw-path traversal check, demo-mode
/// write gate.
pub async fn guard_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    // Universal limiter
    if let Some(ref limiter) = state.global_limiter {
        if limiter.check().is_err() {
            return Error::RateLimited.into_response();
        }
    }

    // Raw path traversal: fail fast before any routing
    if path.contains("..") {
        warn!(path = %path, "Path traversal attempt");
        if path.starts_with("/api") {
            return Error::Unauthorized.into_response();
        }
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"error": "invalid_path"})),
        )
            .into_response();
    }

    // Demo mode: reads only
    if state.config.security.demo_mode
        && is_state_changing(request.method())
        && !DEMO_WRITABLE.contains(&path.as_str())
    {
        return Error::DemoReadOnly.into_response();
    }

    next.run(request).await
}

/// Per-client-IP limiter for the public install/download/login endpoints.
pub async fn public_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|c| c.0.ip());
    let key = net::client_ip(request.headers(), peer, &state.trusted)
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());

    if state.public_limiter.check_key(&key).is_err() {
        warn!(client = %key, path = %request.uri().path(), "Public endpoint rate limited");
        return Error::RateLimited.into_response();
    }

    next.run(request).await
}

/// Security headers on every response; HSTS only over secure connections,
/// frame policy from the embedding config.
pub async fn security_headers(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let secure = net::is_connection_secure(state.tls_enabled, request.headers());

    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    let embedding = &state.config.security;
    if embedding.allow_embedding {
        let ancestors = if embedding.allowed_embed_origins.is_empty() {
            "'self'".to_string()
        } else {
            embedding.allowed_embed_origins.join(" ")
        };
        if let Ok(value) =
            HeaderValue::from_str(&format!("frame-ancestors {ancestors}"))
        {
            headers.insert(header::CONTENT_SECURITY_POLICY, value);
        }
    } else {
        headers.insert(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("frame-ancestors 'none'"),
        );
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    }

    if secure {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }

    response
}
