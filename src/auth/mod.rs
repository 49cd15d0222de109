//! Authentication gate and its credential substrate.
//!
//! Every request passes through [`auth_middleware`], which classifies the
//! caller into an [`Identity`] and attaches it to request extensions.
//! Downstream gates ([`require_admin`], [`require_scope`]) consume that
//! value instead of re-parsing headers.
//!
//! Accepted credentials, in precedence order:
//!
//! 1. `pulse_session` cookie mapping to a live session (OIDC sessions are
//!    transparently refreshed near expiry)
//! 2. `X-API-Token` or `Authorization: Bearer` matching a registry record
//! 3. `X-Proxy-Secret` matching the configured front-proxy secret, with
//!    identity and roles from configured headers
//! 4. HTTP Basic credentials against the local admin hash
//! 5. Recovery bypass: `.auth_recovery` flag present and the request is a
//!    direct loopback

pub mod audit;
pub mod csrf;
pub mod handlers;
pub mod lockout;
pub mod oidc;
pub mod recovery;
pub mod session;
pub mod tokens;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Method, Request, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::ProxyAuthConfig;
use crate::server::net::{self, RequestMeta};
use crate::server::router::AppState;
use crate::{Error, Result};

use audit::AuditEvent;
use tokens::{Scope, ValidatedToken};

/// Session cookie name.
pub const SESSION_COOKIE: &str = "pulse_session";
/// CSRF cookie name (non-HttpOnly so the SPA can echo it as a header).
pub const CSRF_COOKIE: &str = "pulse_csrf";
/// CSRF header name.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Who the caller is, as decided by the gate.
#[derive(Debug, Clone)]
pub enum Identity {
    /// No accepted credential
    Unauthenticated,
    /// Password-established session
    LocalSession {
        /// Session owner
        username: String,
    },
    /// OIDC-established session
    OidcSession {
        /// Session owner
        username: String,
    },
    /// Scoped API token
    ApiToken(ValidatedToken),
    /// Front-proxy asserted identity
    ProxyAuth {
        /// Asserted username
        username: String,
        /// Derived from the roles header
        is_admin: bool,
    },
    /// HTTP Basic against the local admin
    Basic {
        /// Authenticated username
        username: String,
    },
    /// Loopback recovery bypass
    Recovery,
    /// First-run bootstrap token, before any admin exists
    Bootstrap,
}

impl Identity {
    /// Whether any credential was accepted.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Unauthenticated)
    }

    /// `X-Auth-Method` value for this identity.
    #[must_use]
    pub fn method(&self) -> Option<&'static str> {
        match self {
            Self::Unauthenticated => None,
            Self::LocalSession { .. } => Some("session"),
            Self::OidcSession { .. } => Some("oidc"),
            Self::ApiToken(_) => Some("api-token"),
            Self::ProxyAuth { .. } => Some("proxy"),
            Self::Basic { .. } => Some("basic"),
            Self::Recovery => Some("recovery"),
            Self::Bootstrap => Some("bootstrap"),
        }
    }

    /// Username, when the identity carries one.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        match self {
            Self::LocalSession { username }
            | Self::OidcSession { username }
            | Self::ProxyAuth { username, .. }
            | Self::Basic { username } => Some(username),
            Self::ApiToken(token) => Some(&token.record.name),
            _ => None,
        }
    }
}

/// Error unless some credential was accepted.
pub fn require_auth(identity: &Identity) -> Result<()> {
    if identity.is_authenticated() {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

/// Whether the identity carries admin rights.
#[must_use]
pub fn is_admin(identity: &Identity, admin_user: &str) -> bool {
    match identity {
        Identity::LocalSession { username }
        | Identity::OidcSession { username }
        | Identity::Basic { username } => username == admin_user,
        Identity::ProxyAuth { is_admin, .. } => *is_admin,
        Identity::ApiToken(token) => token.has_scope(Scope::SettingsWrite),
        Identity::Recovery => true,
        // Bootstrap only authorizes first-run provisioning, never admin APIs
        Identity::Bootstrap | Identity::Unauthenticated => false,
    }
}

/// Error unless the identity is an admin.
pub fn require_admin(identity: &Identity, admin_user: &str) -> Result<()> {
    require_auth(identity)?;
    if is_admin(identity, admin_user) {
        Ok(())
    } else {
        Err(Error::Forbidden("Admin access required".to_string()))
    }
}

/// Scope gate: API tokens need the scope itself; admin identities pass.
pub fn require_scope(identity: &Identity, scope: Scope, admin_user: &str) -> Result<()> {
    require_auth(identity)?;
    match identity {
        Identity::ApiToken(token) => token.require_scope(scope),
        other if is_admin(other, admin_user) => Ok(()),
        _ => Err(Error::MissingScope(scope.as_str().to_string())),
    }
}

/// Whether this method mutates state (and therefore needs CSRF for
/// session-authenticated callers).
#[must_use]
pub fn is_state_changing(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Paths exempt from CSRF: they either precede session establishment or
/// authenticate with alternative credentials.
const CSRF_EXEMPT: &[&str] = &[
    "/api/login",
    "/api/security/validate-bootstrap-token",
    "/api/security/quick-setup",
    "/api/setup-script-url",
];

fn csrf_exempt(path: &str) -> bool {
    CSRF_EXEMPT.contains(&path)
}

/// API paths that never require authentication. Everything outside `/api`
/// is frontend surface and public so the SPA can render the login page.
const PUBLIC_API_PATHS: &[&str] = &[
    "/api/health",
    "/api/version",
    "/api/server-info",
    "/api/login",
    "/api/oidc/login",
    "/api/oidc/callback",
    "/api/security/status",
    "/api/security/validate-bootstrap-token",
    "/api/security/quick-setup",
    "/api/security/recovery",
    "/api/setup-script",
    "/api/auto-register",
];

/// Whether `path` may be served without authentication.
#[must_use]
pub fn is_public_path(path: &str) -> bool {
    if !path.starts_with("/api") {
        // Frontend routes, install scripts, downloads
        return true;
    }
    PUBLIC_API_PATHS.contains(&path)
}

/// Front-proxy check per the configured secret and headers.
///
/// Returns `(username, is_admin)` when the shared secret matches in constant
/// time. When a user header is configured it must be non-empty. Role tokens
/// are split on the configured separator and trimmed before comparison.
#[must_use]
pub fn check_proxy_auth(
    config: &ProxyAuthConfig,
    headers: &HeaderMap,
) -> Option<(String, bool)> {
    let secret = config.resolve_secret()?;
    if secret.is_empty() {
        return None;
    }

    let presented = headers.get("x-proxy-secret")?.to_str().ok()?;
    if !bool::from(presented.as_bytes().ct_eq(secret.as_bytes())) {
        return None;
    }

    let username = if config.user_header.is_empty() {
        "proxy".to_string()
    } else {
        let value = headers
            .get(config.user_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or("");
        if value.is_empty() {
            return None;
        }
        value.to_string()
    };

    let is_admin = config.roles_header.as_deref().is_some_and(|header| {
        headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|roles| {
                roles
                    .split(&config.role_separator)
                    .map(str::trim)
                    .any(|role| role == config.admin_role)
            })
    });

    Some((username, is_admin))
}

/// The gate middleware: classify the caller, enforce CSRF for sessions,
/// reject unauthenticated access to non-public paths, and stamp identity
/// headers on the response.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let headers = request.headers().clone();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    let meta = net::request_meta(&headers, peer, state.tls_enabled, &state.trusted);
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    // Recovery bypass: flag file + direct loopback skips everything else
    if state.recovery.recovery_active() && meta.direct_loopback {
        request.extensions_mut().insert(meta);
        request.extensions_mut().insert(Identity::Recovery);
        let mut response = next.run(request).await;
        response
            .headers_mut()
            .insert("x-auth-recovery", HeaderValue::from_static("true"));
        stamp_identity(&mut response, &Identity::Recovery);
        return response;
    }

    let identity = match authenticate(&state, &headers, &meta).await {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };

    // CSRF: state-changing session-authenticated calls must echo the token.
    // API-token and proxy callers are exempt by construction.
    if matches!(
        identity,
        Identity::LocalSession { .. } | Identity::OidcSession { .. }
    ) && is_state_changing(&method)
        && !csrf_exempt(&path)
    {
        let session_hash = net::parse_cookie(&headers, SESSION_COOKIE)
            .map(|token| session::hash_token(&token))
            .unwrap_or_default();
        let presented = headers
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if !state.csrf.verify(&session_hash, presented) {
            AuditEvent::new("auth.csrf_rejected", false)
                .actor(identity.username().unwrap_or("unknown"))
                .client_ip(meta.client_ip)
                .path(&path)
                .emit();
            warn!(path = %path, "CSRF verification failed");
            return Error::Forbidden("CSRF token missing or invalid".to_string()).into_response();
        }
    }

    if !identity.is_authenticated() && !is_public_path(&path) {
        debug!(path = %path, "Rejecting unauthenticated request");
        return Error::Unauthorized.into_response();
    }

    // Teach the public-URL detector from qualified requests
    state
        .public_url
        .observe(&headers, &meta, identity.is_authenticated());

    // Auto-issue the CSRF cookie on authenticated session GETs
    let issue_csrf = method == Method::GET
        && matches!(
            identity,
            Identity::LocalSession { .. } | Identity::OidcSession { .. }
        )
        && net::parse_cookie(&headers, CSRF_COOKIE).is_none();

    let cookie_attrs = net::cookie_settings(meta.secure, meta.proxied);
    let session_hash =
        net::parse_cookie(&headers, SESSION_COOKIE).map(|token| session::hash_token(&token));

    request.extensions_mut().insert(meta);
    request.extensions_mut().insert(identity.clone());
    let mut response = next.run(request).await;

    if issue_csrf {
        if let Some(hash) = session_hash {
            let token = state.csrf.issue(&hash);
            if let Ok(value) = HeaderValue::from_str(&net::build_cookie(
                CSRF_COOKIE,
                &token,
                None,
                cookie_attrs,
                false,
            )) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
    }

    stamp_identity(&mut response, &identity);
    response
}

/// Run the credential chain. `Err` is returned only for lockout rejections;
/// ordinary failures fall through to `Unauthenticated`.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    meta: &RequestMeta,
) -> Result<Identity> {
    // 1. Session cookie
    if let Some(token) = net::parse_cookie(headers, SESSION_COOKIE) {
        if let Some(record) = state
            .sessions
            .validate(&token, state.refresher.as_ref())
            .await
        {
            return Ok(match record.kind {
                session::SessionKind::Local => Identity::LocalSession {
                    username: record.username,
                },
                session::SessionKind::Oidc => Identity::OidcSession {
                    username: record.username,
                },
            });
        }
    }

    // 2. API token header or bearer
    if let Some(presented) = api_token_from_headers(headers) {
        if let Some(validated) = state.tokens.validate(&presented).await {
            return Ok(Identity::ApiToken(validated));
        }
        debug!("Presented API token did not match any record");
    }

    // 3. Front proxy
    if let Some((username, is_admin)) = check_proxy_auth(&state.config.auth.proxy, headers) {
        return Ok(Identity::ProxyAuth { username, is_admin });
    }

    // 4. HTTP Basic against the local admin
    if let Some((username, password)) = basic_credentials(headers) {
        let ip = meta
            .client_ip
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());

        if let Some(until) = state.lockout.check(&username, &ip) {
            let remaining = (until - chrono::Utc::now()).num_minutes().max(0) + 1;
            return Err(Error::Locked {
                locked_until: until,
                remaining_minutes: remaining,
            });
        }

        if state.verify_admin_password(&username, &password).await {
            state.lockout.record_success(&username, &ip);
            return Ok(Identity::Basic { username });
        }

        state.lockout.record_failure_pair(&username, &ip);
        AuditEvent::new("auth.login", false)
            .actor(&username)
            .client_ip(meta.client_ip)
            .detail("basic auth failure")
            .emit();
    }

    // 5. Bootstrap token, only while first-run provisioning is pending
    if state.recovery.bootstrap_pending() {
        if let Some(token) = headers.get("x-bootstrap-token").and_then(|v| v.to_str().ok()) {
            if state.recovery.bootstrap_matches(token) {
                return Ok(Identity::Bootstrap);
            }
        }
    }

    Ok(Identity::Unauthenticated)
}

/// Pull an API token out of `X-API-Token` or `Authorization: Bearer`.
#[must_use]
pub fn api_token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers.get("x-api-token").and_then(|v| v.to_str().ok()) {
        return Some(token.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::to_string)
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn stamp_identity(response: &mut Response, identity: &Identity) {
    if let Some(method) = identity.method() {
        if let Ok(value) = HeaderValue::from_str(method) {
            response.headers_mut().insert("x-auth-method", value);
        }
    }
    if let Some(username) = identity.username() {
        if let Ok(value) = HeaderValue::from_str(username) {
            response.headers_mut().insert("x-authenticated-user", value);
        }
    }
}
