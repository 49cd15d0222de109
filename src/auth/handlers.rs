//! HTTP handlers for login, session lifecycle and security administration.
//!
//! # Endpoints
//!
//! | Method | Path | Auth |
//! |--------|------|------|
//! | `POST` | `/api/login` | public |
//! | `POST` | `/api/logout` | session |
//! | `GET`  | `/api/state` | any credential |
//! | `GET`  | `/api/security/status` | public (masked when unauthenticated) |
//! | `POST` | `/api/security/quick-setup` | bootstrap token or admin session |
//! | `POST` | `/api/security/validate-bootstrap-token` | public |
//! | `POST` | `/api/security/recovery` | loopback or recovery token |
//! | `GET/POST` | `/api/security/tokens` | admin + `settings:write` |
//! | `DELETE` | `/api/security/tokens/{id}` | admin + `settings:write` |
//! | `POST` | `/api/security/reset-lockout` | admin |
//! | `POST` | `/api/security/change-password` | session |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::audit::AuditEvent;
use super::tokens::Scope;
use super::{CSRF_COOKIE, Identity, SESSION_COOKIE, require_admin, require_auth, require_scope};
use crate::config::oidc_env_overrides;
use crate::server::net::{self, RequestMeta};
use crate::server::router::AppState;
use crate::{Error, Result};

// ── Request bodies ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginRequest {
    username: String,
    password: String,
    #[serde(default)]
    remember_me: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QuickSetupRequest {
    #[serde(default)]
    bootstrap_token: Option<String>,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BootstrapValidateRequest {
    token: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RecoveryRequest {
    enable: bool,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateTokenRequest {
    name: String,
    #[serde(default)]
    scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResetLockoutRequest {
    identifier: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

// ── Session establishment ─────────────────────────────────────────────────

/// `POST /api/login` — password login; sets session and CSRF cookies.
pub(crate) async fn login(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Response {
    let ip = meta
        .client_ip
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());

    if body.username.is_empty() {
        return Error::validation("invalid_username", "Username is required").into_response();
    }

    if let Some(until) = state.lockout.check(&body.username, &ip) {
        let remaining = (until - chrono::Utc::now()).num_minutes().max(0) + 1;
        AuditEvent::new("auth.login", false)
            .actor(&body.username)
            .client_ip(meta.client_ip)
            .detail("locked out")
            .emit();
        return Error::Locked {
            locked_until: until,
            remaining_minutes: remaining,
        }
        .into_response();
    }

    if !state
        .verify_admin_password(&body.username, &body.password)
        .await
    {
        let info = state.lockout.record_failure_pair(&body.username, &ip);
        AuditEvent::new("auth.login", false)
            .actor(&body.username)
            .client_ip(meta.client_ip)
            .detail("bad credentials")
            .emit();

        // The attempt that trips the threshold still answers 401; the 403
        // with lockout detail starts on the next attempt.
        if info.locked {
            AuditEvent::new("auth.lockout", true)
                .actor(&body.username)
                .client_ip(meta.client_ip)
                .emit();
        }

        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Authentication required",
                "remaining": state.lockout.remaining(&body.username),
            })),
        )
            .into_response();
    }

    state.lockout.record_success(&body.username, &ip);

    let ttl = if body.remember_me {
        state.config.auth.remember_me_ttl
    } else {
        state.config.auth.session_ttl
    };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = super::session::generate_session_token();
    let record = state
        .sessions
        .create(&token, ttl, user_agent, &ip, &body.username);
    let csrf_token = state.csrf.issue(&record.hash);

    AuditEvent::new("auth.login", true)
        .actor(&body.username)
        .client_ip(meta.client_ip)
        .emit();
    info!(user = %body.username, "login success");

    let mut response = (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "username": body.username,
            "csrfToken": csrf_token,
        })),
    )
        .into_response();

    set_session_cookies(&mut response, &meta, &token, &csrf_token, ttl.as_secs());
    response
}

/// `POST /api/logout` — delete the session and clear cookies.
pub(crate) async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
) -> Result<Response> {
    require_auth(&identity)?;

    if let Some(token) = net::parse_cookie(&headers, SESSION_COOKIE) {
        if let Some(record) = state.sessions.delete(&token) {
            state.csrf.remove(&record.hash);
            AuditEvent::new("auth.logout", true)
                .actor(&record.username)
                .client_ip(meta.client_ip)
                .emit();
        }
    }

    let attrs = net::cookie_settings(meta.secure, meta.proxied);
    let mut response = (StatusCode::OK, Json(json!({"success": true}))).into_response();
    append_cookie(&mut response, &net::clear_cookie(SESSION_COOKIE, attrs));
    append_cookie(&mut response, &net::clear_cookie(CSRF_COOKIE, attrs));
    Ok(response)
}

/// `GET /api/state` — minimal authenticated state echo.
pub(crate) async fn api_state(
    Extension(identity): Extension<Identity>,
) -> Result<Json<serde_json::Value>> {
    require_auth(&identity)?;
    Ok(Json(json!({
        "authenticated": true,
        "username": identity.username(),
        "method": identity.method(),
    })))
}

// ── Security administration ───────────────────────────────────────────────

/// `GET /api/security/status` — capability summary. Sensitive fields are
/// masked for unauthenticated callers; env-override booleans are public so
/// the login page can render correctly.
pub(crate) async fn security_status(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Json<serde_json::Value> {
    let authed = identity.is_authenticated();
    let admin_configured = state.admin_configured().await;

    let mut status = json!({
        "authConfigured": admin_configured,
        "bootstrapPending": state.recovery.bootstrap_pending(),
        "oidcConfigured": state.config.auth.oidc.is_some(),
        "oidcEnvOverrides": oidc_env_overrides(),
        "proxyAuthConfigured": state.config.auth.proxy.resolve_secret().is_some(),
        "demoMode": state.config.security.demo_mode,
        "recoveryActive": state.recovery.recovery_active(),
    });

    if authed {
        if let Some(obj) = status.as_object_mut() {
            obj.insert("adminUser".to_string(), json!(state.admin_username().await));
            obj.insert(
                "maxFailedAttempts".to_string(),
                json!(state.config.security.max_failed_attempts),
            );
            obj.insert(
                "lockoutMinutes".to_string(),
                json!(state.config.security.lockout_duration.as_secs() / 60),
            );
        }
    }

    Json(status)
}

/// `POST /api/security/quick-setup` — first-run admin provisioning.
pub(crate) async fn quick_setup(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
    Json(body): Json<QuickSetupRequest>,
) -> Result<Response> {
    validate_username(&body.username)?;
    validate_password(&body.password)?;

    let admin_user = state.admin_username().await;
    let via_session = identity.is_authenticated()
        && !matches!(identity, Identity::Bootstrap)
        && super::is_admin(&identity, &admin_user);

    if !via_session {
        // Bootstrap path: the token comes from the body or the header the
        // gate already matched, and is consumed atomically here.
        let header_token = headers
            .get("x-bootstrap-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(token) = body.bootstrap_token.clone().or(header_token) else {
            return Err(Error::Unauthorized);
        };
        state.recovery.consume_bootstrap(&token)?;
    }

    let hash = bcrypt::hash(&body.password, 10)
        .map_err(|e| Error::Internal(format!("Password hashing failed: {e}")))?;

    let username = body.username.clone();
    state
        .store
        .update(move |config| {
            config.admin = Some(crate::persist::nodes::AdminAccount {
                username,
                password_hash: hash,
            });
            Ok(())
        })
        .await?;

    AuditEvent::new("auth.password_changed", true)
        .actor(&body.username)
        .client_ip(meta.client_ip)
        .detail("quick-setup provisioned admin")
        .emit();

    // Log the new admin straight in
    let token = super::session::generate_session_token();
    let ip = meta
        .client_ip
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
    let record = state.sessions.create(
        &token,
        state.config.auth.session_ttl,
        "",
        &ip,
        &body.username,
    );
    let csrf_token = state.csrf.issue(&record.hash);

    let mut response = (
        StatusCode::OK,
        Json(json!({"success": true, "username": body.username})),
    )
        .into_response();
    set_session_cookies(
        &mut response,
        &meta,
        &token,
        &csrf_token,
        state.config.auth.session_ttl.as_secs(),
    );
    Ok(response)
}

/// `POST /api/security/validate-bootstrap-token` — consume the bootstrap
/// token and establish a short setup session.
pub(crate) async fn validate_bootstrap_token(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    Json(body): Json<BootstrapValidateRequest>,
) -> Result<Response> {
    state.recovery.consume_bootstrap(&body.token)?;

    AuditEvent::new("auth.login", true)
        .actor("bootstrap")
        .client_ip(meta.client_ip)
        .detail("bootstrap token consumed")
        .emit();

    // Fifteen minutes to finish quick-setup
    let ttl = std::time::Duration::from_secs(15 * 60);
    let token = super::session::generate_session_token();
    let ip = meta
        .client_ip
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
    let admin_user = state.admin_username().await;
    let record = state.sessions.create(&token, ttl, "", &ip, &admin_user);
    let csrf_token = state.csrf.issue(&record.hash);

    let mut response = (StatusCode::OK, Json(json!({"valid": true}))).into_response();
    set_session_cookies(&mut response, &meta, &token, &csrf_token, ttl.as_secs());
    Ok(response)
}

/// `POST /api/security/recovery` — toggle recovery mode. Enabling requires a
/// direct loopback request; disabling also accepts a recovery token.
pub(crate) async fn recovery_toggle(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    Json(body): Json<RecoveryRequest>,
) -> Result<Json<serde_json::Value>> {
    let token_ok = body
        .token
        .as_deref()
        .is_some_and(|t| state.recovery.token_valid(t));

    if body.enable {
        if !meta.direct_loopback {
            return Err(Error::Forbidden(
                "Recovery mode can only be enabled from the local host".to_string(),
            ));
        }
        let recovery_token = state.recovery.enable_recovery()?;
        AuditEvent::new("auth.recovery", true)
            .client_ip(meta.client_ip)
            .detail("enabled")
            .emit();
        Ok(Json(json!({
            "enabled": true,
            "recoveryToken": recovery_token,
        })))
    } else {
        if !meta.direct_loopback && !token_ok {
            return Err(Error::Forbidden(
                "Disabling recovery requires loopback access or a recovery token".to_string(),
            ));
        }
        state.recovery.disable_recovery()?;
        AuditEvent::new("auth.recovery", true)
            .client_ip(meta.client_ip)
            .detail("disabled")
            .emit();
        Ok(Json(json!({"enabled": false})))
    }
}

// ── API tokens ────────────────────────────────────────────────────────────

/// `GET /api/security/tokens` — list records (hashes blanked).
pub(crate) async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<serde_json::Value>> {
    let admin_user = state.admin_username().await;
    require_admin(&identity, &admin_user)?;
    require_scope(&identity, Scope::SettingsWrite, &admin_user)?;

    let tokens = state.tokens.list().await;
    Ok(Json(json!({"tokens": tokens})))
}

/// `POST /api/security/tokens` — create a token; the plaintext appears in
/// this response and never again.
pub(crate) async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreateTokenRequest>,
) -> Result<Json<serde_json::Value>> {
    let admin_user = state.admin_username().await;
    require_admin(&identity, &admin_user)?;
    require_scope(&identity, Scope::SettingsWrite, &admin_user)?;

    let created = state.tokens.create(&body.name, &body.scopes).await?;

    AuditEvent::new("token.created", true)
        .actor(identity.username().unwrap_or("unknown"))
        .client_ip(meta.client_ip)
        .detail(format!("name={}", body.name))
        .emit();

    Ok(Json(json!({
        "id": created.record.id,
        "name": created.record.name,
        "scopes": created.record.scopes,
        "hint": created.record.hint,
        "token": created.plaintext,
    })))
}

/// `DELETE /api/security/tokens/{id}` — remove a token record.
pub(crate) async fn delete_token(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let admin_user = state.admin_username().await;
    require_admin(&identity, &admin_user)?;
    require_scope(&identity, Scope::SettingsWrite, &admin_user)?;

    let name = state.tokens.delete(&id).await?;

    AuditEvent::new("token.deleted", true)
        .actor(identity.username().unwrap_or("unknown"))
        .client_ip(meta.client_ip)
        .detail(format!("name={name}"))
        .emit();

    Ok(Json(json!({"success": true})))
}

// ── Lockout and password management ──────────────────────────────────────

/// `POST /api/security/reset-lockout` — admin clears counters for an
/// identifier (username or IP).
pub(crate) async fn reset_lockout(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<ResetLockoutRequest>,
) -> Result<Json<serde_json::Value>> {
    let admin_user = state.admin_username().await;
    require_admin(&identity, &admin_user)?;

    state.lockout.reset(&body.identifier);

    AuditEvent::new("auth.lockout_reset", true)
        .actor(identity.username().unwrap_or("unknown"))
        .client_ip(meta.client_ip)
        .detail(format!("identifier={}", body.identifier))
        .emit();

    Ok(Json(json!({"success": true})))
}

/// `POST /api/security/change-password` — rotate the local admin password
/// and invalidate the user's other sessions.
pub(crate) async fn change_password(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>> {
    let Identity::LocalSession { ref username } = identity else {
        return Err(Error::Forbidden(
            "Password change requires a password session".to_string(),
        ));
    };

    if !state
        .verify_admin_password(username, &body.current_password)
        .await
    {
        return Err(Error::validation(
            "invalid_password",
            "Current password is incorrect",
        ));
    }
    validate_password(&body.new_password)?;

    let hash = bcrypt::hash(&body.new_password, 10)
        .map_err(|e| Error::Internal(format!("Password hashing failed: {e}")))?;

    let user = username.clone();
    state
        .store
        .update(move |config| {
            config.admin = Some(crate::persist::nodes::AdminAccount {
                username: user,
                password_hash: hash,
            });
            Ok(())
        })
        .await?;

    // Other sessions of this user die; the current one stays
    if let Some(current) = net::parse_cookie(&headers, SESSION_COOKIE) {
        state.sessions.invalidate_user_except(username, &current);
    } else {
        state.sessions.invalidate_user(username);
    }

    AuditEvent::new("auth.password_changed", true)
        .actor(username)
        .client_ip(meta.client_ip)
        .emit();

    Ok(Json(json!({"success": true})))
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn validate_username(username: &str) -> Result<()> {
    if username.is_empty()
        || username.len() > 64
        || !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@'))
    {
        return Err(Error::validation(
            "invalid_username",
            "Usernames are 1-64 characters of letters, digits, '.', '-', '_' or '@'",
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<()> {
    if password.len() < 8 {
        return Err(Error::validation(
            "invalid_password",
            "Passwords must be at least 8 characters",
        ));
    }
    Ok(())
}

fn set_session_cookies(
    response: &mut Response,
    meta: &RequestMeta,
    session_token: &str,
    csrf_token: &str,
    max_age_secs: u64,
) {
    let attrs = net::cookie_settings(meta.secure, meta.proxied);
    append_cookie(
        response,
        &net::build_cookie(SESSION_COOKIE, session_token, Some(max_age_secs), attrs, true),
    );
    append_cookie(
        response,
        &net::build_cookie(CSRF_COOKIE, csrf_token, Some(max_age_secs), attrs, false),
    );
}

fn append_cookie(response: &mut Response, cookie: &str) {
    if let Ok(value) = axum::http::HeaderValue::from_str(cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_validation() {
        assert!(validate_username("admin").is_ok());
        assert!(validate_username("alice.smith@corp").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"x".repeat(65)).is_err());
    }

    #[test]
    fn password_validation() {
        assert!(validate_password("longenough").is_ok());
        assert!(validate_password("short").is_err());
    }
}

// ── OIDC login flow ───────────────────────────────────────────────────────

/// Cookie carrying the OAuth state parameter between start and callback.
const OIDC_STATE_COOKIE: &str = "pulse_oidc_state";

#[derive(Debug, serde::Deserialize)]
pub(crate) struct OidcCallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

/// `GET /api/oidc/login` — redirect to the issuer's authorization endpoint.
pub(crate) async fn oidc_login(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<Response> {
    let Some(ref oidc) = state.config.auth.oidc else {
        return Err(Error::Dependency("OIDC is not configured".to_string()));
    };

    let state_param = super::session::generate_session_token();
    let redirect_uri = oidc_redirect_uri(&state, &headers);

    let mut url = url::Url::parse(&oidc.authorization_endpoint)
        .map_err(|e| Error::Config(format!("Invalid authorization endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &oidc.client_id)
        .append_pair("redirect_uri", &redirect_uri)
        .append_pair("scope", &oidc.scopes.join(" "))
        .append_pair("state", &state_param);

    let attrs = net::cookie_settings(meta.secure, meta.proxied);
    let mut response =
        axum::response::Redirect::temporary(url.as_str()).into_response();
    append_cookie(
        &mut response,
        &net::build_cookie(OIDC_STATE_COOKIE, &state_param, Some(600), attrs, true),
    );
    Ok(response)
}

/// `GET /api/oidc/callback` — exchange the code, establish an OIDC session.
pub(crate) async fn oidc_callback(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    axum::extract::Query(query): axum::extract::Query<OidcCallbackQuery>,
) -> Result<Response> {
    let Some(ref client) = state.oidc else {
        return Err(Error::Dependency("OIDC is not configured".to_string()));
    };
    let Some(ref oidc_config) = state.config.auth.oidc else {
        return Err(Error::Dependency("OIDC is not configured".to_string()));
    };

    let code = query
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::validation("invalid_json", "code query parameter is required"))?;

    // CSRF binding between start and callback
    let expected_state = net::parse_cookie(&headers, OIDC_STATE_COOKIE);
    if expected_state.is_none() || expected_state.as_deref() != query.state.as_deref() {
        AuditEvent::new("auth.login", false)
            .client_ip(meta.client_ip)
            .detail("OIDC state mismatch")
            .emit();
        return Err(Error::Unauthorized);
    }

    let redirect_uri = oidc_redirect_uri(&state, &headers);
    let tokens = client.exchange_code(code, &redirect_uri).await.map_err(|e| {
        AuditEvent::new("auth.login", false)
            .client_ip(meta.client_ip)
            .detail(format!("OIDC code exchange failed: {e}"))
            .emit();
        Error::Unauthorized
    })?;

    let username = tokens
        .id_token
        .as_deref()
        .and_then(|t| {
            super::oidc::claim_from_id_token(t, &oidc_config.username_claim)
                .or_else(|| super::oidc::claim_from_id_token(t, "sub"))
        })
        .ok_or_else(|| Error::Internal("ID token carried no usable identity claim".to_string()))?;

    let ip = meta
        .client_ip
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = super::session::generate_session_token();
    let record = state.sessions.create_oidc(
        &token,
        state.config.auth.session_ttl,
        user_agent,
        &ip,
        &username,
        tokens,
    );
    let csrf_token = state.csrf.issue(&record.hash);

    AuditEvent::new("auth.login", true)
        .actor(&username)
        .client_ip(meta.client_ip)
        .detail("oidc")
        .emit();

    let attrs = net::cookie_settings(meta.secure, meta.proxied);
    let mut response = axum::response::Redirect::temporary("/").into_response();
    set_session_cookies(
        &mut response,
        &meta,
        &token,
        &csrf_token,
        state.config.auth.session_ttl.as_secs(),
    );
    append_cookie(&mut response, &net::clear_cookie(OIDC_STATE_COOKIE, attrs));
    Ok(response)
}

fn oidc_redirect_uri(state: &AppState, headers: &HeaderMap) -> String {
    let base = state.public_url.current().unwrap_or_else(|| {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost:7655");
        let scheme = if state.tls_enabled { "https" } else { "http" };
        format!("{scheme}://{host}")
    });
    format!("{base}/api/oidc/callback")
}
