//! HTTP handlers for the setup-script / auto-registration protocol.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use super::script::{ScriptParams, render_setup_script};
use super::setup_codes::SETUP_CODE_TTL;
use crate::auth::audit::AuditEvent;
use crate::auth::tokens::Scope;
use crate::auth::{Identity, require_admin, require_scope};
use crate::persist::nodes::NodeKind;
use crate::server::net::RequestMeta;
use crate::server::router::AppState;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetupScriptUrlRequest {
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    org_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SetupScriptQuery {
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    host: Option<String>,
}

/// `POST /api/setup-script-url` — issue a one-shot setup code and the
/// install command that embeds it.
pub(crate) async fn setup_script_url(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
    Json(body): Json<SetupScriptUrlRequest>,
) -> Result<Json<serde_json::Value>> {
    let admin_user = state.admin_username().await;
    require_admin(&identity, &admin_user)?;
    require_scope(&identity, Scope::SettingsWrite, &admin_user)?;

    let kind = NodeKind::parse(&body.node_type)
        .ok_or_else(|| Error::validation("invalid_type", "type must be \"pve\" or \"pbs\""))?;

    let host = body
        .host
        .as_deref()
        .map(|h| super::host::normalize_host(h, kind))
        .transpose()?
        .map(|url| super::host::bare_host(&url));

    let code = state
        .setup_codes
        .issue(kind, host.clone(), body.org_id.clone());

    let base_url = state.public_url.current().unwrap_or_else(|| {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost:7655");
        let scheme = if state.tls_enabled { "https" } else { "http" };
        format!("{scheme}://{host}")
    });

    let host_param = host.as_deref().unwrap_or("");
    let script_url =
        format!("{base_url}/api/setup-script?type={kind}&token={code}&host={host_param}");
    let command = format!("PULSE_SETUP_CODE={code} bash -c \"$(curl -fsSL '{script_url}')\"");

    Ok(Json(json!({
        "token": code,
        "command": command,
        "scriptUrl": script_url,
        "expiresInSeconds": SETUP_CODE_TTL.as_secs(),
    })))
}

/// `GET /api/setup-script` — templated install script. Public: the script
/// is useless without a valid setup code, and every interpolated value is
/// allow-list validated.
pub(crate) async fn setup_script(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SetupScriptQuery>,
) -> Response {
    let Some(kind) = NodeKind::parse(&query.node_type) else {
        return Error::validation("invalid_type", "type must be \"pve\" or \"pbs\"")
            .into_response();
    };

    let Some(ref token) = query.token else {
        return Error::validation("invalid_token", "token query parameter is required")
            .into_response();
    };

    // Unused codes fetch the script; freshly redeemed ones keep working for
    // the grace window so a re-run can re-read it.
    if !state.setup_codes.script_fetch_allowed(token) {
        return (
            StatusCode::GONE,
            "setup code expired or already used; generate a new install command\n",
        )
            .into_response();
    }

    let pulse_url = state.public_url.current().unwrap_or_else(|| {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost:7655");
        let scheme = if state.tls_enabled { "https" } else { "http" };
        format!("{scheme}://{host}")
    });

    match render_setup_script(&ScriptParams {
        kind,
        pulse_url: &pulse_url,
        setup_code: token,
        host: query.host.as_deref().unwrap_or(""),
    }) {
        Ok(script) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/x-shellscript")],
            script,
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /api/auto-register` — node enrollment. Authenticates with a setup
/// code or a scoped API token carried in the body or headers.
pub(crate) async fn auto_register(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: super::service::AutoRegisterRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return Error::validation("invalid_json", format!("Request body: {e}"))
                .into_response();
        }
    };

    let header_setup_code = headers
        .get("x-setup-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let header_api_token = crate::auth::api_token_from_headers(&headers);

    let credential = match state
        .enroll
        .authenticate(
            &request,
            header_setup_code.as_deref(),
            header_api_token.as_deref(),
        )
        .await
    {
        Ok(credential) => credential,
        Err(e) => {
            AuditEvent::new("enroll.rejected", false)
                .client_ip(meta.client_ip)
                .detail(format!("type={} host={}: {e}", request.node_type, request.host))
                .emit();
            return e.into_response();
        }
    };

    match state
        .enroll
        .register(&request, &credential, meta.client_ip)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => {
            AuditEvent::new("enroll.rejected", false)
                .client_ip(meta.client_ip)
                .detail(format!("type={} host={}: {e}", request.node_type, request.host))
                .emit();
            e.into_response()
        }
    }
}
