//! OIDC token bundle and refresh-grant client.
//!
//! Pulse does not verify ID-token signatures itself: tokens are only ever
//! accepted straight from the issuer's token endpoint over TLS (code
//! exchange and refresh grant), where the transport already authenticates
//! the issuer. Claims are read from the payload segment for the username.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::OidcConfig;
use crate::{Error, Result};

/// Refresh-eligibility buffer: a bundle within this many seconds of expiry
/// is refreshed proactively.
const EXPIRY_BUFFER_SECS: u64 = 60;

/// Tokens held for an OIDC-backed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcTokens {
    /// Access token
    pub access_token: String,
    /// Refresh token, when the issuer granted one
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Raw ID token
    #[serde(default)]
    pub id_token: Option<String>,
    /// Access-token expiry (Unix epoch seconds)
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl OidcTokens {
    /// Build from a token-endpoint response.
    #[must_use]
    pub fn from_response(
        access_token: String,
        refresh_token: Option<String>,
        id_token: Option<String>,
        expires_in: Option<u64>,
    ) -> Self {
        let expires_at = expires_in.map(|secs| now_unix() + secs);
        Self {
            access_token,
            refresh_token,
            id_token,
            expires_at,
        }
    }

    /// Whether the bundle is inside the refresh buffer.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.expires_at
            .is_some_and(|at| now_unix() + EXPIRY_BUFFER_SECS >= at)
    }

    /// Whether the bundle is hard-expired (no buffer).
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| now_unix() >= at)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Read a claim out of a JWT payload without signature verification.
///
/// Only call this on tokens received directly from the issuer's token
/// endpoint.
#[must_use]
pub fn claim_from_id_token(id_token: &str, claim: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    match value.get(claim)? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Abstraction over the refresh grant, injected into the session store so
/// validation can transparently renew near-expiry OIDC sessions.
#[async_trait::async_trait]
pub trait OidcRefresher: Send + Sync + 'static {
    /// Exchange a refresh token for a new bundle.
    async fn refresh(&self, refresh_token: &str) -> Result<OidcTokens>;
}

/// Token-endpoint response shape (RFC 6749 §5.1).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Refresher and code-exchange client against a configured issuer.
pub struct IssuerClient {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<String>,
}

impl IssuerClient {
    /// Build from the OIDC config section.
    #[must_use]
    pub fn new(http: reqwest::Client, config: &OidcConfig) -> Self {
        Self {
            http,
            token_endpoint: config.token_endpoint.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.resolve_client_secret(),
        }
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OidcTokens> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.client_id),
        ];
        if let Some(ref secret) = self.client_secret {
            params.push(("client_secret", secret));
        }

        let tokens = self.grant(&params).await?;
        debug!("OIDC code exchange succeeded");
        Ok(tokens)
    }

    async fn grant(&self, params: &[(&str, &str)]) -> Result<OidcTokens> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "Token grant failed: HTTP {status} - {body}"
            )));
        }

        let token_response: TokenResponse = response.json().await?;
        Ok(OidcTokens::from_response(
            token_response.access_token,
            token_response.refresh_token,
            token_response.id_token,
            token_response.expires_in,
        ))
    }
}

#[async_trait::async_trait]
impl OidcRefresher for IssuerClient {
    async fn refresh(&self, refresh_token: &str) -> Result<OidcTokens> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
        ];
        if let Some(ref secret) = self.client_secret {
            params.push(("client_secret", secret));
        }

        let tokens = self.grant(&params).await?;
        info!("OIDC session refreshed");
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_refresh_inside_buffer() {
        let tokens = OidcTokens {
            access_token: "a".to_string(),
            refresh_token: None,
            id_token: None,
            expires_at: Some(now_unix() + 30),
        };
        assert!(tokens.needs_refresh());
        assert!(!tokens.is_expired());
    }

    #[test]
    fn fresh_bundle_does_not_need_refresh() {
        let tokens =
            OidcTokens::from_response("a".to_string(), None, None, Some(3600));
        assert!(!tokens.needs_refresh());
    }

    #[test]
    fn no_expiry_never_refreshes() {
        let tokens = OidcTokens::from_response("a".to_string(), None, None, None);
        assert!(!tokens.needs_refresh());
        assert!(!tokens.is_expired());
    }

    #[test]
    fn claim_extraction_from_payload() {
        // header.payload.signature with payload {"preferred_username":"alice","sub":"123"}
        let payload = URL_SAFE_NO_PAD
            .encode(br#"{"preferred_username":"alice","sub":"123"}"#);
        let token = format!("eyJhbGciOiJSUzI1NiJ9.{payload}.sig");

        assert_eq!(
            claim_from_id_token(&token, "preferred_username").as_deref(),
            Some("alice")
        );
        assert_eq!(claim_from_id_token(&token, "sub").as_deref(), Some("123"));
        assert!(claim_from_id_token(&token, "email").is_none());
    }

    #[test]
    fn malformed_token_yields_no_claim() {
        assert!(claim_from_id_token("not-a-jwt", "sub").is_none());
        assert!(claim_from_id_token("a.!!!.c", "sub").is_none());
    }
}
