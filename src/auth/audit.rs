//! Audit logging for authentication and enrollment lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the serialized record in
//! an `audit` field, making the trail queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `auth.login` | Password or OIDC login attempt (success and failure) |
//! | `auth.logout` | Session terminated by the user |
//! | `auth.lockout` | An identifier tripped the failed-attempt threshold |
//! | `auth.lockout_reset` | Admin cleared lockout counters |
//! | `auth.password_changed` | Local admin password rotated |
//! | `auth.csrf_rejected` | State-changing call failed CSRF verification |
//! | `auth.recovery` | Recovery mode toggled |
//! | `token.created` / `token.deleted` | API token mutations |
//! | `enroll.registered` / `enroll.rejected` | Auto-registration outcomes |

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Append-only audit record.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Action string (e.g. `"auth.login"`).
    pub action: &'static str,
    /// Acting identity, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Client IP the request arrived from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
    /// Request path, when relevant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Whether the action succeeded.
    pub success: bool,
    /// Free-form detail (failure reason, affected resource).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Event time.
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Start a new event for `action`.
    #[must_use]
    pub fn new(action: &'static str, success: bool) -> Self {
        Self {
            action,
            actor: None,
            client_ip: None,
            path: None,
            success,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the acting identity.
    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Attach the client IP.
    #[must_use]
    pub fn client_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }

    /// Attach the request path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach free-form detail.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Emit the event through tracing.
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(ref json) => tracing::info!(audit = %json, "audit"),
            Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_populates_fields() {
        let event = AuditEvent::new("auth.login", false)
            .actor("admin")
            .client_ip(Some("198.51.100.5".parse().unwrap()))
            .path("/api/login")
            .detail("bad password");

        assert_eq!(event.action, "auth.login");
        assert!(!event.success);
        assert_eq!(event.actor.as_deref(), Some("admin"));
        assert_eq!(event.path.as_deref(), Some("/api/login"));
    }

    #[test]
    fn events_serialize_to_json() {
        let event = AuditEvent::new("enroll.registered", true).actor("setup-code");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("enroll.registered"));
        // Absent optional fields are omitted entirely
        assert!(!json.contains("client_ip"));
    }

    #[test]
    fn emit_does_not_panic() {
        AuditEvent::new("auth.logout", true).actor("admin").emit();
    }
}
