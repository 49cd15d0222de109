//! Error types for the Pulse control plane

use std::io;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Result type alias for Pulse
pub type Result<T> = std::result::Result<T, Error>;

/// Pulse control-plane errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid credential
    #[error("Authentication required")]
    Unauthorized,

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Authenticated token lacks a required scope
    #[error("Missing required scope: {0}")]
    MissingScope(String),

    /// Too many failed attempts for this identifier
    #[error("Account locked until {locked_until}")]
    Locked {
        /// When the lockout ends (RFC 3339)
        locked_until: chrono::DateTime<chrono::Utc>,
        /// Whole minutes until unlock, rounded up
        remaining_minutes: i64,
    },

    /// Request rate exceeded
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Write attempted while demo mode is active
    #[error("Server is in demo mode")]
    DemoReadOnly,

    /// Request payload failed validation
    #[error("{message}")]
    Validation {
        /// Machine-readable code (e.g. `invalid_username`)
        code: &'static str,
        /// Human-readable detail
        message: String,
    },

    /// Unknown resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate resource or merge conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A required subsystem is unavailable
    #[error("Dependency unavailable: {0}")]
    Dependency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error; detail is logged, never returned to clients
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a validation error with a machine-readable code.
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// HTTP status this error maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::MissingScope(_) | Self::Locked { .. } | Self::DemoReadOnly => {
                StatusCode::FORBIDDEN
            }
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Dependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            Self::Unauthorized => json!({"error": "Authentication required"}),
            Self::Forbidden(reason) => json!({"error": reason}),
            Self::MissingScope(scope) => json!({"error": "missing_scope", "scope": scope}),
            Self::Locked {
                locked_until,
                remaining_minutes,
            } => json!({
                "error": "account_locked",
                "lockedUntil": locked_until.to_rfc3339(),
                "remainingMinutes": remaining_minutes,
            }),
            Self::RateLimited => json!({
                "error": "rate_limited",
                "retryAfter": "retry after a short delay",
            }),
            Self::DemoReadOnly => json!({"error": "demo_readonly"}),
            Self::Validation { code, message } => json!({"error": code, "message": message}),
            Self::NotFound(what) => json!({"error": "not_found", "message": what}),
            Self::Conflict(what) => json!({"error": "conflict", "message": what}),
            Self::Dependency(what) => json!({"error": "unavailable", "message": what}),
            // Opaque surface for everything unexpected; detail stays in the log.
            other => {
                tracing::error!(error = %other, "request failed");
                json!({"error": "internal_error"})
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(Error::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::MissingScope("settings:write".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(Error::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            Error::validation("invalid_json", "bad body").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::Dependency("metrics store".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn locked_error_carries_remaining_minutes() {
        let err = Error::Locked {
            locked_until: chrono::Utc::now() + chrono::Duration::minutes(15),
            remaining_minutes: 15,
        };
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }
}
