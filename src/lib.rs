//! Pulse Control Plane
//!
//! Fleet-wide monitoring control plane for Proxmox VE, Proxmox Backup Server
//! and host agents. This crate covers the HTTP control plane and its
//! auth/session/enrollment substrate:
//!
//! - **Request pipeline**: rate limiting, demo-mode gate, panic recovery,
//!   security headers, CORS, path-traversal defense
//! - **Auth substrate**: persisted sessions with OIDC refresh, CSRF tokens,
//!   lockout accounting, scoped API tokens, recovery/bootstrap flows
//! - **Enrollment**: one-shot setup codes, templated install scripts,
//!   auto-registration with cluster dedup and DHCP reconciliation
//! - **Distribution**: agent install scripts and binaries with cached
//!   SHA-256 checksums

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod distribute;
pub mod enroll;
pub mod error;
pub mod persist;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
