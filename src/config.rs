//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Security policy configuration
    pub security: SecurityConfig,
    /// Data and artifact directories
    pub data: DataConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// TLS certificate path (PEM). TLS is enabled when both cert and key are set.
    pub tls_cert: Option<PathBuf>,
    /// TLS private key path (PEM)
    pub tls_key: Option<PathBuf>,
    /// Externally visible base URL, pinned by the admin. When unset, Pulse
    /// learns it from trusted-proxy headers on inbound requests.
    pub public_url: Option<String>,
    /// Peers allowed to assert X-Forwarded-* headers. Plain IPs or CIDR blocks.
    pub trusted_proxies: Vec<String>,
    /// Origins allowed for credentialed CORS. Empty disables CORS handling.
    pub allowed_origins: Vec<String>,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7655,
            tls_cert: None,
            tls_key: None,
            public_url: None,
            trusted_proxies: Vec::new(),
            allowed_origins: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Whether a TLS listener is configured.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Local admin username
    pub admin_user: String,
    /// bcrypt hash of the local admin password. Supports `env:VAR_NAME`.
    /// When unset and no admin was provisioned at runtime, first-run
    /// bootstrap is active.
    pub admin_password_hash: Option<String>,
    /// Session lifetime for ordinary logins
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    /// Session lifetime when the client asks to be remembered
    #[serde(with = "humantime_serde")]
    pub remember_me_ttl: Duration,
    /// Front-proxy authentication
    pub proxy: ProxyAuthConfig,
    /// OIDC single sign-on
    pub oidc: Option<OidcConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_user: "admin".to_string(),
            admin_password_hash: None,
            session_ttl: Duration::from_secs(24 * 3600),
            remember_me_ttl: Duration::from_secs(30 * 24 * 3600),
            proxy: ProxyAuthConfig::default(),
            oidc: None,
        }
    }
}

impl AuthConfig {
    /// Resolve the admin password hash (expand `env:VAR_NAME`).
    #[must_use]
    pub fn resolve_admin_password_hash(&self) -> Option<String> {
        self.admin_password_hash.as_ref().map(|v| resolve_secret(v))
    }
}

/// Front-proxy authentication: a reverse proxy injects a shared secret plus
/// identity headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyAuthConfig {
    /// Shared secret expected in `X-Proxy-Secret`. Supports `env:VAR_NAME`.
    /// Proxy auth is disabled when unset.
    pub secret: Option<String>,
    /// Header carrying the authenticated username
    pub user_header: String,
    /// Header carrying the user's roles; admin detection is skipped when unset
    pub roles_header: Option<String>,
    /// Separator between role tokens in the roles header
    pub role_separator: String,
    /// Role string that grants admin
    pub admin_role: String,
}

impl Default for ProxyAuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            user_header: "X-Remote-User".to_string(),
            roles_header: None,
            role_separator: "|".to_string(),
            admin_role: "admin".to_string(),
        }
    }
}

impl ProxyAuthConfig {
    /// Resolve the proxy secret (expand `env:VAR_NAME`).
    #[must_use]
    pub fn resolve_secret(&self) -> Option<String> {
        self.secret.as_ref().map(|v| resolve_secret(v))
    }
}

/// OIDC single sign-on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    /// Issuer URL (informational; endpoints below are authoritative)
    pub issuer: String,
    /// OAuth client ID
    pub client_id: String,
    /// OAuth client secret. Supports `env:VAR_NAME`.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Authorization endpoint
    pub authorization_endpoint: String,
    /// Token endpoint
    pub token_endpoint: String,
    /// Requested scopes
    #[serde(default = "default_oidc_scopes")]
    pub scopes: Vec<String>,
    /// ID-token claim used as the Pulse username
    #[serde(default = "default_username_claim")]
    pub username_claim: String,
}

fn default_oidc_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "profile".to_string(),
        "email".to_string(),
    ]
}

fn default_username_claim() -> String {
    "preferred_username".to_string()
}

impl OidcConfig {
    /// Resolve the client secret (expand `env:VAR_NAME`).
    #[must_use]
    pub fn resolve_client_secret(&self) -> Option<String> {
        self.client_secret.as_ref().map(|v| resolve_secret(v))
    }
}

/// Names of OIDC settings currently overridden via environment variables.
/// Exposed (as booleans, never values) by the security status endpoint so the
/// login page can explain why a field is not editable.
#[must_use]
pub fn oidc_env_overrides() -> Vec<&'static str> {
    const VARS: &[(&str, &str)] = &[
        ("PULSE_AUTH__OIDC__ISSUER", "issuer"),
        ("PULSE_AUTH__OIDC__CLIENT_ID", "clientId"),
        ("PULSE_AUTH__OIDC__CLIENT_SECRET", "clientSecret"),
    ];
    VARS.iter()
        .filter(|(var, _)| env::var(var).is_ok())
        .map(|(_, name)| *name)
        .collect()
}

/// Security policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Demo mode: every state-changing request outside a small allow-list is rejected
    pub demo_mode: bool,
    /// Failed attempts within the window before an identifier locks
    pub max_failed_attempts: u32,
    /// Sliding window over which failures accumulate
    #[serde(with = "humantime_serde")]
    pub lockout_window: Duration,
    /// How long a locked identifier stays locked
    #[serde(with = "humantime_serde")]
    pub lockout_duration: Duration,
    /// Allow the UI to be embedded in iframes
    pub allow_embedding: bool,
    /// Origins allowed to embed when embedding is on
    pub allowed_embed_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            demo_mode: false,
            max_failed_attempts: 5,
            lockout_window: Duration::from_secs(15 * 60),
            lockout_duration: Duration::from_secs(15 * 60),
            allow_embedding: false,
            allowed_embed_origins: Vec::new(),
        }
    }
}

/// Data and artifact directories
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DataConfig {
    /// Data directory for persisted state (sessions, config, flags).
    /// Defaults to /var/lib/pulse, falling back to ~/.pulse.
    pub data_dir: Option<PathBuf>,
    /// Directory holding agent binaries for distribution
    pub bin_dir: Option<PathBuf>,
    /// Release archive used to restore missing agent binaries
    pub release_archive: Option<PathBuf>,
}

impl DataConfig {
    /// Resolved data directory.
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.data_dir {
            return dir.clone();
        }
        let system = PathBuf::from("/var/lib/pulse");
        if system.exists() {
            return system;
        }
        dirs::home_dir()
            .map_or(system, |home| home.join(".pulse"))
    }

    /// Resolved binary directory.
    #[must_use]
    pub fn resolved_bin_dir(&self) -> PathBuf {
        self.bin_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/opt/pulse/bin"))
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable the universal request limiter
    pub enabled: bool,
    /// Sustained requests per second across all callers
    pub requests_per_second: u32,
    /// Burst allowance
    pub burst_size: u32,
    /// Per-client-IP requests per minute on the public install/download
    /// endpoints and the login endpoint
    pub public_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100,
            burst_size: 200,
            public_per_minute: 30,
        }
    }
}

/// Resolve a secret value that may be an `env:VAR_NAME` reference.
fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (PULSE_ prefix, __ as section separator)
        figment = figment.merge(Env::prefixed("PULSE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into the process environment so env: references resolve
        config.load_env_files();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 7655);
        assert!(!config.server.tls_enabled());
        assert_eq!(config.security.max_failed_attempts, 5);
        assert_eq!(config.security.lockout_duration, Duration::from_secs(900));
        assert_eq!(config.auth.admin_user, "admin");
        assert!(config.rate_limit.enabled);
    }

    #[test]
    fn resolve_secret_plain_value() {
        assert_eq!(resolve_secret("hunter2"), "hunter2");
    }

    #[test]
    fn resolve_secret_env_reference() {
        // PATH is set in any sane test environment.
        let path = env::var("PATH").expect("PATH must be set");
        assert_eq!(resolve_secret("env:PATH"), path);
    }

    #[test]
    fn resolve_secret_missing_env_keeps_literal() {
        assert_eq!(
            resolve_secret("env:PULSE_TEST_DOES_NOT_EXIST"),
            "env:PULSE_TEST_DOES_NOT_EXIST"
        );
    }

    #[test]
    fn proxy_auth_disabled_without_secret() {
        let proxy = ProxyAuthConfig::default();
        assert!(proxy.resolve_secret().is_none());
        assert_eq!(proxy.role_separator, "|");
        assert_eq!(proxy.admin_role, "admin");
    }

    #[test]
    fn tls_requires_both_cert_and_key() {
        let mut server = ServerConfig::default();
        server.tls_cert = Some(PathBuf::from("/etc/pulse/cert.pem"));
        assert!(!server.tls_enabled());
        server.tls_key = Some(PathBuf::from("/etc/pulse/key.pem"));
        assert!(server.tls_enabled());
    }
}
