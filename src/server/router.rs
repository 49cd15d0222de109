//! HTTP router, shared application state and the small public handlers.

use std::sync::Arc;

use axum::http::{HeaderValue, Method, header};
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router, extract::State};
use serde_json::json;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use super::events::ControlEvent;
use super::middleware as guard;
use super::net::TrustedProxies;
use super::public_url::PublicUrlDetector;
use crate::auth::csrf::CsrfStore;
use crate::auth::lockout::LockoutTracker;
use crate::auth::oidc::{IssuerClient, OidcRefresher};
use crate::auth::recovery::RecoveryManager;
use crate::auth::session::SessionStore;
use crate::auth::tokens::TokenRegistry;
use crate::auth::{self, Identity, handlers as auth_handlers};
use crate::config::Config;
use crate::distribute::{self, BinaryDistributor};
use crate::enroll::handlers as enroll_handlers;
use crate::enroll::service::EnrollmentService;
use crate::enroll::setup_codes::SetupCodeVault;
use crate::persist::DataPaths;
use crate::persist::nodes::ConfigStore;

/// Shared application state: every store the handlers need, injected
/// explicitly instead of living in globals.
pub struct AppState {
    /// Loaded configuration
    pub config: Config,
    /// Node instances, API tokens, runtime admin account
    pub store: Arc<ConfigStore>,
    /// Persisted sessions
    pub sessions: Arc<SessionStore>,
    /// Per-session CSRF tokens
    pub csrf: Arc<CsrfStore>,
    /// Failed-attempt accounting
    pub lockout: Arc<LockoutTracker>,
    /// API token registry
    pub tokens: TokenRegistry,
    /// Recovery/bootstrap machinery
    pub recovery: Arc<RecoveryManager>,
    /// One-shot setup codes
    pub setup_codes: Arc<SetupCodeVault>,
    /// Node enrollment
    pub enroll: Arc<EnrollmentService>,
    /// Agent binaries and checksums
    pub distributor: Arc<BinaryDistributor>,
    /// Externally-visible base URL capture
    pub public_url: Arc<PublicUrlDetector>,
    /// Peers allowed to assert forwarded headers
    pub trusted: TrustedProxies,
    /// Whether the listener terminates TLS
    pub tls_enabled: bool,
    /// OIDC code-exchange client, when configured
    pub oidc: Option<Arc<IssuerClient>>,
    /// OIDC refresh hook for the session store
    pub refresher: Option<Arc<dyn OidcRefresher>>,
    /// Control-plane event fan-out
    pub events: broadcast::Sender<ControlEvent>,
    /// Universal request limiter
    pub global_limiter: Option<Arc<governor::DefaultDirectRateLimiter>>,
    /// Keyed limiter for public install/download/login endpoints
    pub public_limiter: Arc<governor::DefaultKeyedRateLimiter<String>>,
    /// Data directory layout
    pub paths: DataPaths,
}

impl AppState {
    /// Effective admin username: the runtime-provisioned account wins over
    /// the config file.
    pub async fn admin_username(&self) -> String {
        self.store
            .read(|config| config.admin.as_ref().map(|a| a.username.clone()))
            .await
            .unwrap_or_else(|| self.config.auth.admin_user.clone())
    }

    /// Whether any admin credential exists.
    pub async fn admin_configured(&self) -> bool {
        if self.store.read(|config| config.admin.is_some()).await {
            return true;
        }
        self.config.auth.resolve_admin_password_hash().is_some()
    }

    /// Verify a username/password pair against the local admin.
    pub async fn verify_admin_password(&self, username: &str, password: &str) -> bool {
        let (admin_user, hash) = match self.store.read(|config| config.admin.clone()).await {
            Some(account) => (account.username, Some(account.password_hash)),
            None => (
                self.config.auth.admin_user.clone(),
                self.config.auth.resolve_admin_password_hash(),
            ),
        };

        if username != admin_user {
            return false;
        }
        let Some(hash) = hash else {
            return false;
        };
        bcrypt::verify(password, &hash).unwrap_or(false)
    }
}

/// Build the full route table with its middleware stack.
pub fn create_router(state: Arc<AppState>) -> Router {
    // Public endpoints with their own per-IP limiter
    let public_limited = Router::new()
        .route("/api/login", post(auth_handlers::login))
        .route(
            "/install-host-agent.sh",
            get(distribute::install_host_script),
        )
        .route(
            "/install-docker-agent.sh",
            get(distribute::install_docker_script),
        )
        .route("/install.ps1", get(distribute::install_ps1_script))
        .route("/download/{artifact}", get(distribute::download))
        .route_layer(from_fn_with_state(
            Arc::clone(&state),
            guard::public_rate_limit,
        ));

    let mut router = Router::new()
        .route("/api/health", get(health))
        .route("/api/version", get(version))
        .route("/api/server-info", get(server_info))
        .route("/api/state", get(auth_handlers::api_state))
        .route("/api/logout", post(auth_handlers::logout))
        .route("/api/oidc/login", get(auth_handlers::oidc_login))
        .route("/api/oidc/callback", get(auth_handlers::oidc_callback))
        .route("/api/security/status", get(auth_handlers::security_status))
        .route(
            "/api/security/quick-setup",
            post(auth_handlers::quick_setup),
        )
        .route(
            "/api/security/validate-bootstrap-token",
            post(auth_handlers::validate_bootstrap_token),
        )
        .route(
            "/api/security/recovery",
            post(auth_handlers::recovery_toggle),
        )
        .route(
            "/api/security/tokens",
            get(auth_handlers::list_tokens).post(auth_handlers::create_token),
        )
        .route(
            "/api/security/tokens/{id}",
            delete(auth_handlers::delete_token),
        )
        .route(
            "/api/security/reset-lockout",
            post(auth_handlers::reset_lockout),
        )
        .route(
            "/api/security/change-password",
            post(auth_handlers::change_password),
        )
        .route(
            "/api/setup-script-url",
            post(enroll_handlers::setup_script_url),
        )
        .route("/api/setup-script", get(enroll_handlers::setup_script))
        .route("/api/auto-register", post(enroll_handlers::auto_register))
        .merge(public_limited)
        // Outermost first: guard (rate limit, traversal, demo mode), panic
        // recovery, security headers, then the auth gate next to the routes
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(from_fn_with_state(
                    Arc::clone(&state),
                    guard::guard_middleware,
                ))
                .layer(CatchPanicLayer::new())
                .layer(from_fn_with_state(
                    Arc::clone(&state),
                    guard::security_headers,
                ))
                .layer(from_fn_with_state(
                    Arc::clone(&state),
                    auth::auth_middleware,
                )),
        );

    if !state.config.server.allowed_origins.is_empty() {
        router = router.layer(cors_layer(&state.config.server.allowed_origins));
    }

    router.with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<String> = allowed_origins.to_vec();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .is_ok_and(|o| origins.iter().any(|allowed| allowed == o))
        }))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-token"),
            header::HeaderName::from_static("x-csrf-token"),
            header::HeaderName::from_static("x-setup-token"),
            header::HeaderName::from_static("x-proxy-secret"),
        ])
}

// ── Public handlers ───────────────────────────────────────────────────────

/// `GET /api/health` — liveness.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /api/version` — build info.
async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": env!("CARGO_PKG_NAME"),
    }))
}

/// `GET /api/server-info` — what the login page needs before any auth.
async fn server_info(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Json<serde_json::Value> {
    let mut info = json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "tls": state.tls_enabled,
    });
    if identity.is_authenticated() {
        if let Some(obj) = info.as_object_mut() {
            obj.insert("publicUrl".to_string(), json!(state.public_url.current()));
        }
    }
    Json(info)
}
