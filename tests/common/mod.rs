//! Shared harness for integration tests: builds the real application state
//! with stubbed network probes and drives the router in-process.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response, header};
use governor::{Quota, RateLimiter};
use tokio::sync::broadcast;
use tower::ServiceExt;

use pulse::auth::csrf::CsrfStore;
use pulse::auth::lockout::LockoutTracker;
use pulse::auth::recovery::RecoveryManager;
use pulse::auth::session::SessionStore;
use pulse::auth::tokens::TokenRegistry;
use pulse::config::Config;
use pulse::distribute::BinaryDistributor;
use pulse::enroll::cluster::{ClusterInfo, ClusterProber};
use pulse::enroll::service::{EnrollmentService, HostResolver};
use pulse::enroll::setup_codes::SetupCodeVault;
use pulse::persist::DataPaths;
use pulse::persist::nodes::ConfigStore;
use pulse::server::net::TrustedProxies;
use pulse::server::public_url::PublicUrlDetector;
use pulse::server::router::{AppState, create_router};

/// Password the test admin accepts.
pub const ADMIN_PASSWORD: &str = "correct-horse-battery";

/// Cluster prober answering from a canned response.
pub struct StubProber {
    pub cluster: Option<ClusterInfo>,
}

#[async_trait::async_trait]
impl ClusterProber for StubProber {
    async fn probe(
        &self,
        _host_url: &str,
        _token_id: &str,
        _token_value: &str,
        _verify_tls: bool,
    ) -> Option<ClusterInfo> {
        self.cluster.clone()
    }
}

/// DNS resolver answering from a canned table.
pub struct StubResolver {
    pub table: HashMap<String, Vec<IpAddr>>,
}

#[async_trait::async_trait]
impl HostResolver for StubResolver {
    async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }
        self.table.get(host).cloned().unwrap_or_default()
    }
}

/// Knobs for [`build_test_state`].
pub struct TestStateOptions {
    pub admin_password: Option<&'static str>,
    pub cluster: Option<ClusterInfo>,
    pub resolver_table: HashMap<String, Vec<IpAddr>>,
    pub proxy_secret: Option<&'static str>,
}

impl Default for TestStateOptions {
    fn default() -> Self {
        Self {
            admin_password: Some(ADMIN_PASSWORD),
            cluster: None,
            resolver_table: HashMap::new(),
            proxy_secret: None,
        }
    }
}

/// Build real application state over a temp dir, with network probes
/// replaced by stubs.
pub async fn build_test_state(dir: &Path, options: TestStateOptions) -> Arc<AppState> {
    let mut config = Config::default();
    config.data.data_dir = Some(dir.to_path_buf());
    config.data.bin_dir = Some(dir.join("bin"));
    std::fs::create_dir_all(dir.join("bin")).unwrap();
    config.rate_limit.enabled = false;
    config.rate_limit.public_per_minute = 100_000;

    if let Some(password) = options.admin_password {
        config.auth.admin_password_hash = Some(bcrypt::hash(password, 4).unwrap());
    }
    if let Some(secret) = options.proxy_secret {
        config.auth.proxy.secret = Some(secret.to_string());
        config.auth.proxy.roles_header = Some("X-Remote-Roles".to_string());
    }

    let paths = DataPaths::new(config.data.resolved_data_dir()).unwrap();
    let store = Arc::new(ConfigStore::load(paths.config_file()));
    let sessions = Arc::new(SessionStore::load(paths.sessions_file()));
    let csrf = Arc::new(CsrfStore::load(paths.csrf_file()));
    let lockout = Arc::new(LockoutTracker::new(
        config.security.max_failed_attempts,
        config.security.lockout_window,
        config.security.lockout_duration,
    ));
    let recovery = Arc::new(RecoveryManager::new(paths.clone()));
    let setup_codes = Arc::new(SetupCodeVault::new());
    let tokens = TokenRegistry::new(Arc::clone(&store));
    let trusted = TrustedProxies::parse(&config.server.trusted_proxies);
    let public_url = Arc::new(PublicUrlDetector::new(None, trusted.clone()));
    let distributor = Arc::new(BinaryDistributor::new(config.data.resolved_bin_dir(), None));

    let admin_configured = config.auth.resolve_admin_password_hash().is_some();
    recovery.ensure_bootstrap_token(admin_configured).unwrap();

    let (events, _) = broadcast::channel(64);

    let enroll = Arc::new(
        EnrollmentService::new(
            Arc::clone(&store),
            Arc::clone(&setup_codes),
            tokens.clone(),
            events.clone(),
        )
        .with_prober(Arc::new(StubProber {
            cluster: options.cluster,
        }))
        .with_resolver(Arc::new(StubResolver {
            table: options.resolver_table,
        }))
        .without_fingerprint_probe(),
    );

    let public_limiter = Arc::new(RateLimiter::keyed(Quota::per_minute(
        NonZeroU32::new(config.rate_limit.public_per_minute).unwrap(),
    )));

    Arc::new(AppState {
        tls_enabled: false,
        config,
        store,
        sessions,
        csrf,
        lockout,
        tokens,
        recovery,
        setup_codes,
        enroll,
        distributor,
        public_url,
        trusted,
        oidc: None,
        refresher: None,
        events,
        global_limiter: None,
        public_limiter,
        paths,
    })
}

/// Build the router over default test state.
pub async fn test_app(dir: &Path) -> Router {
    let state = build_test_state(dir, TestStateOptions::default()).await;
    create_router(state)
}

/// Remote (non-loopback) peer used by most tests.
pub fn remote_peer() -> SocketAddr {
    SocketAddr::from(([203, 0, 113, 50], 40000))
}

/// Build a request with a JSON body and a peer address.
pub fn json_request(
    method: &str,
    path: &str,
    peer: SocketAddr,
    body: serde_json::Value,
) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

/// Build a bodyless request with a peer address.
pub fn bare_request(method: &str, path: &str, peer: SocketAddr) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

/// Drive one request through the router.
pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

/// Response body as parsed JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Response body as raw bytes.
pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// Extract a cookie value from the response's Set-Cookie headers.
pub fn cookie_value(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let (pair, _) = cookie.split_once(';')?;
            let (k, v) = pair.split_once('=')?;
            (k == name && !v.is_empty()).then(|| v.to_string())
        })
}

/// Log in as the test admin and return `(session_cookie, csrf_token)`.
pub async fn login(app: &Router, peer: SocketAddr) -> (String, String) {
    let response = send(
        app,
        json_request(
            "POST",
            "/api/login",
            peer,
            serde_json::json!({"username": "admin", "password": ADMIN_PASSWORD}),
        ),
    )
    .await;
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let session = cookie_value(&response, "pulse_session").expect("session cookie");
    let body = body_json(response).await;
    let csrf = body["csrfToken"].as_str().expect("csrf token").to_string();
    (session, csrf)
}
