//! HTTP server assembly: builds the injected stores, spawns the background
//! sweepers and runs the listener with graceful shutdown.

pub mod events;
pub mod middleware;
pub mod net;
pub mod public_url;
pub mod router;

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::csrf::CsrfStore;
use crate::auth::lockout::LockoutTracker;
use crate::auth::oidc::IssuerClient;
use crate::auth::recovery::RecoveryManager;
use crate::auth::session::SessionStore;
use crate::auth::tokens::TokenRegistry;
use crate::config::Config;
use crate::distribute::BinaryDistributor;
use crate::enroll::service::EnrollmentService;
use crate::enroll::setup_codes::SetupCodeVault;
use crate::persist::DataPaths;
use crate::persist::nodes::ConfigStore;
use crate::{Error, Result};

use net::TrustedProxies;
use public_url::PublicUrlDetector;
use router::AppState;

/// Build the shared application state from configuration. Exposed so
/// integration tests can drive the real router in-process.
pub async fn build_state(config: Config) -> Result<Arc<AppState>> {
    let paths = DataPaths::new(config.data.resolved_data_dir())?;

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

    let (events, _) = broadcast::channel(64);

    let public_url = Arc::new(
        PublicUrlDetector::new(config.server.public_url.clone(), trusted.clone())
            .with_events(events.clone()),
    );
    let distributor = Arc::new(BinaryDistributor::new(
        config.data.resolved_bin_dir(),
        config.data.release_archive.clone(),
    ));

    // First-run bootstrap: write the one-time token when no admin exists
    let admin_configured = store.read(|c| c.admin.is_some()).await
        || config.auth.resolve_admin_password_hash().is_some();
    if recovery.ensure_bootstrap_token(admin_configured)? {
        info!("First-run bootstrap token is pending consumption");
    }

    let oidc = config.auth.oidc.as_ref().map(|oidc_config| {
        Arc::new(IssuerClient::new(reqwest::Client::new(), oidc_config))
    });
    let refresher = oidc
        .clone()
        .map(|client| client as Arc<dyn crate::auth::oidc::OidcRefresher>);

    let enroll = Arc::new(EnrollmentService::new(
        Arc::clone(&store),
        Arc::clone(&setup_codes),
        tokens.clone(),
        events.clone(),
    ));

    let global_limiter = if config.rate_limit.enabled {
        let quota = Quota::per_second(
            NonZeroU32::new(config.rate_limit.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(config.rate_limit.burst_size).unwrap_or(NonZeroU32::MIN));
        Some(Arc::new(RateLimiter::direct(quota)))
    } else {
        None
    };

    let public_quota = Quota::per_minute(
        NonZeroU32::new(config.rate_limit.public_per_minute).unwrap_or(NonZeroU32::MIN),
    );
    let public_limiter = Arc::new(RateLimiter::keyed(public_quota));

    Ok(Arc::new(AppState {
        tls_enabled: config.server.tls_enabled(),
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
        oidc,
        refresher,
        events,
        global_limiter,
        public_limiter,
        paths,
    }))
}

/// The Pulse HTTP server.
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    /// Build all stores and background machinery.
    pub async fn new(config: Config) -> Result<Self> {
        let state = build_state(config).await?;
        Ok(Self { state })
    }

    /// Run until SIGINT/SIGTERM; persists store state on the way out.
    pub async fn run(self) -> Result<()> {
        let state = self.state;
        let addr = SocketAddr::new(
            state
                .config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            state.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        spawn_sweepers(Arc::clone(&state), &shutdown_tx);

        let app = router::create_router(Arc::clone(&state));

        info!(
            addr = %addr,
            tls = state.tls_enabled,
            data_dir = %state.paths.root().display(),
            "Pulse control plane listening"
        );
        if state.recovery.recovery_active() {
            warn!("Recovery mode is ACTIVE: loopback requests bypass authentication");
        }

        if state.tls_enabled {
            let (Some(cert), Some(key)) = (
                state.config.server.tls_cert.clone(),
                state.config.server.tls_key.clone(),
            ) else {
                return Err(Error::Config("TLS cert/key misconfigured".to_string()));
            };

            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| Error::Config(format!("Cannot load TLS material: {e}")))?;

            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            let grace = state.config.server.shutdown_timeout;
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_handle.graceful_shutdown(Some(grace));
            });

            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        } else {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        }

        // Background loops exit and flush on the shared signal
        let _ = shutdown_tx.send(());

        let swept = state.sessions.sweep();
        if swept > 0 {
            debug!(count = swept, "Final session sweep");
        }

        Ok(())
    }
}

/// Spawn the periodic sweepers; each exits on the shared shutdown signal.
fn spawn_sweepers(state: Arc<AppState>, shutdown_tx: &broadcast::Sender<()>) {
    // Sessions and their CSRF twins, once a minute
    let session_state = Arc::clone(&state);
    let mut shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sessions = session_state.sessions.sweep();
                    let live = session_state.sessions.live_hashes();
                    let csrf = session_state.csrf.sweep(&live);
                    if sessions > 0 || csrf > 0 {
                        debug!(sessions, csrf, "Swept expired auth state");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session sweeper shutting down");
                    break;
                }
            }
        }
    });

    // Setup codes, every thirty seconds
    let code_state = Arc::clone(&state);
    let mut shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = code_state.setup_codes.sweep();
                    if swept > 0 {
                        debug!(count = swept, "Swept expired setup codes");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });

    // Lockout entries, every five minutes
    let lockout_state = Arc::clone(&state);
    let mut shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    lockout_state.lockout.prune();
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}

/// Shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
