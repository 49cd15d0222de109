//! Recovery and bootstrap flows.
//!
//! - **Recovery mode**: a `.auth_recovery` flag file under the data dir. While
//!   it exists, direct loopback requests bypass authentication entirely.
//!   Toggling it requires loopback access or a recovery token.
//! - **Recovery tokens**: short-TTL secrets issued only to direct-loopback
//!   callers, so an operator locked out of the UI can flip recovery off
//!   again from a remote shell.
//! - **Bootstrap token**: written to `.bootstrap_token` on first start when
//!   no admin exists; consumed exactly once by initial setup.

use std::fs;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngExt;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::persist::{self, DataPaths};
use crate::{Error, Result};

/// Recovery tokens stay valid this long.
const RECOVERY_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Loopback recovery machinery.
pub struct RecoveryManager {
    paths: DataPaths,
    tokens: DashMap<String, Instant>,
    bootstrap_guard: Mutex<()>,
}

impl RecoveryManager {
    /// Build over the data directory.
    #[must_use]
    pub fn new(paths: DataPaths) -> Self {
        Self {
            paths,
            tokens: DashMap::new(),
            bootstrap_guard: Mutex::new(()),
        }
    }

    // ── Recovery mode flag ────────────────────────────────────────────────

    /// Whether the recovery flag file is present.
    #[must_use]
    pub fn recovery_active(&self) -> bool {
        self.paths.recovery_flag().exists()
    }

    /// Create the flag file and issue a recovery token.
    pub fn enable_recovery(&self) -> Result<String> {
        persist::write_secure(&self.paths.recovery_flag(), b"recovery\n")?;
        warn!("Recovery mode ENABLED: loopback requests bypass authentication");
        Ok(self.issue_token())
    }

    /// Remove the flag file and drop outstanding recovery tokens.
    pub fn disable_recovery(&self) -> Result<()> {
        let flag = self.paths.recovery_flag();
        if flag.exists() {
            fs::remove_file(&flag)
                .map_err(|e| Error::Internal(format!("Cannot remove recovery flag: {e}")))?;
        }
        self.tokens.clear();
        info!("Recovery mode disabled");
        Ok(())
    }

    // ── Recovery tokens ───────────────────────────────────────────────────

    /// Issue a recovery token (caller must have verified loopback access).
    pub fn issue_token(&self) -> String {
        let bytes: [u8; 32] = rand::rng().random();
        let token = hex::encode(bytes);
        self.tokens
            .insert(super::session::hash_token(&token), Instant::now() + RECOVERY_TOKEN_TTL);
        token
    }

    /// Whether a presented recovery token is valid and unexpired.
    #[must_use]
    pub fn token_valid(&self, presented: &str) -> bool {
        let hash = super::session::hash_token(presented);
        let live = self.tokens.get(&hash).map(|expiry| *expiry > Instant::now());
        match live {
            Some(true) => true,
            Some(false) => {
                self.tokens.remove(&hash);
                false
            }
            None => false,
        }
    }

    // ── Bootstrap token ───────────────────────────────────────────────────

    /// On first start with no admin configured, ensure a bootstrap token
    /// exists on disk. Returns `true` when one is pending.
    pub fn ensure_bootstrap_token(&self, admin_configured: bool) -> Result<bool> {
        let _guard = self.bootstrap_guard.lock();
        let file = self.paths.bootstrap_token_file();

        if admin_configured {
            return Ok(false);
        }
        if file.exists() {
            return Ok(true);
        }

        let bytes: [u8; 32] = rand::rng().random();
        let token = hex::encode(bytes);
        persist::write_secure(&file, token.as_bytes())?;
        info!(
            file = %file.display(),
            "No admin configured; wrote one-time bootstrap token"
        );
        Ok(true)
    }

    /// Whether a bootstrap token is still pending consumption.
    #[must_use]
    pub fn bootstrap_pending(&self) -> bool {
        self.paths.bootstrap_token_file().exists()
    }

    /// Check a presented bootstrap token without consuming it.
    #[must_use]
    pub fn bootstrap_matches(&self, presented: &str) -> bool {
        let _guard = self.bootstrap_guard.lock();
        self.read_bootstrap()
            .is_some_and(|stored| bool::from(stored.as_bytes().ct_eq(presented.trim().as_bytes())))
    }

    /// Atomically consume the bootstrap token if `presented` matches.
    pub fn consume_bootstrap(&self, presented: &str) -> Result<()> {
        let _guard = self.bootstrap_guard.lock();
        let file = self.paths.bootstrap_token_file();

        let Some(stored) = self.read_bootstrap() else {
            return Err(Error::Unauthorized);
        };
        if !bool::from(stored.as_bytes().ct_eq(presented.trim().as_bytes())) {
            return Err(Error::Unauthorized);
        }

        fs::remove_file(&file)
            .map_err(|e| Error::Internal(format!("Cannot consume bootstrap token: {e}")))?;
        info!("Bootstrap token consumed");
        Ok(())
    }

    fn read_bootstrap(&self) -> Option<String> {
        fs::read_to_string(self.paths.bootstrap_token_file())
            .ok()
            .map(|s| s.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, RecoveryManager) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path().to_path_buf()).unwrap();
        (dir, RecoveryManager::new(paths))
    }

    #[test]
    fn recovery_flag_round_trip() {
        let (_dir, mgr) = manager();
        assert!(!mgr.recovery_active());

        let token = mgr.enable_recovery().unwrap();
        assert!(mgr.recovery_active());
        assert!(mgr.token_valid(&token));

        mgr.disable_recovery().unwrap();
        assert!(!mgr.recovery_active());
        assert!(!mgr.token_valid(&token));
    }

    #[test]
    fn recovery_token_rejects_garbage() {
        let (_dir, mgr) = manager();
        mgr.enable_recovery().unwrap();
        assert!(!mgr.token_valid("deadbeef"));
    }

    #[test]
    fn bootstrap_created_only_without_admin() {
        let (_dir, mgr) = manager();
        assert!(!mgr.ensure_bootstrap_token(true).unwrap());
        assert!(!mgr.bootstrap_pending());

        assert!(mgr.ensure_bootstrap_token(false).unwrap());
        assert!(mgr.bootstrap_pending());
    }

    #[test]
    fn bootstrap_consume_is_single_use() {
        let (dir, mgr) = manager();
        mgr.ensure_bootstrap_token(false).unwrap();

        let token = fs::read_to_string(dir.path().join(".bootstrap_token")).unwrap();
        assert!(mgr.bootstrap_matches(&token));

        mgr.consume_bootstrap(&token).unwrap();
        assert!(!mgr.bootstrap_pending());
        assert!(mgr.consume_bootstrap(&token).is_err());
    }

    #[test]
    fn bootstrap_rejects_wrong_token() {
        let (_dir, mgr) = manager();
        mgr.ensure_bootstrap_token(false).unwrap();
        assert!(!mgr.bootstrap_matches("wrong"));
        assert!(mgr.consume_bootstrap("wrong").is_err());
        // Still pending after a failed attempt
        assert!(mgr.bootstrap_pending());
    }
}
