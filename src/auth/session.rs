//! Session store - persisted map of token-hash to session record.
//!
//! Sessions are addressed by the SHA-256 of the opaque cookie value; only
//! the hash is ever persisted. A user index supports bulk invalidation. OIDC
//! sessions carry a refresh bundle that [`SessionStore::validate`] renews
//! transparently through an injected [`OidcRefresher`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::oidc::{OidcRefresher, OidcTokens};
use crate::persist;

/// How a session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Password / basic / bootstrap login
    Local,
    /// OIDC callback
    Oidc,
}

/// One persisted session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// SHA-256 hex of the opaque token
    pub hash: String,
    /// Hard expiry
    pub expires_at: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last validated use
    pub last_seen: DateTime<Utc>,
    /// User agent at creation
    pub user_agent: String,
    /// Client IP at creation
    pub client_ip: String,
    /// Owning username
    pub username: String,
    /// Local or OIDC
    pub kind: SessionKind,
    /// OIDC refresh bundle, for `kind == Oidc`
    #[serde(default)]
    pub oidc: Option<OidcTokens>,
}

impl SessionRecord {
    /// Whether the record's hard expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Generate an opaque session token: 32 random bytes as 64 hex chars.
#[must_use]
pub fn generate_session_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

/// SHA-256 hex of an opaque token. The store is keyed by this value so the
/// plaintext never touches disk.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Disk-backed session store.
pub struct SessionStore {
    by_hash: DashMap<String, SessionRecord>,
    by_user: DashMap<String, HashSet<String>>,
    file: PathBuf,
}

impl SessionStore {
    /// Load the store from `file`, starting empty when absent or corrupt.
    #[must_use]
    pub fn load(file: PathBuf) -> Self {
        let store = Self {
            by_hash: DashMap::new(),
            by_user: DashMap::new(),
            file,
        };

        if let Some(records) = persist::load_json::<Vec<SessionRecord>>(&store.file) {
            for record in records {
                if record.is_expired() {
                    continue;
                }
                store.index_user(&record.username, &record.hash);
                store.by_hash.insert(record.hash.clone(), record);
            }
            debug!(sessions = store.by_hash.len(), "Loaded sessions");
        }

        store
    }

    /// Create a local session and write through to disk.
    pub fn create(
        &self,
        token: &str,
        ttl: Duration,
        user_agent: &str,
        client_ip: &str,
        username: &str,
    ) -> SessionRecord {
        self.insert(token, ttl, user_agent, client_ip, username, SessionKind::Local, None)
    }

    /// Create an OIDC session carrying its refresh bundle.
    pub fn create_oidc(
        &self,
        token: &str,
        ttl: Duration,
        user_agent: &str,
        client_ip: &str,
        username: &str,
        tokens: OidcTokens,
    ) -> SessionRecord {
        self.insert(
            token,
            ttl,
            user_agent,
            client_ip,
            username,
            SessionKind::Oidc,
            Some(tokens),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &self,
        token: &str,
        ttl: Duration,
        user_agent: &str,
        client_ip: &str,
        username: &str,
        kind: SessionKind,
        oidc: Option<OidcTokens>,
    ) -> SessionRecord {
        let now = Utc::now();
        let hash = hash_token(token);
        let record = SessionRecord {
            hash: hash.clone(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24)),
            created_at: now,
            last_seen: now,
            user_agent: user_agent.to_string(),
            client_ip: client_ip.to_string(),
            username: username.to_string(),
            kind,
            oidc,
        };

        self.index_user(username, &hash);
        self.by_hash.insert(hash, record.clone());
        self.persist();
        record
    }

    /// Validate an opaque token.
    ///
    /// Expired records are lazily evicted and never validate. For OIDC
    /// sessions inside the refresh buffer, the injected refresher is invoked
    /// and the record updated in place; refresh failure downgrades the
    /// request to unauthenticated.
    pub async fn validate(
        &self,
        token: &str,
        refresher: Option<&Arc<dyn OidcRefresher>>,
    ) -> Option<SessionRecord> {
        let hash = hash_token(token);

        let record = {
            let entry = self.by_hash.get(&hash)?;
            entry.clone()
        };

        if record.is_expired() {
            self.remove_hash(&hash);
            self.persist();
            debug!(user = %record.username, "Evicted expired session");
            return None;
        }

        let needs_refresh = record.oidc.as_ref().is_some_and(OidcTokens::needs_refresh);
        let (Some(refresher), true) = (refresher, needs_refresh) else {
            if let Some(mut entry) = self.by_hash.get_mut(&hash) {
                entry.last_seen = Utc::now();
            }
            return Some(record);
        };

        let tokens = record.oidc.clone()?;
        let Some(ref refresh_token) = tokens.refresh_token else {
            warn!(user = %record.username, "OIDC session expiring without refresh token");
            self.remove_hash(&hash);
            self.persist();
            return None;
        };

        match refresher.refresh(refresh_token).await {
            Ok(mut renewed) => {
                // Issuers may omit the rotated refresh token; keep the old one.
                if renewed.refresh_token.is_none() {
                    renewed.refresh_token = tokens.refresh_token.clone();
                }
                let mut updated = record;
                updated.oidc = Some(renewed);
                updated.last_seen = Utc::now();
                self.by_hash.insert(hash, updated.clone());
                self.persist();
                Some(updated)
            }
            Err(e) => {
                warn!(user = %record.username, error = %e, "OIDC refresh failed, session dropped");
                self.remove_hash(&hash);
                self.persist();
                None
            }
        }
    }

    /// Delete the session for an opaque token. Returns the removed record.
    pub fn delete(&self, token: &str) -> Option<SessionRecord> {
        let hash = hash_token(token);
        let removed = self.remove_hash(&hash);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Remove every session owned by `username`. Returns removed hashes.
    pub fn invalidate_user(&self, username: &str) -> Vec<String> {
        let hashes: Vec<String> = self
            .by_user
            .remove(username)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();

        for hash in &hashes {
            self.by_hash.remove(hash);
        }
        if !hashes.is_empty() {
            self.persist();
        }
        hashes
    }

    /// Like [`Self::invalidate_user`] but keeps the session for `keep_token`.
    pub fn invalidate_user_except(&self, username: &str, keep_token: &str) -> Vec<String> {
        let keep_hash = hash_token(keep_token);
        let removed: Vec<String> = self
            .by_user
            .get(username)
            .map(|set| set.iter().filter(|h| **h != keep_hash).cloned().collect())
            .unwrap_or_default();

        for hash in &removed {
            self.by_hash.remove(hash);
            if let Some(mut set) = self.by_user.get_mut(username) {
                set.remove(hash);
            }
        }
        if !removed.is_empty() {
            self.persist();
        }
        removed
    }

    /// Remove all expired records. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let expired: Vec<(String, String)> = self
            .by_hash
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| (e.key().clone(), e.value().username.clone()))
            .collect();

        let count = expired.len();
        for (hash, _) in &expired {
            self.remove_hash(hash);
        }
        if count > 0 {
            self.persist();
            debug!(count, "Swept expired sessions");
        }
        count
    }

    /// Hashes of currently live sessions (used to sweep orphan CSRF records).
    #[must_use]
    pub fn live_hashes(&self) -> HashSet<String> {
        self.by_hash.iter().map(|e| e.key().clone()).collect()
    }

    fn remove_hash(&self, hash: &str) -> Option<SessionRecord> {
        let (_, record) = self.by_hash.remove(hash)?;
        if let Some(mut set) = self.by_user.get_mut(&record.username) {
            set.remove(hash);
        }
        Some(record)
    }

    fn index_user(&self, username: &str, hash: &str) {
        self.by_user
            .entry(username.to_string())
            .or_default()
            .insert(hash.to_string());
    }

    fn persist(&self) {
        let records: Vec<SessionRecord> =
            self.by_hash.iter().map(|e| e.value().clone()).collect();
        if let Err(e) = persist::save_json(&self.file, &records) {
            warn!(error = %e, "Failed to persist sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path().join("sessions.json"));
        (dir, store)
    }

    #[test]
    fn token_is_64_hex_chars_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let token = generate_session_token();
            assert_eq!(token.len(), 64);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(token), "tokens must be unique");
        }
    }

    #[tokio::test]
    async fn create_then_validate() {
        let (_dir, store) = store();
        let token = generate_session_token();
        store.create(&token, Duration::from_secs(3600), "ua", "127.0.0.1", "admin");

        let record = store.validate(&token, None).await.unwrap();
        assert_eq!(record.username, "admin");
        assert_eq!(record.kind, SessionKind::Local);
    }

    #[tokio::test]
    async fn unknown_token_does_not_validate() {
        let (_dir, store) = store();
        assert!(store.validate("deadbeef", None).await.is_none());
    }

    #[tokio::test]
    async fn expired_session_is_evicted() {
        let (_dir, store) = store();
        let token = generate_session_token();
        store.create(&token, Duration::ZERO, "ua", "127.0.0.1", "admin");

        assert!(store.validate(&token, None).await.is_none());
        assert!(store.by_hash.is_empty());
    }

    #[tokio::test]
    async fn plaintext_token_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sessions.json");
        let store = SessionStore::load(file.clone());

        let token = generate_session_token();
        store.create(&token, Duration::from_secs(3600), "ua", "127.0.0.1", "admin");

        let raw = std::fs::read_to_string(&file).unwrap();
        assert!(!raw.contains(&token));
        assert!(raw.contains(&hash_token(&token)));
    }

    #[tokio::test]
    async fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sessions.json");

        let token = generate_session_token();
        {
            let store = SessionStore::load(file.clone());
            store.create(&token, Duration::from_secs(3600), "ua", "127.0.0.1", "admin");
        }

        let reloaded = SessionStore::load(file);
        assert!(reloaded.validate(&token, None).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_user_removes_all_their_sessions() {
        let (_dir, store) = store();
        let t1 = generate_session_token();
        let t2 = generate_session_token();
        let t3 = generate_session_token();
        store.create(&t1, Duration::from_secs(3600), "ua", "ip", "alice");
        store.create(&t2, Duration::from_secs(3600), "ua", "ip", "alice");
        store.create(&t3, Duration::from_secs(3600), "ua", "ip", "bob");

        let removed = store.invalidate_user("alice");
        assert_eq!(removed.len(), 2);
        assert!(store.validate(&t1, None).await.is_none());
        assert!(store.validate(&t2, None).await.is_none());
        assert!(store.validate(&t3, None).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_user_except_keeps_current() {
        let (_dir, store) = store();
        let keep = generate_session_token();
        let drop_me = generate_session_token();
        store.create(&keep, Duration::from_secs(3600), "ua", "ip", "admin");
        store.create(&drop_me, Duration::from_secs(3600), "ua", "ip", "admin");

        store.invalidate_user_except("admin", &keep);
        assert!(store.validate(&keep, None).await.is_some());
        assert!(store.validate(&drop_me, None).await.is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let (_dir, store) = store();
        let live = generate_session_token();
        let dead = generate_session_token();
        store.create(&live, Duration::from_secs(3600), "ua", "ip", "admin");
        store.create(&dead, Duration::ZERO, "ua", "ip", "admin");

        assert_eq!(store.sweep(), 1);
        assert!(store.validate(&live, None).await.is_some());
    }

    struct StaticRefresher {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl OidcRefresher for StaticRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<OidcTokens> {
            if self.fail {
                return Err(crate::Error::Internal("issuer down".to_string()));
            }
            Ok(OidcTokens::from_response(
                "renewed-access".to_string(),
                Some("renewed-refresh".to_string()),
                None,
                Some(3600),
            ))
        }
    }

    #[tokio::test]
    async fn oidc_session_refreshes_in_place() {
        let (_dir, store) = store();
        let token = generate_session_token();
        let stale = OidcTokens {
            access_token: "old".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            id_token: None,
            expires_at: Some(1), // long past
        };
        store.create_oidc(&token, Duration::from_secs(3600), "ua", "ip", "alice", stale);

        let refresher: Arc<dyn OidcRefresher> = Arc::new(StaticRefresher { fail: false });
        let record = store.validate(&token, Some(&refresher)).await.unwrap();

        let oidc = record.oidc.unwrap();
        assert_eq!(oidc.access_token, "renewed-access");
        // Same opaque token still validates: no rotation on refresh
        assert!(store.validate(&token, Some(&refresher)).await.is_some());
    }

    #[tokio::test]
    async fn oidc_refresh_failure_downgrades() {
        let (_dir, store) = store();
        let token = generate_session_token();
        let stale = OidcTokens {
            access_token: "old".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            id_token: None,
            expires_at: Some(1),
        };
        store.create_oidc(&token, Duration::from_secs(3600), "ua", "ip", "alice", stale);

        let refresher: Arc<dyn OidcRefresher> = Arc::new(StaticRefresher { fail: true });
        assert!(store.validate(&token, Some(&refresher)).await.is_none());
    }
}
