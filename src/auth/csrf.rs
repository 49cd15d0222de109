//! Per-session CSRF tokens with constant-time verification.
//!
//! Mirrors the session store's shape: keyed by session hash, persisted under
//! the data directory, swept alongside sessions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::persist;

/// One CSRF token bound to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfRecord {
    /// Hash of the owning session
    pub session_hash: String,
    /// The token itself (echoed by the SPA as a header)
    pub token: String,
    /// Issue time
    pub issued_at: DateTime<Utc>,
}

/// Disk-backed CSRF token store, keyed by session hash.
pub struct CsrfStore {
    by_session: DashMap<String, CsrfRecord>,
    file: PathBuf,
}

impl CsrfStore {
    /// Load the store from `file`, starting empty when absent or corrupt.
    #[must_use]
    pub fn load(file: PathBuf) -> Self {
        let store = Self {
            by_session: DashMap::new(),
            file,
        };

        if let Some(records) = persist::load_json::<Vec<CsrfRecord>>(&store.file) {
            for record in records {
                store.by_session.insert(record.session_hash.clone(), record);
            }
        }

        store
    }

    /// Token for a session, issuing one if absent.
    pub fn issue(&self, session_hash: &str) -> String {
        if let Some(existing) = self.by_session.get(session_hash) {
            return existing.token.clone();
        }

        let bytes: [u8; 32] = rand::rng().random();
        let token = hex::encode(bytes);
        self.by_session.insert(
            session_hash.to_string(),
            CsrfRecord {
                session_hash: session_hash.to_string(),
                token: token.clone(),
                issued_at: Utc::now(),
            },
        );
        self.persist();
        token
    }

    /// Existing token for a session, if any.
    #[must_use]
    pub fn get(&self, session_hash: &str) -> Option<String> {
        self.by_session.get(session_hash).map(|r| r.token.clone())
    }

    /// Constant-time check of a presented token against the session's record.
    #[must_use]
    pub fn verify(&self, session_hash: &str, presented: &str) -> bool {
        let Some(record) = self.by_session.get(session_hash) else {
            return false;
        };
        record
            .token
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into()
    }

    /// Drop the record for a session (called when the session dies).
    pub fn remove(&self, session_hash: &str) {
        if self.by_session.remove(session_hash).is_some() {
            self.persist();
        }
    }

    /// Drop records whose session is no longer live.
    pub fn sweep(&self, live_sessions: &std::collections::HashSet<String>) -> usize {
        let orphans: Vec<String> = self
            .by_session
            .iter()
            .filter(|e| !live_sessions.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let count = orphans.len();
        for hash in orphans {
            self.by_session.remove(&hash);
        }
        if count > 0 {
            self.persist();
        }
        count
    }

    fn persist(&self) {
        let records: Vec<CsrfRecord> =
            self.by_session.iter().map(|e| e.value().clone()).collect();
        if let Err(e) = persist::save_json(&self.file, &records) {
            warn!(error = %e, "Failed to persist CSRF tokens");
        }
    }
}
