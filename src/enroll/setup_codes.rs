//! One-shot setup codes for install-script-driven enrollment.
//!
//! An admin issuing an install command gets a 16-byte hex code with a
//! 5-minute TTL. Redemption flips the code to used and opens a 60-second
//! grace window (in-memory only) during which follow-up script actions,
//! like re-fetching the install script, still authenticate. A used or
//! expired code never registers a node again.
//!
//! All three operations (lookup, used-flip, grace bookkeeping) run under one
//! mutex so a code cannot be redeemed twice by racing requests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngExt;
use tracing::debug;

use crate::auth::session::hash_token;
use crate::persist::nodes::NodeKind;
use crate::{Error, Result};

/// Setup codes live this long.
pub const SETUP_CODE_TTL: Duration = Duration::from_secs(5 * 60);
/// Post-redemption grace for follow-up actions.
const GRACE_WINDOW: Duration = Duration::from_secs(60);

/// One issued code, keyed in the vault by its hash.
#[derive(Debug, Clone)]
struct SetupCode {
    expires_at: Instant,
    used: bool,
    node_type: NodeKind,
    host: Option<String>,
    org_id: Option<String>,
}

/// What a redeemed code was issued for.
#[derive(Debug, Clone)]
pub struct SetupCodeClaims {
    /// Node kind the code was bound to
    pub node_type: NodeKind,
    /// Host the admin targeted, if given at issue time
    pub host: Option<String>,
    /// Organization attached by the issuing admin
    pub org_id: Option<String>,
}

struct Inner {
    codes: HashMap<String, SetupCode>,
    grace: HashMap<String, Instant>,
}

/// Vault of one-shot setup codes.
pub struct SetupCodeVault {
    inner: Mutex<Inner>,
}

impl SetupCodeVault {
    /// Create an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                codes: HashMap::new(),
                grace: HashMap::new(),
            }),
        }
    }

    /// Issue a new code bound to `node_type`. Returns the plaintext code,
    /// which is never stored.
    pub fn issue(
        &self,
        node_type: NodeKind,
        host: Option<String>,
        org_id: Option<String>,
    ) -> String {
        let bytes: [u8; 16] = rand::rng().random();
        let code = hex::encode(bytes);

        self.inner.lock().codes.insert(
            hash_token(&code),
            SetupCode {
                expires_at: Instant::now() + SETUP_CODE_TTL,
                used: false,
                node_type,
                host,
                org_id,
            },
        );
        code
    }

    /// Redeem a code for enrollment: it must be unused, unexpired and bound
    /// to the same node type. Success flips it to used and opens the grace
    /// window.
    pub fn redeem(&self, code: &str, node_type: NodeKind) -> Result<SetupCodeClaims> {
        let hash = hash_token(code);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let Some(entry) = inner.codes.get_mut(&hash) else {
            return Err(Error::Unauthorized);
        };
        if entry.used || now >= entry.expires_at || entry.node_type != node_type {
            return Err(Error::Unauthorized);
        }

        entry.used = true;
        let claims = SetupCodeClaims {
            node_type: entry.node_type,
            host: entry.host.clone(),
            org_id: entry.org_id.clone(),
        };
        inner.grace.insert(hash, now + GRACE_WINDOW);
        debug!(node_type = %claims.node_type, "Setup code redeemed");
        Ok(claims)
    }

    /// Whether a code authorizes fetching the install script: valid and
    /// unused, or inside the post-redemption grace window.
    #[must_use]
    pub fn script_fetch_allowed(&self, code: &str) -> bool {
        let hash = hash_token(code);
        let now = Instant::now();
        let inner = self.inner.lock();

        if let Some(entry) = inner.codes.get(&hash) {
            if !entry.used && now < entry.expires_at {
                return true;
            }
        }
        inner.grace.get(&hash).is_some_and(|until| now < *until)
    }

    /// Drop expired codes and stale grace entries.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let before = inner.codes.len() + inner.grace.len();
        inner.grace.retain(|_, until| *until > now);
        // Used codes stay until their grace is gone so replays fail fast
        // with the same path as expired ones.
        let grace = std::mem::take(&mut inner.grace);
        inner
            .codes
            .retain(|hash, code| now < code.expires_at || grace.contains_key(hash));
        inner.grace = grace;

        before - (inner.codes.len() + inner.grace.len())
    }
}

impl Default for SetupCodeVault {
    fn default() -> Self {
        Self::new()
    }
}
