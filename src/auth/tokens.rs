//! API token registry with scope-based RBAC.
//!
//! Token records live in `config.json` beside the node instances; every
//! mutation goes through the global configuration mutex. The plaintext
//! secret is returned exactly once at creation; lookups compare SHA-256
//! hashes in constant time.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rand::RngExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::persist::nodes::{ConfigStore, TokenRecord};
use crate::{Error, Result};

/// Closed set of capabilities an API token can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Read monitoring state
    MonitoringRead,
    /// Mutate monitoring state
    MonitoringWrite,
    /// Read settings
    SettingsRead,
    /// Mutate settings (implied by admin tokens)
    SettingsWrite,
    /// Docker agents reporting in
    DockerReport,
    /// Manage docker agents
    DockerManage,
    /// Kubernetes agents reporting in
    KubernetesReport,
    /// Manage kubernetes agents
    KubernetesManage,
    /// Host agents reporting in
    HostReport,
    /// Read host agent configuration
    HostConfigRead,
    /// Manage host agents
    HostManage,
    /// Execute commands through agents
    AgentExec,
}

impl Scope {
    /// Every scope, for validation and listings.
    pub const ALL: &'static [Scope] = &[
        Self::MonitoringRead,
        Self::MonitoringWrite,
        Self::SettingsRead,
        Self::SettingsWrite,
        Self::DockerReport,
        Self::DockerManage,
        Self::KubernetesReport,
        Self::KubernetesManage,
        Self::HostReport,
        Self::HostConfigRead,
        Self::HostManage,
        Self::AgentExec,
    ];

    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MonitoringRead => "monitoring:read",
            Self::MonitoringWrite => "monitoring:write",
            Self::SettingsRead => "settings:read",
            Self::SettingsWrite => "settings:write",
            Self::DockerReport => "docker:report",
            Self::DockerManage => "docker:manage",
            Self::KubernetesReport => "kubernetes:report",
            Self::KubernetesManage => "kubernetes:manage",
            Self::HostReport => "host:report",
            Self::HostConfigRead => "host:config-read",
            Self::HostManage => "host:manage",
            Self::AgentExec => "agent:exec",
        }
    }

    /// Parse a wire value; the set is closed, anything else is rejected.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token validated from a request header, with its granted scopes attached.
#[derive(Debug, Clone)]
pub struct ValidatedToken {
    /// The matching persisted record (hash included; never serialized out)
    pub record: TokenRecord,
}

impl ValidatedToken {
    /// Whether the token carries `scope`.
    #[must_use]
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.record.scopes.iter().any(|s| s == scope.as_str())
    }

    /// Error unless the token carries `scope`.
    pub fn require_scope(&self, scope: Scope) -> Result<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(Error::MissingScope(scope.as_str().to_string()))
        }
    }
}

/// Registry over the token records in [`ConfigStore`].
#[derive(Clone)]
pub struct TokenRegistry {
    store: Arc<ConfigStore>,
}

/// Outcome of creating a token: the persisted record plus the plaintext,
/// which is never recoverable afterwards.
#[derive(Debug)]
pub struct CreatedToken {
    /// Persisted record (hash + hint)
    pub record: TokenRecord,
    /// Plaintext secret, returned exactly once
    pub plaintext: String,
}

impl TokenRegistry {
    /// Wrap the shared configuration store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Create a token named `name` with `scopes`.
    ///
    /// Duplicate names conflict. Unknown scopes are rejected before any
    /// state changes.
    pub async fn create(&self, name: &str, scopes: &[String]) -> Result<CreatedToken> {
        if name.trim().is_empty() {
            return Err(Error::validation("invalid_token_name", "Token name is required"));
        }
        for scope in scopes {
            if Scope::parse(scope).is_none() {
                return Err(Error::validation(
                    "invalid_scope",
                    format!("Unknown scope: {scope}"),
                ));
            }
        }

        let plaintext = generate_token_secret();
        let record = TokenRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            hash: hash_secret(&plaintext),
            scopes: scopes.to_vec(),
            created_at: Utc::now(),
            hint: display_hint(&plaintext),
        };

        let stored = record.clone();
        let name_owned = name.to_string();
        self.store
            .update(move |config| {
                if config.api_tokens.iter().any(|t| t.name == name_owned) {
                    return Err(Error::Conflict(format!(
                        "A token named '{name_owned}' already exists"
                    )));
                }
                config.api_tokens.push(stored);
                Ok(())
            })
            .await?;

        Ok(CreatedToken { record, plaintext })
    }

    /// Validate a presented secret against every record, in constant time
    /// per comparison.
    pub async fn validate(&self, presented: &str) -> Option<ValidatedToken> {
        let presented_hash = hash_secret(presented);
        self.store
            .read(|config| {
                config
                    .api_tokens
                    .iter()
                    .find(|t| {
                        bool::from(
                            t.hash
                                .as_bytes()
                                .ct_eq(presented_hash.as_bytes()),
                        )
                    })
                    .cloned()
            })
            .await
            .map(|record| ValidatedToken { record })
    }

    /// All records, with hashes blanked for listing.
    pub async fn list(&self) -> Vec<TokenRecord> {
        self.store
            .read(|config| {
                config
                    .api_tokens
                    .iter()
                    .map(|t| {
                        let mut out = t.clone();
                        out.hash = String::new();
                        out
                    })
                    .collect()
            })
            .await
    }

    /// Delete a token by id. Returns its name.
    pub async fn delete(&self, id: &str) -> Result<String> {
        let id_owned = id.to_string();
        let name = self
            .store
            .update(move |config| {
                let Some(pos) = config.api_tokens.iter().position(|t| t.id == id_owned) else {
                    return Err(Error::NotFound(format!("token {id_owned}")));
                };
                Ok(config.api_tokens.remove(pos).name)
            })
            .await?;

        Ok(name)
    }
}

/// Generate an API token secret: `pulse_` + 32 random bytes hex.
/// The prefix keeps tokens greppable and detectable by secret scanners.
#[must_use]
pub fn generate_token_secret() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    format!("pulse_{}", hex::encode(bytes))
}

/// SHA-256 hex of a token secret.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Non-sensitive fragment shown in the UI: prefix and last four characters.
fn display_hint(plaintext: &str) -> String {
    let tail: String = plaintext
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("pulse_…{tail}")
}
