//! Persisted control-plane configuration: node instances, API token records
//! and the runtime admin account.
//!
//! All mutations flow through [`ConfigStore::update`], which serializes them
//! behind one async mutex, persists to `config.json`, rolls the in-memory
//! state back if the write fails, and fires the reload hook after a durable
//! write.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

/// Kind of enrolled node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Proxmox Virtual Environment
    Pve,
    /// Proxmox Backup Server
    Pbs,
}

impl NodeKind {
    /// Default API port for this node kind.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Pve => 8006,
            Self::Pbs => 8007,
        }
    }

    /// Parse from the wire value (`pve` / `pbs`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pve" => Some(Self::Pve),
            "pbs" => Some(Self::Pbs),
            _ => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pve => write!(f, "pve"),
            Self::Pbs => write!(f, "pbs"),
        }
    }
}

/// How an instance entered the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnrollSource {
    /// Install-script driven auto-registration
    Script,
    /// Host/container agent self-report
    Agent,
    /// Added by hand in the UI
    #[default]
    Manual,
}

/// Which resource classes Pulse polls on this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorFlags {
    /// Poll virtual machines
    pub vms: bool,
    /// Poll containers
    pub containers: bool,
    /// Poll storage
    pub storage: bool,
    /// Poll backup tasks
    pub backups: bool,
}

impl Default for MonitorFlags {
    fn default() -> Self {
        Self {
            vms: true,
            containers: true,
            storage: true,
            backups: true,
        }
    }
}

/// Alternate reachable address for a clustered Proxmox node, grouped under
/// one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEndpoint {
    /// Cluster-internal node name
    pub node_name: String,
    /// Reachable URL for that node
    pub host_url: String,
}

/// A configured PVE or PBS server (optionally a cluster with multiple
/// endpoints).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInstance {
    /// Display name; for clusters, the cluster name
    pub name: String,
    /// Normalized `https://host:port` URL
    pub host_url: String,
    /// Proxmox API token id (e.g. `pulse-monitor@pam!pulse`)
    pub token_id: String,
    /// Proxmox API token secret
    pub token_value: String,
    /// Verify the node's TLS certificate
    pub verify_tls: bool,
    /// Resource classes to poll
    #[serde(default)]
    pub monitor: MonitorFlags,
    /// This instance fronts a cluster
    #[serde(default)]
    pub is_cluster: bool,
    /// Cluster name when `is_cluster`
    #[serde(default)]
    pub cluster_name: Option<String>,
    /// Endpoints of the cluster, including the primary
    #[serde(default)]
    pub cluster_endpoints: Vec<ClusterEndpoint>,
    /// TLS certificate fingerprint captured at enrollment
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// How this instance was added
    #[serde(default)]
    pub source: EnrollSource,
    /// Set when the instance arrived through auto-registration
    #[serde(default)]
    pub auto_registered: bool,
}

/// Persisted API token record. The plaintext secret is never stored; `hash`
/// is its SHA-256 and `hint` a non-sensitive display fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    /// Stable identifier
    pub id: String,
    /// Unique display name
    pub name: String,
    /// SHA-256 hex of the plaintext token
    pub hash: String,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Display hint (prefix…suffix of the plaintext)
    pub hint: String,
}

/// Runtime-provisioned admin account (quick-setup / change-password).
/// Takes precedence over the hash in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminAccount {
    /// Admin username
    pub username: String,
    /// bcrypt hash of the admin password
    pub password_hash: String,
}

/// Everything persisted in `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlConfig {
    /// Runtime admin account, if provisioned
    pub admin: Option<AdminAccount>,
    /// Configured PVE instances
    pub pve_instances: Vec<NodeInstance>,
    /// Configured PBS instances
    pub pbs_instances: Vec<NodeInstance>,
    /// API token records
    pub api_tokens: Vec<TokenRecord>,
}

impl ControlConfig {
    /// Instances of the given kind.
    #[must_use]
    pub fn instances(&self, kind: NodeKind) -> &Vec<NodeInstance> {
        match kind {
            NodeKind::Pve => &self.pve_instances,
            NodeKind::Pbs => &self.pbs_instances,
        }
    }

    /// Mutable instances of the given kind.
    pub fn instances_mut(&mut self, kind: NodeKind) -> &mut Vec<NodeInstance> {
        match kind {
            NodeKind::Pve => &mut self.pve_instances,
            NodeKind::Pbs => &mut self.pbs_instances,
        }
    }
}

/// Hook invoked after any durable configuration change so the monitoring
/// side can reinitialize its pollers.
pub type ReloadHook = Arc<dyn Fn() + Send + Sync>;

/// Mutex-serialized, disk-backed owner of [`ControlConfig`].
pub struct ConfigStore {
    file: PathBuf,
    inner: tokio::sync::Mutex<ControlConfig>,
    reload_hook: parking_lot::RwLock<Option<ReloadHook>>,
}

impl ConfigStore {
    /// Load the store from `file`, starting empty when absent or corrupt.
    #[must_use]
    pub fn load(file: PathBuf) -> Self {
        let config: ControlConfig = super::load_json(&file).unwrap_or_default();
        debug!(
            pve = config.pve_instances.len(),
            pbs = config.pbs_instances.len(),
            tokens = config.api_tokens.len(),
            "Loaded control configuration"
        );
        Self {
            file,
            inner: tokio::sync::Mutex::new(config),
            reload_hook: parking_lot::RwLock::new(None),
        }
    }

    /// Register the reload hook. It runs on a spawned task after each
    /// durable write so HTTP responses are not blocked by reinitialization.
    pub fn set_reload_hook(&self, hook: ReloadHook) {
        *self.reload_hook.write() = Some(hook);
    }

    /// Read access under the config mutex.
    pub async fn read<R>(&self, f: impl FnOnce(&ControlConfig) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// Clone of the current configuration.
    pub async fn snapshot(&self) -> ControlConfig {
        self.inner.lock().await.clone()
    }

    /// Apply a mutation, persist it, and fire the reload hook.
    ///
    /// In-memory state is updated before persistence; if the write fails the
    /// mutation is rolled back and the error returned. Reload-hook failures
    /// cannot undo a durable write and are only logged.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut ControlConfig) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.inner.lock().await;
        let before = guard.clone();

        let outcome = match f(&mut guard) {
            Ok(value) => value,
            Err(e) => {
                *guard = before;
                return Err(e);
            }
        };

        if let Err(e) = super::save_json(&self.file, &*guard) {
            warn!(error = %e, "Persisting configuration failed, rolling back");
            *guard = before;
            return Err(e);
        }
        drop(guard);

        self.fire_reload();
        Ok(outcome)
    }

    fn fire_reload(&self) {
        if let Some(hook) = self.reload_hook.read().clone() {
            tokio::spawn(async move {
                hook();
            });
        }
    }
}
