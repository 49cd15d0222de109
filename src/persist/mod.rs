//! Persistence substrate - data directory layout and restrictive-permission
//! JSON writes.
//!
//! Everything Pulse persists lives under one data directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `sessions.json` | session records keyed by token hash |
//! | `csrf.json` | per-session CSRF tokens |
//! | `config.json` | node instances, API tokens, runtime admin account |
//! | `.auth_recovery` | flag file: loopback auth bypass is active |
//! | `.bootstrap_token` | one-time first-run admin provisioning secret |
//!
//! Files are written 0600 via a temp-file rename; the directory itself is
//! created 0700.

pub mod nodes;

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::{Error, Result};

/// Resolved locations of everything Pulse persists.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Create the data directory (0700) and return the path set.
    pub fn new(root: PathBuf) -> Result<Self> {
        if !root.exists() {
            fs::create_dir_all(&root)
                .map_err(|e| Error::Config(format!("Cannot create data dir {}: {e}", root.display())))?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            let _ = fs::set_permissions(&root, perms);
        }

        Ok(Self { root })
    }

    /// Root of the data directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persisted session records.
    #[must_use]
    pub fn sessions_file(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    /// Persisted CSRF records.
    #[must_use]
    pub fn csrf_file(&self) -> PathBuf {
        self.root.join("csrf.json")
    }

    /// Node instances, API tokens and the runtime admin account.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Flag file: when present, direct loopback requests bypass auth.
    #[must_use]
    pub fn recovery_flag(&self) -> PathBuf {
        self.root.join(".auth_recovery")
    }

    /// One-time first-run provisioning secret.
    #[must_use]
    pub fn bootstrap_token_file(&self) -> PathBuf {
        self.root.join(".bootstrap_token")
    }
}

/// Write bytes to `path` with owner-only permissions, atomically.
///
/// The content lands in a sibling temp file first and is renamed into place,
/// so readers never observe a partial write.
pub fn write_secure(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");

    fs::write(&tmp, bytes)
        .map_err(|e| Error::Internal(format!("Failed to write {}: {e}", tmp.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(&tmp, perms);
    }

    fs::rename(&tmp, path)
        .map_err(|e| Error::Internal(format!("Failed to move {} into place: {e}", path.display())))?;

    Ok(())
}

/// Serialize `value` as pretty JSON and write it 0600.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    write_secure(path, &content)
}

/// Load JSON from `path`, tolerating absence and corruption.
///
/// A missing file returns `None` silently; a corrupt file returns `None`
/// with a warning so the process can start with empty state.
#[must_use]
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<T>(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Corrupt state file, starting empty");
                None
            }
        },
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Unreadable state file, starting empty");
            None
        }
    }
}
