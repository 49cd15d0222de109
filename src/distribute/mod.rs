//! Agent binary distribution: install scripts, binaries per (platform,
//! arch), and cached SHA-256 checksums.
//!
//! Binaries are looked up across a fixed candidate list (configured bin dir,
//! project-local `bin/`, legacy image layout). Checksums are computed once
//! per `(path, mtime, size)` and invalidated when the file changes on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::SystemTime;

use axum::extract::{Extension, Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::server::router::AppState;
use crate::{Error, Result};

/// Artifacts this endpoint will serve at all.
const ARTIFACTS: &[&str] = &["pulse-host-agent", "pulse-docker-agent"];

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\-]+$").expect("static regex"));

/// Cached digest for one file state.
#[derive(Debug, Clone)]
struct CachedChecksum {
    sha256: String,
    mtime: SystemTime,
    size: u64,
}

/// Serves agent binaries with checksum caching.
pub struct BinaryDistributor {
    bin_dir: PathBuf,
    release_archive: Option<PathBuf>,
    checksums: DashMap<PathBuf, CachedChecksum>,
}

impl BinaryDistributor {
    /// Build over the configured binary directory.
    #[must_use]
    pub fn new(bin_dir: PathBuf, release_archive: Option<PathBuf>) -> Self {
        Self {
            bin_dir,
            release_archive,
            checksums: DashMap::new(),
        }
    }

    /// Candidate paths for an artifact, in search order.
    fn candidates(&self, artifact: &str, platform: &str, arch: &str) -> Vec<PathBuf> {
        let qualified = format!("{artifact}-{platform}-{arch}");
        let mut paths = vec![
            self.bin_dir.join(&qualified),
            self.bin_dir.join(artifact),
            PathBuf::from("bin").join(&qualified),
            PathBuf::from("bin").join(artifact),
            PathBuf::from("/opt/pulse/bin").join(artifact),
        ];

        if platform.eq_ignore_ascii_case("windows") {
            let with_exe: Vec<PathBuf> = paths
                .iter()
                .map(|p| {
                    let mut s = p.clone().into_os_string();
                    s.push(".exe");
                    PathBuf::from(s)
                })
                .collect();
            // Prefer the .exe variants, keep the bare names as fallback
            let mut combined = with_exe;
            combined.extend(paths);
            paths = combined;
        }
        paths
    }

    /// Resolve an artifact to an on-disk path.
    ///
    /// On a miss, tries to restore the file from the bundled release
    /// archive; the final error lists every path checked.
    pub async fn resolve(&self, artifact: &str, platform: &str, arch: &str) -> Result<PathBuf> {
        if !ARTIFACTS.contains(&artifact) {
            return Err(Error::NotFound(format!("unknown artifact {artifact}")));
        }
        if !IDENT_RE.is_match(platform) || !IDENT_RE.is_match(arch) {
            return Err(Error::validation(
                "invalid_platform",
                "platform and arch must match ^[a-zA-Z0-9-]+$",
            ));
        }

        let candidates = self.candidates(artifact, platform, arch);
        for path in &candidates {
            if path.is_file() {
                return Ok(path.clone());
            }
        }

        if self.restore_from_archive(artifact).await {
            for path in &candidates {
                if path.is_file() {
                    return Ok(path.clone());
                }
            }
        }

        let listing = candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::NotFound(format!(
            "{artifact} not found; checked: {listing}"
        )))
    }

    /// Try to extract the artifact from the bundled release archive.
    async fn restore_from_archive(&self, artifact: &str) -> bool {
        let Some(ref archive) = self.release_archive else {
            return false;
        };
        if !archive.is_file() {
            debug!(archive = %archive.display(), "No release archive to restore from");
            return false;
        }

        info!(artifact = %artifact, archive = %archive.display(), "Restoring binary from release archive");
        let result = tokio::process::Command::new("tar")
            .arg("-xzf")
            .arg(archive)
            .arg("-C")
            .arg(&self.bin_dir)
            .arg(artifact)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    artifact = %artifact,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "Archive restore failed"
                );
                false
            }
            Err(e) => {
                warn!(artifact = %artifact, error = %e, "Archive restore failed");
                false
            }
        }
    }

    /// SHA-256 hex digest of a file, cached per `(path, mtime, size)`.
    pub async fn checksum(&self, path: &Path) -> Result<String> {
        let metadata = tokio::fs::metadata(path).await?;
        let mtime = metadata.modified()?;
        let size = metadata.len();

        if let Some(cached) = self.checksums.get(path) {
            if cached.mtime == mtime && cached.size == size {
                return Ok(cached.sha256.clone());
            }
        }

        let bytes = tokio::fs::read(path).await?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let sha256 = hex::encode(hasher.finalize());

        self.checksums.insert(
            path.to_path_buf(),
            CachedChecksum {
                sha256: sha256.clone(),
                mtime,
                size,
            },
        );
        Ok(sha256)
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadQuery {
    #[serde(default = "default_platform")]
    platform: String,
    #[serde(default = "default_arch")]
    arch: String,
}

fn default_platform() -> String {
    "linux".to_string()
}

fn default_arch() -> String {
    "amd64".to_string()
}

/// `GET /download/{artifact}` — serve a binary (with `X-Checksum-Sha256`)
/// or, for `{artifact}.sha256`, the hex digest as text.
pub(crate) async fn download(
    State(state): State<Arc<AppState>>,
    UrlPath(artifact): UrlPath<String>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let distributor = &state.distributor;

    if let Some(base) = artifact.strip_suffix(".sha256") {
        return match checksum_for(distributor, base, &query).await {
            Ok(sha256) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                sha256,
            )
                .into_response(),
            Err(e) => e.into_response(),
        };
    }

    let path = match distributor.resolve(&artifact, &query.platform, &query.arch).await {
        Ok(path) => path,
        Err(e) => return e.into_response(),
    };

    let sha256 = match distributor.checksum(&path).await {
        Ok(sha256) => sha256,
        Err(e) => return e.into_response(),
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mut response = (StatusCode::OK, bytes).into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/octet-stream"),
            );
            if let Ok(value) = header::HeaderValue::from_str(&sha256) {
                headers.insert("x-checksum-sha256", value);
            }
            if let Ok(value) = header::HeaderValue::from_str(&format!(
                "attachment; filename=\"{artifact}\""
            )) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
            response
        }
        Err(e) => Error::Io(e).into_response(),
    }
}

async fn checksum_for(
    distributor: &BinaryDistributor,
    artifact: &str,
    query: &DownloadQuery,
) -> Result<String> {
    let path = distributor
        .resolve(artifact, &query.platform, &query.arch)
        .await?;
    distributor.checksum(&path).await
}

/// `GET /install-host-agent.sh` — Linux host agent installer.
pub(crate) async fn install_host_script(
    state: State<Arc<AppState>>,
    meta: Extension<crate::server::net::RequestMeta>,
    headers: HeaderMap,
) -> Response {
    install_script(state, meta, headers, "install-host-agent.sh").await
}

/// `GET /install-docker-agent.sh` — Docker agent installer.
pub(crate) async fn install_docker_script(
    state: State<Arc<AppState>>,
    meta: Extension<crate::server::net::RequestMeta>,
    headers: HeaderMap,
) -> Response {
    install_script(state, meta, headers, "install-docker-agent.sh").await
}

/// `GET /install.ps1` — Windows host agent installer.
pub(crate) async fn install_ps1_script(
    state: State<Arc<AppState>>,
    meta: Extension<crate::server::net::RequestMeta>,
    headers: HeaderMap,
) -> Response {
    install_script(state, meta, headers, "install.ps1").await
}

/// Templated agent install scripts pointing back at this Pulse instance.
async fn install_script(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<crate::server::net::RequestMeta>,
    headers: HeaderMap,
    script: &str,
) -> Response {
    let artifact = match script {
        "install-host-agent.sh" => "pulse-host-agent",
        "install-docker-agent.sh" => "pulse-docker-agent",
        "install.ps1" => "pulse-host-agent",
        _ => return Error::NotFound(format!("unknown script {script}")).into_response(),
    };

    let base_url = state.public_url.current().unwrap_or_else(|| {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost:7655");
        let scheme = if meta.secure { "https" } else { "http" };
        format!("{scheme}://{host}")
    });

    let body = if script.ends_with(".ps1") {
        render_powershell_installer(&base_url, artifact)
    } else {
        render_shell_installer(&base_url, artifact)
    };

    let content_type = if script.ends_with(".ps1") {
        "text/plain"
    } else {
        "text/x-shellscript"
    };

    (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
}

fn render_shell_installer(base_url: &str, artifact: &str) -> String {
    format!(
        r#"#!/bin/sh
# Pulse agent installer
set -eu

PULSE_URL="{base_url}"
ARTIFACT="{artifact}"
PLATFORM="linux"

case "$(uname -m)" in
    x86_64) ARCH="amd64" ;;
    aarch64) ARCH="arm64" ;;
    armv7l) ARCH="armv7" ;;
    *) echo "unsupported architecture: $(uname -m)" >&2; exit 1 ;;
esac

echo "Downloading $ARTIFACT ($PLATFORM/$ARCH) from $PULSE_URL ..."
curl -fsSL -o "/usr/local/bin/$ARTIFACT" \
    "$PULSE_URL/download/$ARTIFACT?platform=$PLATFORM&arch=$ARCH"

EXPECTED="$(curl -fsSL "$PULSE_URL/download/$ARTIFACT.sha256?platform=$PLATFORM&arch=$ARCH")"
ACTUAL="$(sha256sum "/usr/local/bin/$ARTIFACT" | awk '{{print $1}}')"
if [ "$EXPECTED" != "$ACTUAL" ]; then
    echo "checksum mismatch: expected $EXPECTED got $ACTUAL" >&2
    rm -f "/usr/local/bin/$ARTIFACT"
    exit 1
fi

chmod 0755 "/usr/local/bin/$ARTIFACT"
echo "$ARTIFACT installed. Configure it with PULSE_URL=$PULSE_URL and an API token."
"#
    )
}

fn render_powershell_installer(base_url: &str, artifact: &str) -> String {
    format!(
        r#"# Pulse agent installer (Windows)
$ErrorActionPreference = "Stop"

$PulseUrl = "{base_url}"
$Artifact = "{artifact}"
$Arch = if ([Environment]::Is64BitOperatingSystem) {{ "amd64" }} else {{ "386" }}
$Dest = "$env:ProgramFiles\Pulse\$Artifact.exe"

New-Item -ItemType Directory -Force -Path (Split-Path $Dest) | Out-Null
Invoke-WebRequest -Uri "$PulseUrl/download/$Artifact`?platform=windows`&arch=$Arch" -OutFile $Dest

$Expected = (Invoke-WebRequest -Uri "$PulseUrl/download/$Artifact.sha256`?platform=windows`&arch=$Arch").Content.Trim()
$Actual = (Get-FileHash -Algorithm SHA256 $Dest).Hash.ToLower()
if ($Expected -ne $Actual) {{
    Remove-Item $Dest
    throw "checksum mismatch: expected $Expected got $Actual"
}}

Write-Host "$Artifact installed to $Dest"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn distributor(dir: &Path) -> BinaryDistributor {
        BinaryDistributor::new(dir.to_path_buf(), None)
    }

    #[tokio::test]
    async fn resolves_platform_qualified_binary_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pulse-host-agent-linux-amd64"), b"qualified").unwrap();
        fs::write(dir.path().join("pulse-host-agent"), b"plain").unwrap();

        let d = distributor(dir.path());
        let path = d.resolve("pulse-host-agent", "linux", "amd64").await.unwrap();
        assert!(path.ends_with("pulse-host-agent-linux-amd64"));
    }

    #[tokio::test]
    async fn falls_back_to_unqualified_binary() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pulse-host-agent"), b"plain").unwrap();

        let d = distributor(dir.path());
        let path = d.resolve("pulse-host-agent", "linux", "arm64").await.unwrap();
        assert!(path.ends_with("pulse-host-agent"));
    }

    #[tokio::test]
    async fn rejects_traversal_in_arch() {
        let dir = tempfile::tempdir().unwrap();
        let d = distributor(dir.path());

        let err = d
            .resolve("pulse-host-agent", "linux", "../etc/passwd")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { code: "invalid_platform", .. }));
    }

    #[tokio::test]
    async fn rejects_unknown_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let d = distributor(dir.path());
        assert!(matches!(
            d.resolve("etc-passwd", "linux", "amd64").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn missing_binary_error_lists_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let d = distributor(dir.path());

        let err = d
            .resolve("pulse-host-agent", "linux", "amd64")
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("pulse-host-agent-linux-amd64"));
        assert!(message.contains("/opt/pulse/bin"));
    }

    #[tokio::test]
    async fn windows_prefers_exe_suffix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pulse-host-agent-windows-amd64.exe"), b"exe").unwrap();

        let d = distributor(dir.path());
        let path = d
            .resolve("pulse-host-agent", "windows", "amd64")
            .await
            .unwrap();
        assert!(path.extension().is_some_and(|e| e == "exe"));
    }

    #[tokio::test]
    async fn checksum_matches_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pulse-host-agent");
        fs::write(&file, b"agent bytes").unwrap();

        let d = distributor(dir.path());
        let first = d.checksum(&file).await.unwrap();

        let mut hasher = Sha256::new();
        hasher.update(b"agent bytes");
        assert_eq!(first, hex::encode(hasher.finalize()));

        // Cached on identical stat
        let second = d.checksum(&file).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(d.checksums.len(), 1);
    }

    #[tokio::test]
    async fn checksum_invalidated_on_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pulse-host-agent");
        fs::write(&file, b"version one").unwrap();

        let d = distributor(dir.path());
        let first = d.checksum(&file).await.unwrap();

        fs::write(&file, b"version two, longer").unwrap();
        let second = d.checksum(&file).await.unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn installer_scripts_embed_base_url() {
        let sh = render_shell_installer("https://pulse.example.com", "pulse-host-agent");
        assert!(sh.contains(r#"PULSE_URL="https://pulse.example.com""#));
        assert!(sh.contains("sha256sum"));

        let ps1 = render_powershell_installer("https://pulse.example.com", "pulse-host-agent");
        assert!(ps1.contains("Get-FileHash"));
    }
}
