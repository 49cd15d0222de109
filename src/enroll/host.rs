//! Host URL normalization and the opportunistic TLS fingerprint probe.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;

use crate::persist::nodes::NodeKind;
use crate::{Error, Result};

/// Characters a host (with optional port, IPv6 brackets allowed) may contain.
static HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._:\[\]-]+$").expect("static regex"));

/// Normalize a host the way enrollment stores it: strip any scheme, add the
/// kind's default API port when absent, re-attach `https://`.
pub fn normalize_host(raw: &str, kind: NodeKind) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let bare = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);

    if bare.is_empty() {
        return Err(Error::validation("missing_host_id", "Host is required"));
    }
    if !HOST_RE.is_match(bare) {
        return Err(Error::validation(
            "invalid_host",
            format!("Host contains invalid characters: {bare}"),
        ));
    }

    let with_port = if has_port(bare) {
        bare.to_string()
    } else {
        format!("{bare}:{}", kind.default_port())
    };

    Ok(format!("https://{with_port}"))
}

/// Whether `host` already carries an explicit port.
fn has_port(host: &str) -> bool {
    if let Some(rest) = host.strip_prefix('[') {
        // IPv6: a port only counts after the closing bracket
        return rest
            .split_once(']')
            .is_some_and(|(_, tail)| tail.starts_with(':'));
    }
    match host.rsplit_once(':') {
        // A second colon means bare IPv6, not host:port
        Some((head, tail)) => !head.contains(':') && tail.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Host part of a normalized URL, without scheme, port or brackets.
#[must_use]
pub fn bare_host(host_url: &str) -> String {
    let stripped = host_url
        .strip_prefix("https://")
        .or_else(|| host_url.strip_prefix("http://"))
        .unwrap_or(host_url);

    if let Some(rest) = stripped.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest).to_string();
    }
    match stripped.rsplit_once(':') {
        Some((head, tail)) if !head.contains(':') && tail.parse::<u16>().is_ok() => {
            head.to_string()
        }
        _ => stripped.to_string(),
    }
}

/// `(host, port)` of a normalized URL.
pub fn host_and_port(host_url: &str, kind: NodeKind) -> (String, u16) {
    let stripped = host_url
        .strip_prefix("https://")
        .or_else(|| host_url.strip_prefix("http://"))
        .unwrap_or(host_url);

    let host = bare_host(host_url);
    let port = stripped
        .rsplit_once(':')
        .and_then(|(head, tail)| {
            (!head.ends_with(':') || head.contains(']')).then(|| tail.parse::<u16>().ok())
        })
        .flatten()
        .unwrap_or_else(|| kind.default_port());
    (host, port)
}

// ── TLS fingerprint probe ─────────────────────────────────────────────────

/// Verifier that accepts any certificate: the probe's whole purpose is to
/// read the certificate a node currently presents, trusted or not.
#[derive(Debug)]
struct AnyCertCapture(rustls::crypto::CryptoProvider);

impl ServerCertVerifier for AnyCertCapture {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Connect to `host_url` and capture the SHA-256 fingerprint of the leaf
/// certificate, formatted the way Proxmox displays it
/// (`AA:BB:...`, uppercase hex pairs).
pub async fn probe_fingerprint(
    host_url: &str,
    kind: NodeKind,
    timeout: Duration,
) -> Result<String> {
    let (host, port) = host_and_port(host_url, kind);

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyCertCapture(
            rustls::crypto::aws_lc_rs::default_provider(),
        )))
        .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let tcp = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| Error::Internal(format!("TLS probe timed out connecting to {host}:{port}")))?
        .map_err(Error::Io)?;

    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| Error::Internal(format!("Invalid server name {host}: {e}")))?;

    let tls = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| Error::Internal(format!("TLS handshake timed out with {host}:{port}")))?
        .map_err(Error::Io)?;

    let (_, session) = tls.get_ref();
    let cert = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| Error::Internal(format!("{host}:{port} presented no certificate")))?;

    let mut hasher = Sha256::new();
    hasher.update(cert.as_ref());
    let digest = hasher.finalize();

    Ok(digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scheme_and_adds_default_port() {
        assert_eq!(
            normalize_host("https://192.0.2.10:8006", NodeKind::Pve).unwrap(),
            "https://192.0.2.10:8006"
        );
        assert_eq!(
            normalize_host("192.0.2.10", NodeKind::Pve).unwrap(),
            "https://192.0.2.10:8006"
        );
        assert_eq!(
            normalize_host("http://pbs.lan/", NodeKind::Pbs).unwrap(),
            "https://pbs.lan:8007"
        );
        assert_eq!(
            normalize_host("pve-a.lan:9999", NodeKind::Pve).unwrap(),
            "https://pve-a.lan:9999"
        );
    }

    #[test]
    fn rejects_invalid_hosts() {
        assert!(normalize_host("", NodeKind::Pve).is_err());
        assert!(normalize_host("https://", NodeKind::Pve).is_err());
        assert!(normalize_host("host name", NodeKind::Pve).is_err());
        assert!(normalize_host("host;rm -rf /", NodeKind::Pve).is_err());
        assert!(normalize_host("host$(id)", NodeKind::Pve).is_err());
    }

    #[test]
    fn ipv6_hosts() {
        assert_eq!(
            normalize_host("[2001:db8::1]", NodeKind::Pve).unwrap(),
            "https://[2001:db8::1]:8006"
        );
        assert_eq!(
            normalize_host("[2001:db8::1]:8443", NodeKind::Pve).unwrap(),
            "https://[2001:db8::1]:8443"
        );
    }

    #[test]
    fn bare_host_extraction() {
        assert_eq!(bare_host("https://pve-a.lan:8006"), "pve-a.lan");
        assert_eq!(bare_host("https://192.0.2.10:8006"), "192.0.2.10");
        assert_eq!(bare_host("https://[2001:db8::1]:8006"), "2001:db8::1");
    }

    #[test]
    fn host_and_port_extraction() {
        assert_eq!(
            host_and_port("https://pve-a.lan:8443", NodeKind::Pve),
            ("pve-a.lan".to_string(), 8443)
        );
        assert_eq!(
            host_and_port("https://pve-a.lan", NodeKind::Pve),
            ("pve-a.lan".to_string(), 8006)
        );
    }
}
