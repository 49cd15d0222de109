//! Connection metadata: client IP resolution, forwarded-header parsing,
//! secure-connection detection and cookie attribute computation.
//!
//! Forwarded headers are only believed when the TCP peer is in the
//! configured trusted-proxy set; everything else falls back to the socket
//! address.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

/// Plain IPs or CIDR blocks allowed to assert `X-Forwarded-*`.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    nets: Vec<(IpAddr, u8)>,
}

impl TrustedProxies {
    /// Parse entries like `203.0.113.7` or `10.0.0.0/8`. Invalid entries are
    /// skipped with a warning.
    #[must_use]
    pub fn parse(entries: &[String]) -> Self {
        let mut nets = Vec::new();
        for entry in entries {
            let (addr_part, prefix_part) = match entry.split_once('/') {
                Some((a, p)) => (a, Some(p)),
                None => (entry.as_str(), None),
            };

            let Ok(addr) = addr_part.trim().parse::<IpAddr>() else {
                tracing::warn!(entry = %entry, "Ignoring invalid trusted proxy entry");
                continue;
            };

            let full = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            let prefix = prefix_part
                .and_then(|p| p.trim().parse::<u8>().ok())
                .unwrap_or(full)
                .min(full);

            nets.push((addr, prefix));
        }
        Self { nets }
    }

    /// Whether `ip` falls inside any configured block.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|(net, prefix)| ip_in_net(ip, *net, *prefix))
    }
}

fn ip_in_net(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    if prefix == 0 {
        return matches!(
            (ip, net),
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
        );
    }
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let shift = 32 - u32::from(prefix.min(32));
            (u32::from(ip) >> shift) == (u32::from(net) >> shift)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let shift = 128 - u32::from(prefix.min(128));
            (u128::from(ip) >> shift) == (u128::from(net) >> shift)
        }
        _ => false,
    }
}

/// Per-request connection facts computed once by the pipeline.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// TCP peer address, when the listener provides it
    pub peer: Option<IpAddr>,
    /// Best-effort client IP (forwarded headers from trusted peers only)
    pub client_ip: Option<IpAddr>,
    /// TLS terminated here, or a proxy declared HTTPS
    pub secure: bool,
    /// Any forwarding header was present
    pub proxied: bool,
    /// Peer is loopback and no forwarding headers are present
    pub direct_loopback: bool,
}

/// Headers whose presence means a proxy is involved.
const FORWARDING_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-real-ip",
    "forwarded",
];

/// Whether any forwarding header is present.
#[must_use]
pub fn proxy_detected(headers: &HeaderMap) -> bool {
    FORWARDING_HEADERS.iter().any(|h| headers.contains_key(*h))
}

/// Secure-connection check.
///
/// TLS on the listener always wins. Otherwise `X-Forwarded-Proto` must equal
/// the exact lowercase `https`; the RFC 7239 `Forwarded` header is consulted
/// only when `X-Forwarded-Proto` is absent.
#[must_use]
pub fn is_connection_secure(tls: bool, headers: &HeaderMap) -> bool {
    if tls {
        return true;
    }

    if let Some(value) = headers.get("x-forwarded-proto") {
        return value.to_str().is_ok_and(|v| v == "https");
    }

    headers
        .get("forwarded")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(';')
                .flat_map(|part| part.split(','))
                .any(|pair| pair.trim().eq_ignore_ascii_case("proto=https"))
        })
}

/// Resolve the client IP.
///
/// When the peer is a trusted proxy, the first `X-Forwarded-For` entry (or
/// `X-Real-IP`) is believed; otherwise the socket peer is authoritative.
#[must_use]
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trusted: &TrustedProxies,
) -> Option<IpAddr> {
    if let Some(peer_ip) = peer {
        if trusted.contains(peer_ip) {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|s| s.trim().parse().ok())
                .or_else(|| {
                    headers
                        .get("x-real-ip")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.trim().parse().ok())
                });
            if let Some(ip) = forwarded {
                return Some(ip);
            }
        }
        return Some(peer_ip);
    }
    None
}

/// Compute the request facts in one pass.
#[must_use]
pub fn request_meta(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    tls: bool,
    trusted: &TrustedProxies,
) -> RequestMeta {
    let peer_ip = peer.map(|a| a.ip());
    let proxied = proxy_detected(headers);

    RequestMeta {
        peer: peer_ip,
        client_ip: client_ip(headers, peer_ip, trusted),
        secure: is_connection_secure(tls, headers),
        proxied,
        direct_loopback: peer_ip.is_some_and(|ip| ip.is_loopback()) && !proxied,
    }
}

// ── Cookies ───────────────────────────────────────────────────────────────

/// SameSite policy for emitted cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    /// Cross-site embedding allowed (requires Secure)
    None,
    /// Default same-site policy
    Lax,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Lax => "Lax",
        }
    }
}

/// Cookie attributes computed per request.
#[derive(Debug, Clone, Copy)]
pub struct CookieSettings {
    /// Emit the `Secure` attribute
    pub secure: bool,
    /// SameSite policy
    pub same_site: SameSite,
}

/// Attribute policy: `SameSite=None` only behind a proxy on a secure
/// connection (so cross-site embedding works), `Lax` otherwise.
#[must_use]
pub fn cookie_settings(secure: bool, proxied: bool) -> CookieSettings {
    CookieSettings {
        secure,
        same_site: if proxied && secure {
            SameSite::None
        } else {
            SameSite::Lax
        },
    }
}

/// Render a `Set-Cookie` header value.
#[must_use]
pub fn build_cookie(
    name: &str,
    value: &str,
    max_age_secs: Option<u64>,
    settings: CookieSettings,
    http_only: bool,
) -> String {
    let mut cookie = format!("{name}={value}; Path=/; SameSite={}", settings.same_site.as_str());
    if let Some(age) = max_age_secs {
        cookie.push_str(&format!("; Max-Age={age}"));
    }
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if settings.secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Render a `Set-Cookie` that clears `name`.
#[must_use]
pub fn clear_cookie(name: &str, settings: CookieSettings) -> String {
    build_cookie(name, "", Some(0), settings, true)
}

/// Extract a cookie value from the `Cookie` header.
#[must_use]
pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get("cookie")?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}
