//! Externally-visible base URL detection.
//!
//! When the admin has not pinned a public URL, Pulse learns it from the first
//! authenticated (or direct-loopback) request: forwarded headers from a
//! trusted proxy, else the Host header plus TLS state. Loopback hosts are
//! never captured. The value feeds install-command emission.

use axum::http::HeaderMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use super::events::ControlEvent;
use super::net::{RequestMeta, TrustedProxies};

/// One-shot public URL capture.
pub struct PublicUrlDetector {
    pinned: Option<String>,
    captured: Mutex<Option<String>>,
    trusted: TrustedProxies,
    events: Option<broadcast::Sender<ControlEvent>>,
}

impl PublicUrlDetector {
    /// Build with an optional admin-pinned URL.
    #[must_use]
    pub fn new(pinned: Option<String>, trusted: TrustedProxies) -> Self {
        Self {
            pinned: pinned.map(|u| u.trim_end_matches('/').to_string()),
            captured: Mutex::new(None),
            trusted,
            events: None,
        }
    }

    /// Notify this channel when the URL is first captured, so downstream
    /// consumers (the notification side) can pick it up.
    #[must_use]
    pub fn with_events(mut self, events: broadcast::Sender<ControlEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// The best-known public URL, if any.
    #[must_use]
    pub fn current(&self) -> Option<String> {
        if let Some(ref pinned) = self.pinned {
            return Some(pinned.clone());
        }
        self.captured.lock().clone()
    }

    /// Observe one request. Only authenticated or direct-loopback requests
    /// may teach us the URL, and forwarded headers are believed only from
    /// trusted-proxy peers.
    pub fn observe(&self, headers: &HeaderMap, meta: &RequestMeta, authenticated: bool) {
        if self.pinned.is_some() || (!authenticated && !meta.direct_loopback) {
            return;
        }

        let mut captured = self.captured.lock();
        if captured.is_some() {
            return;
        }

        let from_trusted_proxy = meta.peer.is_some_and(|peer| self.trusted.contains(peer));

        let (scheme, host) = if from_trusted_proxy {
            let host = headers
                .get("x-forwarded-host")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let scheme = headers
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .filter(|v| *v == "https" || *v == "http")
                .unwrap_or(if meta.secure { "https" } else { "http" });

            match host {
                Some(mut host) => {
                    // Port only when the proxy forwards a non-default one
                    if !host.contains(':') {
                        if let Some(port) = headers
                            .get("x-forwarded-port")
                            .and_then(|v| v.to_str().ok())
                        {
                            let default = if scheme == "https" { "443" } else { "80" };
                            if port != default {
                                host = format!("{host}:{port}");
                            }
                        }
                    }
                    (scheme, host)
                }
                None => return,
            }
        } else {
            let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()) else {
                return;
            };
            let scheme = if meta.secure { "https" } else { "http" };
            (scheme, host.to_string())
        };

        if is_loopback_host(&host) {
            return;
        }

        let url = format!("{scheme}://{host}");
        info!(url = %url, "Learned public URL");
        *captured = Some(url.clone());

        if let Some(ref events) = self.events {
            let _ = events.send(ControlEvent::PublicUrlCaptured { url });
        }
    }
}

fn is_loopback_host(host: &str) -> bool {
    let bare = host
        .rsplit_once(':')
        .map_or(host, |(h, _)| h)
        .trim_matches(['[', ']']);
    bare == "localhost"
        || bare
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};
    use std::net::SocketAddr;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn meta(peer: &str, secure: bool, proxied: bool) -> RequestMeta {
        let peer: SocketAddr = peer.parse().unwrap();
        RequestMeta {
            peer: Some(peer.ip()),
            client_ip: Some(peer.ip()),
            secure,
            proxied,
            direct_loopback: peer.ip().is_loopback() && !proxied,
        }
    }

    #[test]
    fn pinned_url_wins() {
        let detector = PublicUrlDetector::new(
            Some("https://pulse.example.com/".to_string()),
            TrustedProxies::default(),
        );
        detector.observe(
            &headers(&[("host", "other.example.com")]),
            &meta("203.0.113.7:1000", false, false),
            true,
        );
        assert_eq!(
            detector.current().as_deref(),
            Some("https://pulse.example.com")
        );
    }

    #[test]
    fn captures_once_from_host_header() {
        let detector = PublicUrlDetector::new(None, TrustedProxies::default());
        detector.observe(
            &headers(&[("host", "pulse.lan:7655")]),
            &meta("192.0.2.10:1000", false, false),
            true,
        );
        assert_eq!(detector.current().as_deref(), Some("http://pulse.lan:7655"));

        // Second observation does not overwrite
        detector.observe(
            &headers(&[("host", "other.lan")]),
            &meta("192.0.2.10:1000", false, false),
            true,
        );
        assert_eq!(detector.current().as_deref(), Some("http://pulse.lan:7655"));
    }

    #[test]
    fn unauthenticated_remote_request_is_ignored() {
        let detector = PublicUrlDetector::new(None, TrustedProxies::default());
        detector.observe(
            &headers(&[("host", "pulse.lan")]),
            &meta("203.0.113.7:1000", false, false),
            false,
        );
        assert!(detector.current().is_none());
    }

    #[test]
    fn loopback_host_is_ignored() {
        let detector = PublicUrlDetector::new(None, TrustedProxies::default());
        detector.observe(
            &headers(&[("host", "localhost:7655")]),
            &meta("127.0.0.1:1000", false, false),
            true,
        );
        assert!(detector.current().is_none());
    }

    #[test]
    fn forwarded_host_believed_from_trusted_proxy_only() {
        let trusted = TrustedProxies::parse(&["10.0.0.1".to_string()]);

        let detector = PublicUrlDetector::new(None, trusted);
        // Untrusted peer asserting X-Forwarded-Host: fall back to Host
        detector.observe(
            &headers(&[
                ("host", "internal.lan"),
                ("x-forwarded-host", "pulse.example.com"),
            ]),
            &meta("203.0.113.7:1000", false, true),
            true,
        );
        assert_eq!(detector.current().as_deref(), Some("http://internal.lan"));
    }

    #[test]
    fn trusted_proxy_headers_build_url() {
        let trusted = TrustedProxies::parse(&["10.0.0.1".to_string()]);
        let detector = PublicUrlDetector::new(None, trusted);

        detector.observe(
            &headers(&[
                ("host", "internal.lan"),
                ("x-forwarded-host", "pulse.example.com"),
                ("x-forwarded-proto", "https"),
                ("x-forwarded-port", "443"),
            ]),
            &meta("10.0.0.1:1000", true, true),
            true,
        );
        assert_eq!(
            detector.current().as_deref(),
            Some("https://pulse.example.com")
        );
    }
}
