//! SSRF screening for backend URLs, applied both when a route is compiled
//! and again immediately before each upstream dispatch.

use log::warn;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use url::{Host, Url};

#[derive(Debug, Clone, PartialEq)]
pub enum SsrfViolation {
    Unparsable(String),
    Scheme(String),
    MissingHost,
    PrivateHost(String),
}

impl std::fmt::Display for SsrfViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SsrfViolation::Unparsable(e) => write!(f, "backend_url does not parse: {}", e),
            SsrfViolation::Scheme(s) => write!(f, "backend_url scheme {} is not allowed", s),
            SsrfViolation::MissingHost => write!(f, "backend_url has no host"),
            SsrfViolation::PrivateHost(h) => {
                write!(f, "backend_url host {} is private or reserved", h)
            }
        }
    }
}

impl std::error::Error for SsrfViolation {}

/// Reject URLs whose host is localhost or inside a private/reserved range.
pub fn check_backend_url(backend_url: &str) -> Result<(), SsrfViolation> {
    let parsed =
        Url::parse(backend_url).map_err(|e| SsrfViolation::Unparsable(e.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(SsrfViolation::Scheme(parsed.scheme().to_string()));
    }
    match parsed.host() {
        None => Err(SsrfViolation::MissingHost),
        Some(Host::Domain(domain)) => {
            let lowered = domain.to_lowercase();
            if lowered == "localhost" || lowered.ends_with(".localhost") {
                return Err(SsrfViolation::PrivateHost(lowered));
            }
            Ok(())
        }
        Some(Host::Ipv4(ip)) => {
            if is_blocked_v4(ip) {
                Err(SsrfViolation::PrivateHost(ip.to_string()))
            } else {
                Ok(())
            }
        }
        Some(Host::Ipv6(ip)) => {
            if is_blocked_v6(ip) {
                Err(SsrfViolation::PrivateHost(ip.to_string()))
            } else {
                Ok(())
            }
        }
    }
}

pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_unspecified()                               // 0.0.0.0
        || octets[0] == 127                           // 127.0.0.0/8
        || octets[0] == 10                            // 10.0.0.0/8
        || (octets[0] == 172 && (16..=31).contains(&octets[1])) // 172.16.0.0/12
        || (octets[0] == 192 && octets[1] == 168)     // 192.168.0.0/16
        || (octets[0] == 169 && octets[1] == 254)     // 169.254.0.0/16
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()                                  // ::1
        || (segments[0] & 0xfe00) == 0xfc00           // fc00::/7
        || (segments[0] & 0xffc0) == 0xfe80           // fe80::/10
        || ip
            .to_ipv4_mapped()
            .map(is_blocked_v4)
            .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamAlreadyPriced {
    pub status: u16,
}

/// One-shot probe at route creation: if the upstream root itself answers
/// with an x402 challenge, refuse to proxy to it (double-charge loop).
pub async fn probe_upstream_x402(
    client: &reqwest::Client,
    backend_url: &str,
) -> Result<(), UpstreamAlreadyPriced> {
    let response = match client
        .get(backend_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            // Unreachable upstream is a deployment concern, not an x402 rail.
            warn!("x402 probe of {} failed: {}", backend_url, e);
            return Ok(());
        }
    };

    let status = response.status().as_u16();
    if status == 402 || response.headers().contains_key("payment-required") {
        return Err(UpstreamAlreadyPriced { status });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_private_hosts() {
        for url in [
            "http://localhost:3000",
            "http://sub.localhost/x",
            "http://127.0.0.1:8080",
            "http://0.0.0.0",
            "http://10.1.2.3/api",
            "http://172.16.0.9",
            "http://172.31.255.1",
            "http://192.168.1.1",
            "http://169.254.10.10",
            "http://[::1]:9000",
            "http://[fc00::1]",
            "http://[fe80::1]",
        ] {
            assert!(
                matches!(check_backend_url(url), Err(SsrfViolation::PrivateHost(_))),
                "{} should be blocked",
                url
            );
        }
    }

    #[test]
    fn allows_public_hosts() {
        for url in [
            "https://api.example.com",
            "http://93.184.216.34/v1",
            "https://api.example.com:8443/base",
            "http://172.32.0.1",
        ] {
            assert!(check_backend_url(url).is_ok(), "{} should be allowed", url);
        }
    }

    #[test]
    fn rejects_bad_schemes_and_garbage() {
        assert!(matches!(
            check_backend_url("ftp://example.com"),
            Err(SsrfViolation::Scheme(_))
        ));
        assert!(matches!(
            check_backend_url("not a url"),
            Err(SsrfViolation::Unparsable(_))
        ));
    }
}
