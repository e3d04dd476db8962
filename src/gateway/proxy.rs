//! SSRF-safe upstream proxy: forwards an admitted request to the route's
//! provider and shapes the response so receipts stay verifiable.

use axum::http::HeaderMap;
use log::debug;
use std::time::{Duration, Instant};

use crate::gateway::routes::RouteRule;
use crate::gateway::ssrf::{check_backend_url, SsrfViolation};
use crate::utils::crypto::keccak256_hex;

/// RFC 7230 hop-by-hop headers, never copied through in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Gateway control headers; consumed by the pipeline, never forwarded.
const GATEWAY_HEADERS: &[&str] = &[
    "x-payment",
    "x-mandate",
    "x-agent-address",
    "x-agent-id",
    "x-request-idempotency-key",
    "host",
    "content-length",
];

#[derive(Debug)]
pub enum UpstreamFailure {
    /// Connect failure or timeout.
    Unreachable(String),
    /// Upstream answered 5xx.
    ServerError(u16),
    /// Runtime SSRF re-check tripped.
    Ssrf(SsrfViolation),
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamFailure::Unreachable(e) => write!(f, "upstream unreachable: {}", e),
            UpstreamFailure::ServerError(status) => write!(f, "upstream returned {}", status),
            UpstreamFailure::Ssrf(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// keccak256 of the materialised body, hex.
    pub response_hash: String,
    pub latency_ms: u64,
}

pub struct UpstreamProxy {
    client: reqwest::Client,
}

impl UpstreamProxy {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Forward the matched inbound path (plus query) to the route's backend.
    /// Path parameters are already part of the inbound path and are not
    /// re-expanded.
    pub async fn forward(
        &self,
        rule: &RouteRule,
        method: &str,
        path_and_query: &str,
        headers: &HeaderMap,
        body: &[u8],
        deadline: Duration,
    ) -> Result<ProxiedResponse, UpstreamFailure> {
        // Compile-time screening already ran; re-check in case the rule was
        // created with `_skip_ssrf` cleared after the fact or the table was
        // loaded from a hand-edited file.
        if !rule.skip_ssrf {
            check_backend_url(&rule.backend_url).map_err(UpstreamFailure::Ssrf)?;
        }

        let url = format!(
            "{}{}",
            rule.backend_url.trim_end_matches('/'),
            path_and_query
        );
        let reqwest_method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|e| UpstreamFailure::Unreachable(e.to_string()))?;
        let is_bodyless = matches!(method.to_uppercase().as_str(), "GET" | "HEAD");

        let mut request = self.client.request(reqwest_method, &url).timeout(deadline);
        for (name, value) in headers {
            let lowered = name.as_str().to_lowercase();
            if HOP_BY_HOP.contains(&lowered.as_str()) || GATEWAY_HEADERS.contains(&lowered.as_str())
            {
                continue;
            }
            if let Ok(value) = value.to_str() {
                request = request.header(name.as_str(), value);
            }
        }
        if let Some(auth) = &rule.auth {
            request = request.header(auth.header.as_str(), auth.value.as_str());
        }
        if !is_bodyless {
            request = request.body(body.to_vec());
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamFailure::Unreachable(e.to_string()))?;

        let status = response.status().as_u16();
        if status >= 500 {
            return Err(UpstreamFailure::ServerError(status));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpstreamFailure::Unreachable(e.to_string()))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        debug!(
            "proxied {} {} -> {} ({} bytes, {} ms)",
            method,
            path_and_query,
            status,
            bytes.len(),
            latency_ms
        );

        Ok(ProxiedResponse {
            status,
            content_type,
            response_hash: keccak256_hex(&bytes),
            body: bytes.to_vec(),
            latency_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_and_gateway_headers_are_stripped() {
        for header in ["connection", "transfer-encoding", "x-payment", "x-mandate"] {
            assert!(
                HOP_BY_HOP.contains(&header) || GATEWAY_HEADERS.contains(&header),
                "{} must be stripped",
                header
            );
        }
        assert!(!HOP_BY_HOP.contains(&"accept"));
        assert!(!GATEWAY_HEADERS.contains(&"accept"));
    }
}
