//! Gateway configuration. Everything is environment-driven, the way the
//! sibling service daemons configure themselves; `PAY_TO_ADDRESS` is the one
//! hard requirement and startup fails without it.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::env;
use std::path::PathBuf;

use crate::utils::crypto::is_evm_address;

pub const DEFAULT_PORT: u16 = 4402;
pub const DEFAULT_REPLAY_TTL_MS: u64 = 300_000;
pub const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 100;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_UPSTREAM_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub facilitator_url: Option<String>,
    pub pay_to_address: String,
    /// Network tag: `base`, `base-mainnet` or `base-sepolia`.
    pub network: String,
    pub routes_file: Option<PathBuf>,
    pub admin_key: Option<String>,
    pub replay_ttl_ms: u64,
    pub rate_limit_per_min: u32,
    pub skip_x402_probe: bool,
    pub reputation_rpc_url: Option<String>,
    pub reputation_contract: Option<String>,
    pub reputation_min_score: u64,
    /// Authoritative merchant name for intent-mandate checks. Falls back to
    /// the request `Host` header when unset.
    pub gateway_domain: Option<String>,
    /// Optional secp256k1 key (0x-hex) used to sign receipts.
    pub gateway_signing_key: Option<String>,
    pub request_timeout_secs: u64,
    pub max_upstream_body_bytes: usize,
}

impl GatewayConfig {
    /// Read configuration from the process environment. Validation failures
    /// here abort startup with a non-zero exit.
    pub fn from_env() -> Result<Self> {
        let pay_to_address =
            env::var("PAY_TO_ADDRESS").map_err(|_| anyhow!("PAY_TO_ADDRESS is required"))?;
        if !is_evm_address(&pay_to_address) {
            bail!("PAY_TO_ADDRESS is not a valid EVM address");
        }

        let network = env::var("BASE_NETWORK").unwrap_or_else(|_| "base-sepolia".to_string());
        if caip2_for_network(&network).is_none() {
            bail!(
                "BASE_NETWORK must be one of base, base-mainnet, base-sepolia (got {})",
                network
            );
        }

        Ok(Self {
            port: parsed_env("PORT", DEFAULT_PORT)?,
            facilitator_url: non_empty_env("FACILITATOR_URL"),
            pay_to_address,
            network,
            routes_file: non_empty_env("ROUTES_FILE").map(PathBuf::from),
            admin_key: non_empty_env("ADMIN_KEY"),
            replay_ttl_ms: parsed_env("REPLAY_TTL_MS", DEFAULT_REPLAY_TTL_MS)?,
            rate_limit_per_min: parsed_env("RATE_LIMIT_PER_MIN", DEFAULT_RATE_LIMIT_PER_MIN)?,
            skip_x402_probe: flag_env("SKIP_X402_PROBE"),
            reputation_rpc_url: non_empty_env("REPUTATION_RPC_URL"),
            reputation_contract: non_empty_env("REPUTATION_CONTRACT"),
            reputation_min_score: parsed_env("REPUTATION_MIN_SCORE", 0u64)?,
            gateway_domain: non_empty_env("GATEWAY_DOMAIN"),
            gateway_signing_key: non_empty_env("GATEWAY_SIGNING_KEY"),
            request_timeout_secs: parsed_env("REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
            max_upstream_body_bytes: parsed_env(
                "MAX_UPSTREAM_BODY_BYTES",
                DEFAULT_MAX_UPSTREAM_BODY_BYTES,
            )?,
        })
    }

    /// CAIP-2 chain identifier for the configured network.
    pub fn caip2(&self) -> &'static str {
        caip2_for_network(&self.network).expect("network validated at construction")
    }

    pub fn reputation_enabled(&self) -> bool {
        self.reputation_rpc_url.is_some() && self.reputation_contract.is_some()
    }

    /// Introspection view with secrets masked.
    pub fn masked(&self) -> MaskedConfig {
        MaskedConfig {
            port: self.port,
            facilitator_url: self.facilitator_url.clone(),
            pay_to_address: mask_address(&self.pay_to_address),
            network: self.network.clone(),
            chain: self.caip2().to_string(),
            routes_file: self
                .routes_file
                .as_ref()
                .map(|p| p.display().to_string()),
            admin_enabled: self.admin_key.is_some(),
            replay_ttl_ms: self.replay_ttl_ms,
            rate_limit_per_min: self.rate_limit_per_min,
            skip_x402_probe: self.skip_x402_probe,
            reputation_enabled: self.reputation_enabled(),
            reputation_min_score: self.reputation_min_score,
            gateway_domain: self.gateway_domain.clone(),
            receipt_signing_enabled: self.gateway_signing_key.is_some(),
            request_timeout_secs: self.request_timeout_secs,
            max_upstream_body_bytes: self.max_upstream_body_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaskedConfig {
    pub port: u16,
    pub facilitator_url: Option<String>,
    pub pay_to_address: String,
    pub network: String,
    pub chain: String,
    pub routes_file: Option<String>,
    pub admin_enabled: bool,
    pub replay_ttl_ms: u64,
    pub rate_limit_per_min: u32,
    pub skip_x402_probe: bool,
    pub reputation_enabled: bool,
    pub reputation_min_score: u64,
    pub gateway_domain: Option<String>,
    pub receipt_signing_enabled: bool,
    pub request_timeout_secs: u64,
    pub max_upstream_body_bytes: usize,
}

pub fn caip2_for_network(network: &str) -> Option<&'static str> {
    match network {
        "base" | "base-mainnet" => Some("eip155:8453"),
        "base-sepolia" => Some("eip155:84532"),
        _ => None,
    }
}

/// Show only the first and last four chars of an address.
pub fn mask_address(address: &str) -> String {
    if address.len() <= 8 {
        return "****".to_string();
    }
    format!(
        "{}…{}",
        &address[..4],
        &address[address.len() - 4..]
    )
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn flag_env(key: &str) -> bool {
    matches!(
        env::var(key).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty_env(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} is not a valid value", key)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caip2_mapping() {
        assert_eq!(caip2_for_network("base"), Some("eip155:8453"));
        assert_eq!(caip2_for_network("base-mainnet"), Some("eip155:8453"));
        assert_eq!(caip2_for_network("base-sepolia"), Some("eip155:84532"));
        assert_eq!(caip2_for_network("optimism"), None);
    }

    #[test]
    fn masks_pay_to_address_to_four_chars_each_side() {
        let masked = mask_address("0x9431cf5da0ce60664661341db650763b08286b18");
        assert_eq!(masked, "0x94…6b18");
        assert!(!masked.contains("cf5da0ce60664661341db650763b0828"));
    }
}
