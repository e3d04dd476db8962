//! Intent mandate (kind B): a natural-language shopping intent with a
//! lifetime budget and a merchant allowlist, signed over a deterministic
//! JSON serialization of its contents.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::utils::crypto::{canonical_json, keccak256_hex, recover_personal_sign};
use crate::utils::usdc::parse_usdc;

#[derive(Debug, Clone, Deserialize)]
pub struct IntentMandate {
    #[serde(rename = "type")]
    pub mandate_type: String,
    /// Kept as raw JSON: the hash covers the exact contents the wallet saw.
    pub contents: Value,
    pub user_signature: String,
    #[serde(default)]
    pub timestamp: Option<Value>,
    pub signer_address: String,
}

impl IntentMandate {
    /// keccak256 over the deterministically sorted JSON of `contents`.
    pub fn hash(&self) -> String {
        keccak256_hex(canonical_json(&self.contents).as_bytes())
    }

    /// `intent-` + first 16 hex chars of the hash. Keys the lifetime ledger.
    pub fn intent_mandate_id(&self) -> String {
        format!("intent-{}", &self.hash()[..16])
    }

    pub fn signature_is_valid(&self) -> bool {
        let message = format!("0x{}", self.hash());
        match recover_personal_sign(&message, &self.user_signature) {
            Ok(signer) => signer.eq_ignore_ascii_case(self.signer_address.trim()),
            Err(_) => false,
        }
    }

    /// `contents.intent_expiry`: unix seconds or an RFC 3339 string.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        match self.contents.get("intent_expiry") {
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Lifetime budget in micro-USDC. Currency is treated as USD≡USDC.
    pub fn budget_micros(&self) -> Option<u64> {
        let amount = self.contents.get("budget")?.get("amount")?;
        match amount {
            Value::String(s) => parse_usdc(s).ok(),
            Value::Number(n) => parse_usdc(&n.to_string()).ok(),
            _ => None,
        }
    }

    pub fn merchants(&self) -> Vec<String> {
        self.contents
            .get("merchants")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m.as_str())
                    .map(|m| m.to_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Case-insensitive merchant check against the gateway's domain
    /// (already lowercased and port-stripped); `"*"` matches any merchant.
    pub fn matches_merchant(&self, gateway_domain: &str) -> bool {
        let merchants = self.merchants();
        merchants
            .iter()
            .any(|m| m == "*" || m == gateway_domain)
    }
}

/// Lowercase and strip any `:port` suffix from a host value.
pub fn normalize_domain(host: &str) -> String {
    let lowered = host.trim().to_lowercase();
    // IPv6 literals keep their brackets; everything else drops the port.
    if lowered.starts_with('[') {
        return lowered
            .split(']')
            .next()
            .map(|h| format!("{}]", h))
            .unwrap_or(lowered);
    }
    lowered
        .split(':')
        .next()
        .unwrap_or(&lowered)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::crypto::{address_from_verifying_key, personal_sign, signing_key_from_hex};
    use serde_json::json;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    pub fn signed_intent(merchants: Vec<&str>, budget: &str, expiry_secs: i64) -> IntentMandate {
        let key = signing_key_from_hex(TEST_KEY).unwrap();
        let signer = address_from_verifying_key(key.verifying_key());
        let mut mandate = IntentMandate {
            mandate_type: "IntentMandate".to_string(),
            contents: json!({
                "natural_language_description": "research data under budget",
                "budget": {"amount": budget, "currency": "USD"},
                "merchants": merchants,
                "intent_expiry": expiry_secs,
                "requires_refundability": false
            }),
            user_signature: String::new(),
            timestamp: None,
            signer_address: signer,
        };
        mandate.user_signature =
            personal_sign(&format!("0x{}", mandate.hash()), &key).unwrap();
        mandate
    }

    #[test]
    fn hash_is_key_order_independent() {
        let a = IntentMandate {
            mandate_type: "IntentMandate".to_string(),
            contents: serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap(),
            user_signature: String::new(),
            timestamp: None,
            signer_address: "0x0".to_string(),
        };
        let b = IntentMandate {
            contents: serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap(),
            ..a.clone()
        };
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn intent_id_is_prefixed_hash() {
        let mandate = signed_intent(vec!["example.com"], "1.00", 4_102_444_800);
        let id = mandate.intent_mandate_id();
        assert!(id.starts_with("intent-"));
        assert_eq!(id.len(), "intent-".len() + 16);
        assert!(mandate.hash().starts_with(&id["intent-".len()..]));
    }

    #[test]
    fn signature_verifies_and_content_tamper_breaks_it() {
        let mut mandate = signed_intent(vec!["example.com"], "1.00", 4_102_444_800);
        assert!(mandate.signature_is_valid());
        mandate.contents["budget"]["amount"] = json!("9999");
        assert!(!mandate.signature_is_valid());
    }

    #[test]
    fn merchant_matching_is_case_insensitive_with_wildcard() {
        let mandate = signed_intent(vec!["Example.COM"], "1.00", 4_102_444_800);
        assert!(mandate.matches_merchant("example.com"));
        assert!(!mandate.matches_merchant("localhost"));

        let any = signed_intent(vec!["*"], "1.00", 4_102_444_800);
        assert!(any.matches_merchant("whatever.io"));
    }

    #[test]
    fn expiry_accepts_unix_and_rfc3339() {
        let unix = signed_intent(vec!["example.com"], "1.00", 1_700_000_000);
        assert_eq!(unix.expiry().unwrap().timestamp(), 1_700_000_000);

        let mut rfc = signed_intent(vec!["example.com"], "1.00", 0);
        rfc.contents["intent_expiry"] = json!("2031-01-01T00:00:00Z");
        assert_eq!(
            rfc.expiry().unwrap(),
            Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn domain_normalization() {
        assert_eq!(normalize_domain("API.Example.com:8443"), "api.example.com");
        assert_eq!(normalize_domain("localhost:4402"), "localhost");
        assert_eq!(normalize_domain("example.com"), "example.com");
    }

    #[test]
    fn budget_accepts_string_and_number() {
        let mut mandate = signed_intent(vec!["example.com"], "1.50", 4_102_444_800);
        assert_eq!(mandate.budget_micros(), Some(1_500_000));
        mandate.contents["budget"]["amount"] = json!(2.5);
        assert_eq!(mandate.budget_micros(), Some(2_500_000));
    }
}
