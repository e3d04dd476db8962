//! Bounded mandate (kind A): a per-day spending cap with a tool allowlist,
//! signed by the owning wallet over a pipe-joined canonical string.

use serde::Deserialize;

use crate::utils::crypto::{keccak256_hex, recover_personal_sign};

#[derive(Debug, Clone, Deserialize)]
pub struct BoundedMandate {
    pub mandate_id: String,
    /// Owning wallet address (0x-hex).
    pub owner_pubkey: String,
    /// Unix seconds.
    pub expires_at: i64,
    /// Decimal USDC string.
    pub max_spend_usdc_per_day: String,
    pub allowlisted_tool_ids: Vec<String>,
    /// Calls priced above this require out-of-band confirmation.
    #[serde(default)]
    pub require_confirm_over: Option<String>,
    pub signature: String,
}

impl BoundedMandate {
    /// Pipe-joined canonical form: allowlist sorted lexicographically, the
    /// optional confirm threshold replaced with the empty string when absent.
    pub fn canonical_string(&self) -> String {
        let mut tools = self.allowlisted_tool_ids.clone();
        tools.sort();
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.mandate_id,
            self.owner_pubkey,
            self.expires_at,
            self.max_spend_usdc_per_day,
            tools.join(","),
            self.require_confirm_over.as_deref().unwrap_or("")
        )
    }

    /// keccak256 of the canonical string, hex.
    pub fn hash(&self) -> String {
        keccak256_hex(self.canonical_string().as_bytes())
    }

    /// Recover the signer of `personal_sign("0x" + hash)` and compare with
    /// the owning wallet.
    pub fn signature_is_valid(&self) -> bool {
        let message = format!("0x{}", self.hash());
        match recover_personal_sign(&message, &self.signature) {
            Ok(signer) => signer.eq_ignore_ascii_case(self.owner_pubkey.trim()),
            Err(_) => false,
        }
    }

    pub fn allows_tool(&self, tool_id: &str) -> bool {
        self.allowlisted_tool_ids
            .iter()
            .any(|t| t == tool_id || t == "*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::crypto::{address_from_verifying_key, personal_sign, signing_key_from_hex};

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    pub fn signed_mandate(tools: Vec<&str>, cap: &str, confirm: Option<&str>) -> BoundedMandate {
        let key = signing_key_from_hex(TEST_KEY).unwrap();
        let owner = address_from_verifying_key(key.verifying_key());
        let mut mandate = BoundedMandate {
            mandate_id: "m-test-1".to_string(),
            owner_pubkey: owner,
            expires_at: 4_102_444_800, // 2100-01-01
            max_spend_usdc_per_day: cap.to_string(),
            allowlisted_tool_ids: tools.into_iter().map(String::from).collect(),
            require_confirm_over: confirm.map(String::from),
            signature: String::new(),
        };
        mandate.signature =
            personal_sign(&format!("0x{}", mandate.hash()), &key).unwrap();
        mandate
    }

    #[test]
    fn canonical_string_sorts_allowlist_and_substitutes_empty() {
        let mandate = BoundedMandate {
            mandate_id: "m1".to_string(),
            owner_pubkey: "0xabc".to_string(),
            expires_at: 100,
            max_spend_usdc_per_day: "0.05".to_string(),
            allowlisted_tool_ids: vec!["zeta".to_string(), "alpha".to_string()],
            require_confirm_over: None,
            signature: String::new(),
        };
        assert_eq!(
            mandate.canonical_string(),
            "m1|0xabc|100|0.05|alpha,zeta|"
        );
    }

    #[test]
    fn allowlist_order_does_not_change_hash() {
        let mut a = signed_mandate(vec!["x", "y"], "1", None);
        let b_hash = a.hash();
        a.allowlisted_tool_ids.reverse();
        assert_eq!(a.hash(), b_hash);
    }

    #[test]
    fn valid_signature_verifies_and_tamper_breaks_it() {
        let mut mandate = signed_mandate(vec!["echo"], "0.05", None);
        assert!(mandate.signature_is_valid());

        mandate.max_spend_usdc_per_day = "100".to_string();
        assert!(!mandate.signature_is_valid());
    }

    #[test]
    fn wildcard_allowlist() {
        let mandate = signed_mandate(vec!["*"], "1", None);
        assert!(mandate.allows_tool("anything"));
        let scoped = signed_mandate(vec!["echo"], "1", None);
        assert!(scoped.allows_tool("echo"));
        assert!(!scoped.allows_tool("other"));
    }
}
