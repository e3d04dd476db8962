//! AP2 mandate verification. Two kinds share one entry point and dispatch on
//! shape: an envelope with `type == "IntentMandate"` is kind B, anything else
//! is the bounded kind A. The kinds use disjoint spend ledgers.

pub mod bounded;
pub mod intent;
pub mod ledger;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use serde_json::Value;

use crate::receipt::{MandateVerdict, ReasonCode};
use crate::utils::usdc::{format_usdc, parse_usdc};
use bounded::BoundedMandate;
use intent::IntentMandate;
use ledger::{LedgerKind, SpendLedgers, TentativeCharge};

/// Request-side inputs the verifier needs.
pub struct MandateContext<'a> {
    pub tool_id: &'a str,
    pub price_micros: u64,
    /// Lowercased, port-stripped merchant identity of this gateway.
    pub gateway_domain: &'a str,
    pub now: DateTime<Utc>,
}

/// Result of running the mandate stage.
#[derive(Debug, Clone)]
pub struct MandateOutcome {
    pub verdict: MandateVerdict,
    pub mandate_id: Option<String>,
    pub mandate_hash: Option<String>,
    /// Set when `verdict == Denied`.
    pub deny_reason: Option<ReasonCode>,
    pub explanation: Option<String>,
    /// Ledger increment applied on approval; reverted by the pipeline if a
    /// later stage denies or the upstream errors without charge.
    pub charge: Option<TentativeCharge>,
}

impl MandateOutcome {
    fn skipped() -> Self {
        Self {
            verdict: MandateVerdict::Skipped,
            mandate_id: None,
            mandate_hash: None,
            deny_reason: None,
            explanation: None,
            charge: None,
        }
    }

    fn denied(
        mandate_id: Option<String>,
        mandate_hash: Option<String>,
        reason: ReasonCode,
        explanation: String,
    ) -> Self {
        Self {
            verdict: MandateVerdict::Denied,
            mandate_id,
            mandate_hash,
            deny_reason: Some(reason),
            explanation: Some(explanation),
            charge: None,
        }
    }
}

/// Malformed header: base64 or JSON decode failure. Maps to HTTP 400 without
/// a receipt.
#[derive(Debug, Clone)]
pub struct MalformedMandate(pub String);

impl std::fmt::Display for MalformedMandate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed mandate header: {}", self.0)
    }
}

impl std::error::Error for MalformedMandate {}

/// Verify the raw `X-Mandate` header and, on approval, charge the matching
/// ledger before the next pipeline stage runs.
pub fn verify_and_charge(
    ledgers: &SpendLedgers,
    raw_header: Option<&str>,
    ctx: &MandateContext<'_>,
) -> Result<MandateOutcome, MalformedMandate> {
    let raw = match raw_header {
        Some(raw) if !raw.trim().is_empty() => raw.trim(),
        _ => return Ok(MandateOutcome::skipped()),
    };

    let decoded = BASE64
        .decode(raw)
        .map_err(|e| MalformedMandate(format!("base64: {}", e)))?;
    let value: Value = serde_json::from_slice(&decoded)
        .map_err(|e| MalformedMandate(format!("json: {}", e)))?;

    // Shape dispatch: an explicit IntentMandate tag wins over any kind-A
    // fields that happen to be present.
    if value.get("type").and_then(|t| t.as_str()) == Some("IntentMandate") {
        let mandate: IntentMandate = serde_json::from_value(value)
            .map_err(|e| MalformedMandate(format!("intent mandate: {}", e)))?;
        Ok(verify_intent(ledgers, &mandate, ctx))
    } else {
        let mandate: BoundedMandate = serde_json::from_value(value)
            .map_err(|e| MalformedMandate(format!("bounded mandate: {}", e)))?;
        Ok(verify_bounded(ledgers, &mandate, ctx))
    }
}

fn verify_bounded(
    ledgers: &SpendLedgers,
    mandate: &BoundedMandate,
    ctx: &MandateContext<'_>,
) -> MandateOutcome {
    let mandate_id = mandate.mandate_id.clone();
    let mandate_hash = mandate.hash();

    if !mandate.signature_is_valid() {
        return MandateOutcome::denied(
            Some(mandate_id),
            Some(mandate_hash),
            ReasonCode::InvalidSignature,
            "mandate signature does not recover owner_pubkey".to_string(),
        );
    }

    let expires_at = Utc
        .timestamp_opt(mandate.expires_at, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
    if expires_at <= ctx.now {
        return MandateOutcome::denied(
            Some(mandate_id),
            Some(mandate_hash),
            ReasonCode::MandateExpired,
            format!("mandate expired at {}", expires_at.to_rfc3339()),
        );
    }

    if !mandate.allows_tool(ctx.tool_id) {
        return MandateOutcome::denied(
            Some(mandate_id),
            Some(mandate_hash),
            ReasonCode::EndpointNotAllowlisted,
            format!("tool {} is not in the mandate allowlist", ctx.tool_id),
        );
    }

    let cap_micros = match parse_usdc(&mandate.max_spend_usdc_per_day) {
        Ok(cap) => cap,
        // A signed-but-unusable cap means no spend can be authorized.
        Err(e) => {
            return MandateOutcome::denied(
                Some(mandate_id),
                Some(mandate_hash),
                ReasonCode::MandateBudgetExceeded,
                format!("max_spend_usdc_per_day is not a valid amount: {}", e),
            )
        }
    };

    // Pure read first so a simultaneous confirm violation reports in spec
    // order; the charge below re-checks atomically.
    let spent = ledgers.daily_spent(&mandate_id);
    if spent.saturating_add(ctx.price_micros) > cap_micros {
        return MandateOutcome::denied(
            Some(mandate_id),
            Some(mandate_hash),
            ReasonCode::MandateBudgetExceeded,
            format!(
                "daily spend {} + price {} exceeds cap {}",
                format_usdc(spent),
                format_usdc(ctx.price_micros),
                format_usdc(cap_micros)
            ),
        );
    }

    if let Some(threshold) = &mandate.require_confirm_over {
        if let Ok(threshold_micros) = parse_usdc(threshold) {
            if ctx.price_micros > threshold_micros {
                return MandateOutcome::denied(
                    Some(mandate_id),
                    Some(mandate_hash),
                    ReasonCode::MandateConfirmRequired,
                    format!(
                        "price {} exceeds confirmation threshold {}",
                        format_usdc(ctx.price_micros),
                        threshold
                    ),
                );
            }
        }
    }

    if let Err(e) = ledgers.try_charge_daily(&mandate_id, ctx.price_micros, cap_micros) {
        // Lost a race with a concurrent request on the same mandate.
        return MandateOutcome::denied(
            Some(mandate_id),
            Some(mandate_hash),
            ReasonCode::MandateBudgetExceeded,
            format!(
                "daily spend {} + price {} exceeds cap {}",
                format_usdc(e.spent_micros),
                format_usdc(ctx.price_micros),
                format_usdc(cap_micros)
            ),
        );
    }

    debug!(
        "bounded mandate {} approved for {} ({})",
        mandate_id,
        ctx.tool_id,
        format_usdc(ctx.price_micros)
    );
    MandateOutcome {
        verdict: MandateVerdict::Approved,
        charge: Some(TentativeCharge {
            kind: LedgerKind::Daily,
            key: mandate_id.clone(),
            micros: ctx.price_micros,
        }),
        mandate_id: Some(mandate_id),
        mandate_hash: Some(mandate_hash),
        deny_reason: None,
        explanation: None,
    }
}

fn verify_intent(
    ledgers: &SpendLedgers,
    mandate: &IntentMandate,
    ctx: &MandateContext<'_>,
) -> MandateOutcome {
    let mandate_hash = mandate.hash();
    let intent_id = mandate.intent_mandate_id();

    if !mandate.signature_is_valid() {
        return MandateOutcome::denied(
            Some(intent_id),
            Some(mandate_hash),
            ReasonCode::InvalidSignature,
            "intent mandate signature does not recover signer_address".to_string(),
        );
    }

    match mandate.expiry() {
        Some(expiry) if expiry > ctx.now => {}
        Some(expiry) => {
            return MandateOutcome::denied(
                Some(intent_id),
                Some(mandate_hash),
                ReasonCode::MandateExpired,
                format!("intent expired at {}", expiry.to_rfc3339()),
            )
        }
        None => {
            return MandateOutcome::denied(
                Some(intent_id),
                Some(mandate_hash),
                ReasonCode::MandateExpired,
                "intent_expiry is missing or unparsable".to_string(),
            )
        }
    }

    if !mandate.matches_merchant(ctx.gateway_domain) {
        return MandateOutcome::denied(
            Some(intent_id),
            Some(mandate_hash),
            ReasonCode::MerchantNotMatched,
            format!(
                "gateway domain {} is not an allowed merchant",
                ctx.gateway_domain
            ),
        );
    }

    let budget_micros = match mandate.budget_micros() {
        Some(budget) => budget,
        None => {
            return MandateOutcome::denied(
                Some(intent_id),
                Some(mandate_hash),
                ReasonCode::IntentBudgetExceeded,
                "budget.amount is missing or unparsable".to_string(),
            )
        }
    };

    if let Err(e) = ledgers.try_charge_lifetime(&intent_id, ctx.price_micros, budget_micros) {
        return MandateOutcome::denied(
            Some(intent_id),
            Some(mandate_hash),
            ReasonCode::IntentBudgetExceeded,
            format!(
                "lifetime spend {} + price {} exceeds budget {}",
                format_usdc(e.spent_micros),
                format_usdc(ctx.price_micros),
                format_usdc(budget_micros)
            ),
        );
    }

    debug!(
        "intent mandate {} approved for {} ({})",
        intent_id,
        ctx.tool_id,
        format_usdc(ctx.price_micros)
    );
    MandateOutcome {
        verdict: MandateVerdict::Approved,
        charge: Some(TentativeCharge {
            kind: LedgerKind::Lifetime,
            key: intent_id.clone(),
            micros: ctx.price_micros,
        }),
        mandate_id: Some(intent_id),
        mandate_hash: Some(mandate_hash),
        deny_reason: None,
        explanation: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::{Clock, FixedClock};
    use crate::utils::crypto::{address_from_verifying_key, personal_sign, signing_key_from_hex};
    use serde_json::json;
    use std::sync::Arc;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn setup() -> (Arc<FixedClock>, SpendLedgers) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        (clock.clone(), SpendLedgers::new(clock))
    }

    fn bounded_header(tools: Vec<&str>, cap: &str, confirm: Option<&str>, expires_at: i64) -> String {
        let key = signing_key_from_hex(TEST_KEY).unwrap();
        let owner = address_from_verifying_key(key.verifying_key());
        let mut mandate = BoundedMandate {
            mandate_id: "m-1".to_string(),
            owner_pubkey: owner,
            expires_at,
            max_spend_usdc_per_day: cap.to_string(),
            allowlisted_tool_ids: tools.into_iter().map(String::from).collect(),
            require_confirm_over: confirm.map(String::from),
            signature: String::new(),
        };
        mandate.signature = personal_sign(&format!("0x{}", mandate.hash()), &key).unwrap();
        BASE64.encode(
            serde_json::to_vec(&json!({
                "mandate_id": mandate.mandate_id,
                "owner_pubkey": mandate.owner_pubkey,
                "expires_at": mandate.expires_at,
                "max_spend_usdc_per_day": mandate.max_spend_usdc_per_day,
                "allowlisted_tool_ids": mandate.allowlisted_tool_ids,
                "require_confirm_over": mandate.require_confirm_over,
                "signature": mandate.signature,
            }))
            .unwrap(),
        )
    }

    fn intent_header(merchants: Vec<&str>, budget: &str, expiry_secs: i64) -> String {
        let key = signing_key_from_hex(TEST_KEY).unwrap();
        let signer = address_from_verifying_key(key.verifying_key());
        let contents = json!({
            "natural_language_description": "buy research data",
            "budget": {"amount": budget, "currency": "USD"},
            "merchants": merchants,
            "intent_expiry": expiry_secs,
            "requires_refundability": false
        });
        let hash = keccak_of(&contents);
        let signature = personal_sign(&format!("0x{}", hash), &key).unwrap();
        BASE64.encode(
            serde_json::to_vec(&json!({
                "type": "IntentMandate",
                "contents": contents,
                "user_signature": signature,
                "timestamp": 1_748_779_200,
                "signer_address": signer,
            }))
            .unwrap(),
        )
    }

    fn keccak_of(contents: &Value) -> String {
        crate::utils::crypto::keccak256_hex(
            crate::utils::crypto::canonical_json(contents).as_bytes(),
        )
    }

    fn ctx<'a>(clock: &FixedClock, price_micros: u64) -> MandateContext<'a> {
        MandateContext {
            tool_id: "echo",
            price_micros,
            gateway_domain: "gateway.example.com",
            now: clock.now(),
        }
    }

    #[test]
    fn missing_header_is_skipped() {
        let (clock, ledgers) = setup();
        let outcome = verify_and_charge(&ledgers, None, &ctx(&clock, 10_000)).unwrap();
        assert_eq!(outcome.verdict, MandateVerdict::Skipped);
    }

    #[test]
    fn malformed_header_is_a_client_error() {
        let (clock, ledgers) = setup();
        assert!(verify_and_charge(&ledgers, Some("!!!"), &ctx(&clock, 0)).is_err());
        let not_json = BASE64.encode(b"not json");
        assert!(verify_and_charge(&ledgers, Some(&not_json), &ctx(&clock, 0)).is_err());
    }

    #[test]
    fn bounded_approval_charges_daily_ledger() {
        let (clock, ledgers) = setup();
        let header = bounded_header(vec!["echo"], "0.05", None, 4_102_444_800);
        let outcome = verify_and_charge(&ledgers, Some(&header), &ctx(&clock, 30_000)).unwrap();
        assert_eq!(outcome.verdict, MandateVerdict::Approved);
        assert_eq!(ledgers.daily_spent("m-1"), 30_000);
        assert!(outcome.charge.is_some());
    }

    #[test]
    fn bounded_budget_denial_leaves_ledger_untouched() {
        let (clock, ledgers) = setup();
        let header = bounded_header(vec!["echo"], "0.05", None, 4_102_444_800);

        let first = verify_and_charge(&ledgers, Some(&header), &ctx(&clock, 30_000)).unwrap();
        assert_eq!(first.verdict, MandateVerdict::Approved);

        let second = verify_and_charge(&ledgers, Some(&header), &ctx(&clock, 30_000)).unwrap();
        assert_eq!(second.verdict, MandateVerdict::Denied);
        assert_eq!(second.deny_reason, Some(ReasonCode::MandateBudgetExceeded));
        assert_eq!(ledgers.daily_spent("m-1"), 30_000);
    }

    #[test]
    fn bounded_denials_follow_spec_order() {
        let (clock, ledgers) = setup();

        let expired = bounded_header(vec!["echo"], "1", None, 100);
        let outcome = verify_and_charge(&ledgers, Some(&expired), &ctx(&clock, 0)).unwrap();
        assert_eq!(outcome.deny_reason, Some(ReasonCode::MandateExpired));

        let wrong_tool = bounded_header(vec!["other"], "1", None, 4_102_444_800);
        let outcome = verify_and_charge(&ledgers, Some(&wrong_tool), &ctx(&clock, 0)).unwrap();
        assert_eq!(
            outcome.deny_reason,
            Some(ReasonCode::EndpointNotAllowlisted)
        );

        let confirm = bounded_header(vec!["echo"], "1", Some("0.01"), 4_102_444_800);
        let outcome = verify_and_charge(&ledgers, Some(&confirm), &ctx(&clock, 20_000)).unwrap();
        assert_eq!(
            outcome.deny_reason,
            Some(ReasonCode::MandateConfirmRequired)
        );
    }

    #[test]
    fn tampered_signature_denied() {
        let (clock, ledgers) = setup();
        let header = bounded_header(vec!["echo"], "0.05", None, 4_102_444_800);
        let decoded = BASE64.decode(&header).unwrap();
        let mut value: Value = serde_json::from_slice(&decoded).unwrap();
        value["max_spend_usdc_per_day"] = json!("1000");
        let tampered = BASE64.encode(serde_json::to_vec(&value).unwrap());

        let outcome = verify_and_charge(&ledgers, Some(&tampered), &ctx(&clock, 0)).unwrap();
        assert_eq!(outcome.deny_reason, Some(ReasonCode::InvalidSignature));
    }

    #[test]
    fn intent_merchant_mismatch_denied_without_charge() {
        let (clock, ledgers) = setup();
        let header = intent_header(vec!["example.com"], "1.00", 4_102_444_800);
        let context = MandateContext {
            tool_id: "echo",
            price_micros: 10_000,
            gateway_domain: "localhost",
            now: clock.now(),
        };
        let outcome = verify_and_charge(&ledgers, Some(&header), &context).unwrap();
        assert_eq!(outcome.deny_reason, Some(ReasonCode::MerchantNotMatched));
        assert_eq!(ledgers.lifetime_spent(&outcome.mandate_id.unwrap()), 0);
    }

    #[test]
    fn intent_budget_is_lifetime() {
        let (clock, ledgers) = setup();
        let header = intent_header(vec!["gateway.example.com"], "0.05", 4_102_444_800);

        let first = verify_and_charge(&ledgers, Some(&header), &ctx(&clock, 30_000)).unwrap();
        assert_eq!(first.verdict, MandateVerdict::Approved);
        let intent_id = first.mandate_id.clone().unwrap();
        assert_eq!(ledgers.lifetime_spent(&intent_id), 30_000);

        // Unlike the daily ledger, a new UTC day does not reset it.
        clock.set(Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap());
        let second = verify_and_charge(&ledgers, Some(&header), &ctx(&clock, 30_000)).unwrap();
        assert_eq!(second.deny_reason, Some(ReasonCode::IntentBudgetExceeded));
        assert_eq!(ledgers.lifetime_spent(&intent_id), 30_000);
    }

    #[test]
    fn intent_wildcard_merchant_approves() {
        let (clock, ledgers) = setup();
        let header = intent_header(vec!["*"], "1.00", 4_102_444_800);
        let outcome = verify_and_charge(&ledgers, Some(&header), &ctx(&clock, 10_000)).unwrap();
        assert_eq!(outcome.verdict, MandateVerdict::Approved);
    }
}
