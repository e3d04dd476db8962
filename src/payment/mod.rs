//! x402 payment gate: a per-request challenge/verify/settle state machine
//! around the facilitator. State is per-response; the agent carries it by
//! retrying with an `X-Payment` header.

pub mod facilitator;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::warn;
use serde_json::Value;
use std::sync::Arc;

pub use facilitator::{Facilitator, HttpFacilitator, PaymentRequirements};

/// Gate states. `Challenged` and `Rejected` are terminal for one response;
/// `Verified` carries into settlement after the upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Idle,
    Challenged,
    Verified,
    Settled,
    Rejected,
    Done,
}

/// Verification context attached to the request between `verify()` and
/// `settle()`.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub payload: Value,
    pub requirements: PaymentRequirements,
    pub payer: Option<String>,
    pub state: PaymentState,
}

/// Verdict of the admission half of the gate.
pub enum PaymentDecision {
    /// Free route; the gate never engages.
    NotRequired,
    /// Facilitator down at startup: paid route degrades to pass-through.
    PassThrough,
    /// No (usable) payment header: answer 402 with these requirements.
    Challenge(PaymentRequirements),
    /// Facilitator rejected the payment payload.
    Rejected { reason: String },
    /// Payment verified; settle after the upstream responds.
    Verified(Box<PaymentContext>),
}

#[derive(Debug, Clone, Default)]
pub struct Settlement {
    pub tx_hash: Option<String>,
    pub facilitator_receipt_id: Option<String>,
    pub note: Option<String>,
}

pub struct PaymentGate {
    facilitator: Option<Arc<dyn Facilitator>>,
    scheme: String,
    network: String,
    pay_to: String,
    /// Set when the facilitator was unreachable at startup.
    degraded: bool,
}

impl PaymentGate {
    pub fn new(
        facilitator: Option<Arc<dyn Facilitator>>,
        scheme: impl Into<String>,
        network: impl Into<String>,
        pay_to: impl Into<String>,
        degraded: bool,
    ) -> Self {
        Self {
            facilitator,
            scheme: scheme.into(),
            network: network.into(),
            pay_to: pay_to.into(),
            degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded || self.facilitator.is_none()
    }

    pub fn requirements_for(&self, price_usdc: &str, resource: &str) -> PaymentRequirements {
        PaymentRequirements {
            scheme: self.scheme.clone(),
            network: self.network.clone(),
            max_amount_required: price_usdc.to_string(),
            pay_to: self.pay_to.clone(),
            resource: resource.to_string(),
            description: format!("{} per call to {}", price_usdc, resource),
        }
    }

    /// Admission half of the state machine, for a route with `price > 0`.
    pub async fn admit(
        &self,
        price_micros: u64,
        price_usdc: &str,
        resource: &str,
        payment_header: Option<&str>,
    ) -> PaymentDecision {
        if price_micros == 0 {
            return PaymentDecision::NotRequired;
        }
        let facilitator = match (&self.facilitator, self.degraded) {
            (Some(f), false) => f,
            _ => return PaymentDecision::PassThrough,
        };

        let requirements = self.requirements_for(price_usdc, resource);

        let payload = match payment_header.and_then(decode_payment_header) {
            Some(payload) => payload,
            // IDLE -> CHALLENGED
            None => return PaymentDecision::Challenge(requirements),
        };

        match facilitator.verify(&payload, &requirements).await {
            Ok(outcome) if outcome.is_valid => PaymentDecision::Verified(Box::new(PaymentContext {
                payload,
                requirements,
                payer: outcome.payer,
                state: PaymentState::Verified,
            })),
            Ok(outcome) => PaymentDecision::Rejected {
                reason: outcome
                    .invalid_reason
                    .unwrap_or_else(|| "payment verification failed".to_string()),
            },
            Err(e) => PaymentDecision::Rejected {
                reason: format!("facilitator verify error: {}", e),
            },
        }
    }

    /// Settle a verified payment after a successful upstream response.
    /// Failures are logged and reflected in the receipt; the already-sent
    /// upstream response is not changed.
    pub async fn settle(&self, ctx: &PaymentContext) -> Settlement {
        let facilitator = match &self.facilitator {
            Some(f) => f,
            None => return Settlement::default(),
        };
        match facilitator.settle(&ctx.payload, &ctx.requirements).await {
            Ok(outcome) if outcome.success => Settlement {
                tx_hash: outcome.transaction,
                facilitator_receipt_id: outcome.receipt_id,
                note: None,
            },
            Ok(outcome) => {
                let reason = outcome
                    .error_reason
                    .unwrap_or_else(|| "settlement failed".to_string());
                warn!("payment settlement failed: {}", reason);
                Settlement {
                    tx_hash: None,
                    facilitator_receipt_id: None,
                    note: Some(format!("settlement failed: {}", reason)),
                }
            }
            Err(e) => {
                warn!("payment settlement error: {}", e);
                Settlement {
                    tx_hash: None,
                    facilitator_receipt_id: None,
                    note: Some(format!("settlement error: {}", e)),
                }
            }
        }
    }
}

/// `X-Payment` carries base64 JSON; anything unparsable counts as absent and
/// re-triggers the challenge.
fn decode_payment_header(raw: &str) -> Option<Value> {
    let decoded = BASE64.decode(raw.trim()).ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// Base64 payment requirements for the `payment-required` response header.
pub fn encode_requirements_header(requirements: &PaymentRequirements) -> String {
    BASE64.encode(serde_json::to_vec(requirements).expect("requirements serialize"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use facilitator::{SettleOutcome, VerifyOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeFacilitator {
        valid: bool,
        settles: AtomicUsize,
    }

    #[async_trait]
    impl Facilitator for FakeFacilitator {
        async fn verify(&self, _: &Value, _: &PaymentRequirements) -> Result<VerifyOutcome> {
            Ok(VerifyOutcome {
                is_valid: self.valid,
                invalid_reason: (!self.valid).then(|| "bad payment".to_string()),
                payer: self.valid.then(|| "0xpayer".to_string()),
            })
        }

        async fn settle(&self, _: &Value, _: &PaymentRequirements) -> Result<SettleOutcome> {
            self.settles.fetch_add(1, Ordering::SeqCst);
            Ok(SettleOutcome {
                success: true,
                error_reason: None,
                transaction: Some("0xtx".to_string()),
                network: Some("base-sepolia".to_string()),
                receipt_id: Some("fac-1".to_string()),
            })
        }
    }

    fn gate(valid: bool) -> (Arc<FakeFacilitator>, PaymentGate) {
        let facilitator = Arc::new(FakeFacilitator {
            valid,
            settles: AtomicUsize::new(0),
        });
        let gate = PaymentGate::new(
            Some(facilitator.clone()),
            "exact",
            "base-sepolia",
            "0x9431cf5da0ce60664661341db650763b08286b18",
            false,
        );
        (facilitator, gate)
    }

    fn payment_header() -> String {
        BASE64.encode(serde_json::to_vec(&serde_json::json!({"sig": "0xabc"})).unwrap())
    }

    #[tokio::test]
    async fn free_route_never_engages() {
        let (_, gate) = gate(true);
        assert!(matches!(
            gate.admit(0, "0.00", "/api/echo", None).await,
            PaymentDecision::NotRequired
        ));
    }

    #[tokio::test]
    async fn missing_header_challenges_with_requirements() {
        let (_, gate) = gate(true);
        match gate.admit(10_000, "0.01", "/api/premium", None).await {
            PaymentDecision::Challenge(req) => {
                assert_eq!(req.max_amount_required, "0.01");
                assert_eq!(req.resource, "/api/premium");
                assert_eq!(req.network, "base-sepolia");
            }
            _ => panic!("expected challenge"),
        }
    }

    #[tokio::test]
    async fn valid_payment_verifies_then_settles() {
        let (facilitator, gate) = gate(true);
        let header = payment_header();
        let ctx = match gate
            .admit(10_000, "0.01", "/api/premium", Some(&header))
            .await
        {
            PaymentDecision::Verified(ctx) => ctx,
            _ => panic!("expected verified"),
        };
        assert_eq!(ctx.state, PaymentState::Verified);

        let settlement = gate.settle(&ctx).await;
        assert_eq!(settlement.tx_hash.as_deref(), Some("0xtx"));
        assert_eq!(settlement.facilitator_receipt_id.as_deref(), Some("fac-1"));
        assert_eq!(facilitator.settles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_payment_is_rejected() {
        let (_, gate) = gate(false);
        let header = payment_header();
        match gate
            .admit(10_000, "0.01", "/api/premium", Some(&header))
            .await
        {
            PaymentDecision::Rejected { reason } => assert!(reason.contains("bad payment")),
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn degraded_gate_passes_paid_routes_through() {
        let gate = PaymentGate::new(None, "exact", "base-sepolia", "0xpay", false);
        assert!(matches!(
            gate.admit(10_000, "0.01", "/api/premium", None).await,
            PaymentDecision::PassThrough
        ));
    }

    #[test]
    fn requirements_header_roundtrips() {
        let (_, gate) = gate(true);
        let requirements = gate.requirements_for("0.01", "/api/premium");
        let encoded = encode_requirements_header(&requirements);
        let decoded: PaymentRequirements =
            serde_json::from_slice(&BASE64.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded, requirements);
    }
}
