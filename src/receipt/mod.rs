//! Receipt engine: every admitted or rejected request produces exactly one
//! receipt. Storage is an in-memory bounded ring; stats come from incremental
//! counters, never from scanning.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::utils::crypto::{canonical_json, keccak256_hex, personal_sign};
use crate::utils::usdc::{format_usdc, parse_usdc};

pub const DEFAULT_MAX_RECEIPTS: usize = 10_000;

/// Reason codes for every pipeline verdict. The receipt's reason always
/// identifies the first stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Ok,
    RouteNotFound,
    RateLimited,
    ReplayDetected,
    InvalidSignature,
    MandateExpired,
    EndpointNotAllowlisted,
    MandateBudgetExceeded,
    MandateConfirmRequired,
    IntentBudgetExceeded,
    MerchantNotMatched,
    InvalidPayment,
    AgentBlocked,
    ReputationTooLow,
    SsrfBlocked,
    X402UpstreamBlocked,
    UpstreamErrorNoCharge,
    /// Upstream answered with a non-2xx, non-5xx status that is passed
    /// through to the caller.
    UpstreamRejected,
    /// Worker-boundary panic surfaced as a synthetic 500.
    InternalError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Ok => "OK",
            ReasonCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ReasonCode::RateLimited => "RATE_LIMITED",
            ReasonCode::ReplayDetected => "REPLAY_DETECTED",
            ReasonCode::InvalidSignature => "INVALID_SIGNATURE",
            ReasonCode::MandateExpired => "MANDATE_EXPIRED",
            ReasonCode::EndpointNotAllowlisted => "ENDPOINT_NOT_ALLOWLISTED",
            ReasonCode::MandateBudgetExceeded => "MANDATE_BUDGET_EXCEEDED",
            ReasonCode::MandateConfirmRequired => "MANDATE_CONFIRM_REQUIRED",
            ReasonCode::IntentBudgetExceeded => "INTENT_BUDGET_EXCEEDED",
            ReasonCode::MerchantNotMatched => "MERCHANT_NOT_MATCHED",
            ReasonCode::InvalidPayment => "INVALID_PAYMENT",
            ReasonCode::AgentBlocked => "AGENT_BLOCKED",
            ReasonCode::ReputationTooLow => "REPUTATION_TOO_LOW",
            ReasonCode::SsrfBlocked => "SSRF_BLOCKED",
            ReasonCode::X402UpstreamBlocked => "X402_UPSTREAM_BLOCKED",
            ReasonCode::UpstreamErrorNoCharge => "UPSTREAM_ERROR_NO_CHARGE",
            ReasonCode::UpstreamRejected => "UPSTREAM_REJECTED",
            ReasonCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Denied,
    Error,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MandateVerdict {
    Approved,
    Denied,
    Skipped,
}

/// Structured record of a gateway request outcome (§ receipt model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub request_id: String,
    pub tool_id: String,
    pub provider_id: String,
    pub endpoint: String,
    pub method: String,
    /// ISO-8601 UTC.
    pub timestamp: String,
    pub price_usdc: String,
    pub currency: String,
    pub chain: String,
    pub mandate_id: Option<String>,
    pub mandate_hash: Option<String>,
    pub mandate_verdict: MandateVerdict,
    pub reason_code: ReasonCode,
    pub payment_tx_hash: Option<String>,
    pub facilitator_receipt_id: Option<String>,
    pub request_hash: String,
    pub response_hash: Option<String>,
    pub latency_ms: Option<u64>,
    pub outcome: Outcome,
    pub explanation: String,
    /// EIP-191 signature over the canonical receipt JSON, when the gateway
    /// is configured with a signing key.
    pub receipt_signature: Option<String>,
}

impl Receipt {
    /// Base64-encoded JSON, as carried in the `X-Receipt` response header.
    pub fn to_header_value(&self) -> String {
        BASE64.encode(serde_json::to_vec(self).expect("receipt serializes"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReceiptQuery {
    pub tool_id: Option<String>,
    pub outcome: Option<Outcome>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiptStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub denied_count: u64,
    pub error_count: u64,
    /// `"p.pp%"` over all receipts.
    pub success_rate: String,
    pub avg_latency_ms: u64,
    pub total_revenue_usdc: String,
}

struct StatsCounters {
    total: AtomicU64,
    success: AtomicU64,
    denied: AtomicU64,
    error: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
    revenue_micros: AtomicU64,
}

impl StatsCounters {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            error: AtomicU64::new(0),
            latency_sum_ms: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            revenue_micros: AtomicU64::new(0),
        }
    }
}

/// Append-only receipt store with a ring bound; evicts oldest when full.
/// Counters are lifetime counters and survive eviction.
pub struct ReceiptEngine {
    receipts: RwLock<VecDeque<Receipt>>,
    counters: StatsCounters,
    max_receipts: usize,
    signer: Option<SigningKey>,
}

impl ReceiptEngine {
    pub fn new(max_receipts: usize, signer: Option<SigningKey>) -> Self {
        Self {
            receipts: RwLock::new(VecDeque::new()),
            counters: StatsCounters::new(),
            max_receipts: max_receipts.max(1),
            signer,
        }
    }

    /// Sign (when configured), store and count a finished receipt. Returns
    /// the stored receipt including its signature.
    pub fn emit(&self, mut receipt: Receipt) -> Receipt {
        if let Some(key) = &self.signer {
            receipt.receipt_signature = sign_receipt(&receipt, key);
        }

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        match receipt.outcome {
            Outcome::Success => {
                self.counters.success.fetch_add(1, Ordering::Relaxed);
                if let Ok(micros) = parse_usdc(&receipt.price_usdc) {
                    self.counters
                        .revenue_micros
                        .fetch_add(micros, Ordering::Relaxed);
                }
            }
            Outcome::Denied => {
                self.counters.denied.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Error | Outcome::Refunded => {
                self.counters.error.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(latency) = receipt.latency_ms {
            self.counters
                .latency_sum_ms
                .fetch_add(latency, Ordering::Relaxed);
            self.counters.latency_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut receipts = self.receipts.write().unwrap();
        if receipts.len() >= self.max_receipts {
            receipts.pop_front();
        }
        receipts.push_back(receipt.clone());
        receipt
    }

    /// Newest-first filtered page of stored receipts.
    pub fn query(&self, query: &ReceiptQuery) -> Vec<Receipt> {
        let limit = if query.limit == 0 { 50 } else { query.limit };
        let receipts = self.receipts.read().unwrap();
        receipts
            .iter()
            .rev()
            .filter(|r| {
                query
                    .tool_id
                    .as_ref()
                    .map(|t| &r.tool_id == t)
                    .unwrap_or(true)
                    && query.outcome.map(|o| r.outcome == o).unwrap_or(true)
            })
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> u64 {
        self.counters.total.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ReceiptStats {
        let total = self.counters.total.load(Ordering::Relaxed);
        let success = self.counters.success.load(Ordering::Relaxed);
        let latency_count = self.counters.latency_count.load(Ordering::Relaxed);
        let rate = if total == 0 {
            0.0
        } else {
            success as f64 * 100.0 / total as f64
        };
        ReceiptStats {
            total_requests: total,
            success_count: success,
            denied_count: self.counters.denied.load(Ordering::Relaxed),
            error_count: self.counters.error.load(Ordering::Relaxed),
            success_rate: format!("{:.2}%", rate),
            avg_latency_ms: if latency_count == 0 {
                0
            } else {
                self.counters.latency_sum_ms.load(Ordering::Relaxed) / latency_count
            },
            total_revenue_usdc: format_usdc(self.counters.revenue_micros.load(Ordering::Relaxed)),
        }
    }
}

/// EIP-191 signature over keccak of the canonical receipt JSON with the
/// signature field itself nulled out.
fn sign_receipt(receipt: &Receipt, key: &SigningKey) -> Option<String> {
    let mut value = serde_json::to_value(receipt).ok()?;
    if let Some(map) = value.as_object_mut() {
        map.remove("receipt_signature");
    }
    let digest = keccak256_hex(canonical_json(&value).as_bytes());
    personal_sign(&format!("0x{}", digest), key).ok()
}
