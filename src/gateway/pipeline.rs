//! Pipeline orchestrator: wires the admission stages in a fixed order for
//! `/api/*` traffic and guarantees exactly one receipt per terminal verdict.
//!
//! `route-match → idempotency → mandate → payment → agent-policy →
//! upstream-proxy → receipt`

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::errors::ApiError;
use crate::api::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::config::GatewayConfig;
use crate::gateway::proxy::{ProxiedResponse, UpstreamFailure, UpstreamProxy};
use crate::gateway::replay::ReplayStore;
use crate::gateway::routes::{load_routes_file, RouteRule, RouteTable};
use crate::mandate::intent::normalize_domain;
use crate::mandate::ledger::{SpendLedgers, TentativeCharge};
use crate::mandate::{verify_and_charge, MandateContext, MandateOutcome};
use crate::payment::{
    encode_requirements_header, Facilitator, HttpFacilitator, PaymentDecision, PaymentGate,
};
use crate::policy::{AgentPolicy, EvmReputationOracle, PolicyDecision, ReputationOracle};
use crate::receipt::{
    MandateVerdict, Outcome, ReasonCode, Receipt, ReceiptEngine, DEFAULT_MAX_RECEIPTS,
};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::crypto::{request_fingerprint, signing_key_from_hex};

pub const HEADER_IDEMPOTENCY_KEY: &str = "x-request-idempotency-key";
pub const HEADER_PAYMENT: &str = "x-payment";
pub const HEADER_MANDATE: &str = "x-mandate";
pub const HEADER_AGENT_ADDRESS: &str = "x-agent-address";
pub const HEADER_AGENT_ID: &str = "x-agent-id";
pub const HEADER_RECEIPT: &str = "x-receipt";
pub const HEADER_PAYMENT_REQUIRED: &str = "payment-required";

/// Process-wide state, initialized in dependency order at startup.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub clock: Arc<dyn Clock>,
    pub routes: RouteTable,
    pub replay: ReplayStore,
    pub ledgers: SpendLedgers,
    pub payments: PaymentGate,
    pub policy: AgentPolicy,
    pub proxy: UpstreamProxy,
    pub receipts: ReceiptEngine,
    pub rate_limiter: RateLimiter,
    pub http_client: reqwest::Client,
    pub started_at: Instant,
}

impl GatewayState {
    /// Assemble state from parts; tests inject fakes here.
    pub fn new(
        config: GatewayConfig,
        clock: Arc<dyn Clock>,
        facilitator: Option<Arc<dyn Facilitator>>,
        facilitator_degraded: bool,
        oracle: Option<Arc<dyn ReputationOracle>>,
    ) -> Result<Self> {
        let routes = match &config.routes_file {
            Some(path) if path.exists() => {
                let rules = load_routes_file(path)?;
                info!("loaded {} routes from {}", rules.len(), path.display());
                RouteTable::from_rules(rules).map_err(|e| anyhow::anyhow!("{}", e))?
            }
            _ => RouteTable::new(),
        };

        let signer = match &config.gateway_signing_key {
            Some(key_hex) => Some(
                signing_key_from_hex(key_hex).context("GATEWAY_SIGNING_KEY is not a valid key")?,
            ),
            None => None,
        };

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("building HTTP client")?;

        let payments = PaymentGate::new(
            facilitator,
            "exact",
            config.network.clone(),
            config.pay_to_address.clone(),
            facilitator_degraded,
        );

        Ok(Self {
            replay: ReplayStore::new(clock.clone()),
            ledgers: SpendLedgers::new(clock.clone()),
            policy: AgentPolicy::new(oracle, config.reputation_min_score, clock.clone()),
            proxy: UpstreamProxy::new(http_client.clone()),
            receipts: ReceiptEngine::new(DEFAULT_MAX_RECEIPTS, signer),
            rate_limiter: RateLimiter::new(RateLimitConfig {
                per_ip_per_minute: config.rate_limit_per_min,
            }),
            payments,
            routes,
            http_client,
            clock,
            config,
            started_at: Instant::now(),
        })
    }

    /// Production wiring: probe the facilitator, hook up the reputation
    /// oracle, use the system clock.
    pub async fn init(config: GatewayConfig) -> Result<Arc<Self>> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        // Facilitator and oracle calls share the per-request deadline.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("building outbound HTTP client")?;

        let (facilitator, degraded): (Option<Arc<dyn Facilitator>>, bool) =
            match &config.facilitator_url {
                Some(url) => {
                    let facilitator = HttpFacilitator::new(client.clone(), url.clone());
                    let reachable = facilitator.probe().await;
                    if !reachable {
                        warn!(
                            "facilitator {} unreachable at startup; paid routes degrade to pass-through",
                            url
                        );
                    }
                    (Some(Arc::new(facilitator)), !reachable)
                }
                None => {
                    warn!("FACILITATOR_URL not set; paid routes pass through without settlement");
                    (None, false)
                }
            };

        let oracle: Option<Arc<dyn ReputationOracle>> = match (
            &config.reputation_rpc_url,
            &config.reputation_contract,
        ) {
            (Some(rpc), Some(contract)) => Some(Arc::new(EvmReputationOracle::new(
                client.clone(),
                rpc.clone(),
                contract.clone(),
            ))),
            _ => None,
        };

        Ok(Arc::new(Self::new(
            config, clock, facilitator, degraded, oracle,
        )?))
    }

    /// Merchant identity used by intent-mandate checks: the configured
    /// domain, else the request `Host`, lowercased and port-stripped.
    pub fn merchant_domain(&self, host_header: Option<&str>) -> String {
        match &self.config.gateway_domain {
            Some(domain) => normalize_domain(domain),
            None => normalize_domain(host_header.unwrap_or("localhost")),
        }
    }
}

/// Inbound request distilled to what the pipeline consumes; the axum
/// adapter and tests both construct this directly.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub method: String,
    pub path: String,
    pub query_string: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
}

impl PipelineRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        match &self.query_string {
            Some(raw) => url::form_urlencoded::parse(raw.as_bytes())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn path_and_query(&self) -> String {
        match &self.query_string {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }
}

/// Request-scoped state allocated at pipeline entry.
struct RequestCtx {
    request_id: String,
    started: Instant,
    timestamp: String,
    chain: String,
}

impl RequestCtx {
    fn new(state: &GatewayState) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
            timestamp: state
                .clock
                .now()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            chain: state.config.network.clone(),
        }
    }
}

/// Receipt fields accumulated while the request walks the stages.
struct ReceiptDraft {
    tool_id: String,
    provider_id: String,
    endpoint: String,
    method: String,
    price_usdc: String,
    mandate_id: Option<String>,
    mandate_hash: Option<String>,
    mandate_verdict: MandateVerdict,
    payment_tx_hash: Option<String>,
    facilitator_receipt_id: Option<String>,
    request_hash: String,
    response_hash: Option<String>,
    latency_ms: Option<u64>,
}

impl ReceiptDraft {
    fn new(method: &str, path: &str) -> Self {
        Self {
            tool_id: "unknown".to_string(),
            provider_id: "unknown".to_string(),
            endpoint: path.to_string(),
            method: method.to_uppercase(),
            price_usdc: "0.00".to_string(),
            mandate_id: None,
            mandate_hash: None,
            mandate_verdict: MandateVerdict::Skipped,
            payment_tx_hash: None,
            facilitator_receipt_id: None,
            request_hash: String::new(),
            response_hash: None,
            latency_ms: None,
        }
    }

    fn set_route(&mut self, rule: &RouteRule) {
        self.tool_id = rule.tool_id.clone();
        self.provider_id = rule.provider_id.clone();
        self.price_usdc = rule.price_usdc.clone();
    }

    fn set_mandate(&mut self, outcome: &MandateOutcome) {
        self.mandate_id = outcome.mandate_id.clone();
        self.mandate_hash = outcome.mandate_hash.clone();
        self.mandate_verdict = outcome.verdict;
    }

    fn finish(
        self,
        ctx: &RequestCtx,
        outcome: Outcome,
        reason: ReasonCode,
        explanation: String,
    ) -> Receipt {
        Receipt {
            request_id: ctx.request_id.clone(),
            tool_id: self.tool_id,
            provider_id: self.provider_id,
            endpoint: self.endpoint,
            method: self.method,
            timestamp: ctx.timestamp.clone(),
            price_usdc: self.price_usdc,
            currency: "USDC".to_string(),
            chain: ctx.chain.clone(),
            mandate_id: self.mandate_id,
            mandate_hash: self.mandate_hash,
            mandate_verdict: self.mandate_verdict,
            reason_code: reason,
            payment_tx_hash: self.payment_tx_hash,
            facilitator_receipt_id: self.facilitator_receipt_id,
            request_hash: self.request_hash,
            response_hash: self.response_hash,
            latency_ms: self.latency_ms,
            outcome,
            explanation,
            receipt_signature: None,
        }
    }
}

/// Axum adapter for `/api/*`. Panics inside the pipeline are caught at this
/// worker boundary and surfaced as a synthetic 500 receipt.
pub async fn dispatch_api(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.config.max_upstream_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::payload_too_large("request body exceeds the configured limit")
                .into_response()
        }
    };

    let pipeline_request = PipelineRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query_string: parts.uri.query().map(|q| q.to_string()),
        headers: parts.headers,
        body,
        client_ip: addr.ip().to_string(),
    };

    let method = pipeline_request.method.clone();
    let path = pipeline_request.path.clone();
    let task_state = state.clone();
    match tokio::spawn(async move { run_pipeline(task_state, pipeline_request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(
                "pipeline panicked handling {} {}: {}",
                method, path, join_error
            );
            let ctx = RequestCtx::new(&state);
            let draft = ReceiptDraft::new(&method, &path);
            let receipt = state.receipts.emit(draft.finish(
                &ctx,
                Outcome::Error,
                ReasonCode::InternalError,
                "internal gateway error".to_string(),
            ));
            receipt_response(StatusCode::INTERNAL_SERVER_ERROR, &receipt)
        }
    }
}

/// The fixed-order admission pipeline. Every terminal verdict emits exactly
/// one receipt before responding.
pub async fn run_pipeline(state: Arc<GatewayState>, req: PipelineRequest) -> Response {
    let ctx = RequestCtx::new(&state);
    let mut draft = ReceiptDraft::new(&req.method, &req.path);

    // Global pre-filter: per-IP rate limit.
    if let Err(e) = state.rate_limiter.check(&req.client_ip) {
        let receipt = state.receipts.emit(draft.finish(
            &ctx,
            Outcome::Denied,
            ReasonCode::RateLimited,
            e.to_string(),
        ));
        return receipt_response(StatusCode::TOO_MANY_REQUESTS, &receipt);
    }

    // Stage 1: route match over the current snapshot.
    let snapshot = state.routes.snapshot();
    let matched = match snapshot.match_route(&req.method, &req.path) {
        Some(matched) => matched,
        None => {
            let receipt = state.receipts.emit(draft.finish(
                &ctx,
                Outcome::Denied,
                ReasonCode::RouteNotFound,
                format!("no route for {} {}", req.method, req.path),
            ));
            return receipt_response(StatusCode::NOT_FOUND, &receipt);
        }
    };
    let rule = matched.rule.clone();
    draft.set_route(&rule);

    // Canonical fingerprint; also recorded on the receipt as request_hash.
    let idempotency_key = req.header(HEADER_IDEMPOTENCY_KEY).unwrap_or("");
    let time_window = (state.clock.now_ms().max(0) as u64) / state.config.replay_ttl_ms.max(1);
    let fingerprint = request_fingerprint(
        &req.method,
        &req.path,
        &req.query_pairs(),
        &req.body,
        &rule.price_usdc,
        idempotency_key,
        time_window,
    );
    draft.request_hash = fingerprint.clone();

    // Stage 2: replay suppression, only armed when the caller opted in with
    // an idempotency key.
    if !idempotency_key.is_empty()
        && state
            .replay
            .check_and_remember(&fingerprint, state.config.replay_ttl_ms)
    {
        let receipt = state.receipts.emit(draft.finish(
            &ctx,
            Outcome::Denied,
            ReasonCode::ReplayDetected,
            format!("duplicate request within {} ms", state.config.replay_ttl_ms),
        ));
        return receipt_response(StatusCode::CONFLICT, &receipt);
    }

    // Stage 3: mandate verification; approval charges the ledger up front.
    let gateway_domain = state.merchant_domain(req.header("host"));
    let mandate_outcome = match verify_and_charge(
        &state.ledgers,
        req.header(HEADER_MANDATE),
        &MandateContext {
            tool_id: &rule.tool_id,
            price_micros: rule.price_micros(),
            gateway_domain: &gateway_domain,
            now: state.clock.now(),
        },
    ) {
        Ok(outcome) => outcome,
        // Undecodable header is a client error, not a pipeline verdict.
        Err(malformed) => return ApiError::bad_request(&malformed.to_string()).into_response(),
    };
    draft.set_mandate(&mandate_outcome);
    if let Some(reason) = mandate_outcome.deny_reason {
        let receipt = state.receipts.emit(draft.finish(
            &ctx,
            Outcome::Denied,
            reason,
            mandate_outcome
                .explanation
                .unwrap_or_else(|| "mandate denied".to_string()),
        ));
        return receipt_response(StatusCode::FORBIDDEN, &receipt);
    }
    let tentative_charge = mandate_outcome.charge;

    // Stage 4: payment gate.
    let payment_ctx = match state
        .payments
        .admit(
            rule.price_micros(),
            &rule.price_usdc,
            &req.path,
            req.header(HEADER_PAYMENT),
        )
        .await
    {
        PaymentDecision::NotRequired => None,
        PaymentDecision::PassThrough => {
            if rule.price_micros() > 0 {
                warn!(
                    "facilitator unavailable; passing paid route {} through without settlement",
                    rule.tool_id
                );
            }
            None
        }
        PaymentDecision::Challenge(requirements) => {
            revert_charge(&state.ledgers, &tentative_charge);
            let receipt = state.receipts.emit(draft.finish(
                &ctx,
                Outcome::Denied,
                ReasonCode::InvalidPayment,
                format!("payment of {} required", rule.price_usdc),
            ));
            return challenge_response(&receipt, &requirements);
        }
        PaymentDecision::Rejected { reason } => {
            revert_charge(&state.ledgers, &tentative_charge);
            let receipt = state.receipts.emit(draft.finish(
                &ctx,
                Outcome::Denied,
                ReasonCode::InvalidPayment,
                reason,
            ));
            return receipt_response(StatusCode::PAYMENT_REQUIRED, &receipt);
        }
        PaymentDecision::Verified(payment_ctx) => Some(*payment_ctx),
    };

    // Stage 5: agent policy.
    if let PolicyDecision::Denied {
        reason,
        explanation,
    } = state
        .policy
        .check(req.header(HEADER_AGENT_ADDRESS), req.header(HEADER_AGENT_ID))
        .await
    {
        revert_charge(&state.ledgers, &tentative_charge);
        let receipt =
            state
                .receipts
                .emit(draft.finish(&ctx, Outcome::Denied, reason, explanation));
        return receipt_response(StatusCode::FORBIDDEN, &receipt);
    }

    // Stage 6: proxy upstream.
    let deadline = Duration::from_secs(state.config.request_timeout_secs);
    let upstream = state
        .proxy
        .forward(
            &rule,
            &req.method,
            &req.path_and_query(),
            &req.headers,
            &req.body,
            deadline,
        )
        .await;

    match upstream {
        Err(UpstreamFailure::Ssrf(violation)) => {
            // Runtime SSRF re-check tripped: a gateway refusal, not an
            // upstream fault, and nothing is captured.
            revert_charge(&state.ledgers, &tentative_charge);
            let receipt = state.receipts.emit(draft.finish(
                &ctx,
                Outcome::Denied,
                ReasonCode::SsrfBlocked,
                violation.to_string(),
            ));
            receipt_response(StatusCode::FORBIDDEN, &receipt)
        }
        Err(failure) => {
            // Verified-but-unsettled payments are never captured on an
            // upstream failure; tentative mandate spend is rolled back.
            revert_charge(&state.ledgers, &tentative_charge);
            draft.price_usdc = "0.00".to_string();
            draft.latency_ms = Some(ctx.started.elapsed().as_millis() as u64);
            let receipt = state.receipts.emit(draft.finish(
                &ctx,
                Outcome::Error,
                ReasonCode::UpstreamErrorNoCharge,
                failure.to_string(),
            ));
            receipt_response(StatusCode::BAD_GATEWAY, &receipt)
        }
        Ok(response) if response.status < 300 => {
            let mut explanation = "ok".to_string();
            if let Some(payment_ctx) = &payment_ctx {
                let settlement = state.payments.settle(payment_ctx).await;
                draft.payment_tx_hash = settlement.tx_hash;
                draft.facilitator_receipt_id = settlement.facilitator_receipt_id;
                if let Some(note) = settlement.note {
                    explanation = note;
                }
            } else if rule.price_micros() > 0 {
                explanation = "paid route served without settlement (facilitator degraded)"
                    .to_string();
            }
            draft.response_hash = Some(response.response_hash.clone());
            draft.latency_ms = Some(response.latency_ms);
            let receipt = state.receipts.emit(draft.finish(
                &ctx,
                Outcome::Success,
                ReasonCode::Ok,
                explanation,
            ));
            proxied_response(&receipt, response)
        }
        Ok(response) => {
            // Upstream answered with a client error: the provider did its
            // work, so the payment still settles and the spend stands.
            let mut explanation = format!("upstream returned {}", response.status);
            if let Some(payment_ctx) = &payment_ctx {
                let settlement = state.payments.settle(payment_ctx).await;
                draft.payment_tx_hash = settlement.tx_hash;
                draft.facilitator_receipt_id = settlement.facilitator_receipt_id;
                if let Some(note) = settlement.note {
                    explanation = format!("{}; {}", explanation, note);
                }
            }
            draft.response_hash = Some(response.response_hash.clone());
            draft.latency_ms = Some(response.latency_ms);
            let receipt = state.receipts.emit(draft.finish(
                &ctx,
                Outcome::Denied,
                ReasonCode::UpstreamRejected,
                explanation,
            ));
            proxied_response(&receipt, response)
        }
    }
}

fn revert_charge(ledgers: &SpendLedgers, charge: &Option<TentativeCharge>) {
    if let Some(charge) = charge {
        ledgers.revert(charge);
    }
}

/// Gateway-terminal response: receipt in the body and in the header.
fn receipt_response(status: StatusCode, receipt: &Receipt) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header(HEADER_RECEIPT, receipt.to_header_value())
        .body(Body::from(
            serde_json::to_vec(receipt).expect("receipt serializes"),
        ))
        .expect("receipt response builds")
}

/// 402 challenge: the JSON body carries the denial receipt with the payment
/// requirements object merged in, and the requirements travel base64-encoded
/// in the `payment-required` header as well.
fn challenge_response(
    receipt: &Receipt,
    requirements: &crate::payment::PaymentRequirements,
) -> Response {
    let mut body = serde_json::to_value(receipt).expect("receipt serializes");
    let requirements_value =
        serde_json::to_value(requirements).expect("requirements serialize");
    if let (Some(map), Some(fields)) = (body.as_object_mut(), requirements_value.as_object()) {
        for (key, value) in fields {
            map.insert(key.clone(), value.clone());
        }
        map.insert(
            "error".to_string(),
            serde_json::Value::String("PAYMENT_REQUIRED".to_string()),
        );
    }
    Response::builder()
        .status(StatusCode::PAYMENT_REQUIRED)
        .header("content-type", "application/json")
        .header(HEADER_PAYMENT_REQUIRED, encode_requirements_header(requirements))
        .header(HEADER_RECEIPT, receipt.to_header_value())
        .body(Body::from(
            serde_json::to_vec(&body).expect("challenge body serializes"),
        ))
        .expect("challenge response builds")
}

/// Proxied response: upstream status and body pass through; the receipt
/// rides in its header.
fn proxied_response(receipt: &Receipt, upstream: ProxiedResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK))
        .header(HEADER_RECEIPT, receipt.to_header_value());
    if let Some(content_type) = &upstream.content_type {
        builder = builder.header("content-type", content_type);
    }
    builder
        .body(Body::from(upstream.body))
        .expect("proxied response builds")
}
