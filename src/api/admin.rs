//! Admin surface under `/admin`: route CRUD, receipt queries, blacklist and
//! config introspection. Guarded by a single static bearer key; the whole
//! surface is disabled when no key is configured.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{middleware, Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::api::errors::{ApiError, ApiResult};
use crate::api::openapi_import::{rules_from_openapi, ImportRequest};
use crate::gateway::pipeline::GatewayState;
use crate::gateway::routes::{write_routes_file, RouteError, RouteRule};
use crate::gateway::ssrf::{check_backend_url, probe_upstream_x402};
use crate::receipt::{Outcome, ReceiptQuery};
use crate::utils::crypto::is_evm_address;
use crate::utils::usdc::format_usdc;

pub fn router(state: Arc<GatewayState>) -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config))
        .route("/routes", get(list_routes).post(create_route))
        .route("/routes/import", post(import_routes))
        .route("/routes/:tool_id", put(update_route).delete(delete_route))
        .route("/receipts", get(list_receipts))
        .route("/receipts/stats", get(receipt_stats))
        .route("/blacklist", get(list_blacklist).post(add_blacklist))
        .route("/blacklist/:addr", delete(remove_blacklist))
        .route("/spend/:mandate_id", get(spend))
        .route("/reputation/:agent_id", get(reputation))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

/// Bearer-token gate in front of every admin handler.
async fn require_admin(
    State(state): State<Arc<GatewayState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let expected = match &state.config.admin_key {
        Some(key) => key,
        None => return ApiError::not_found("admin surface is disabled").into_response(),
    };
    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => next.run(request).await,
        _ => ApiError::unauthorized("missing or invalid admin key").into_response(),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    uptime_ms: u64,
    route_count: usize,
    receipt_count: u64,
}

async fn health(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_ms: state.started_at.elapsed().as_millis() as u64,
        route_count: state.routes.len(),
        receipt_count: state.receipts.count(),
    })
}

async fn config(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    let mut value = serde_json::to_value(state.config.masked()).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "facilitator_degraded".to_string(),
            json!(state.payments.is_degraded()),
        );
    }
    Json(value)
}

async fn list_routes(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    let routes: Vec<RouteRule> = state.routes.list().iter().map(|r| r.redacted()).collect();
    Json(json!({ "routes": routes }))
}

/// SSRF pre-check plus the one-shot upstream x402 probe, shared by create
/// and import.
async fn admit_backend(state: &GatewayState, rule: &RouteRule) -> ApiResult<()> {
    if !rule.skip_ssrf {
        if let Err(violation) = check_backend_url(&rule.backend_url) {
            return Err(ApiError::bad_request(&violation.to_string()).with_reason("SSRF_BLOCKED"));
        }
    }
    if !state.config.skip_x402_probe {
        if let Err(priced) = probe_upstream_x402(&state.http_client, &rule.backend_url).await {
            return Err(ApiError::bad_request(&format!(
                "upstream already answers with a {} payment challenge",
                priced.status
            ))
            .with_reason("X402_UPSTREAM_BLOCKED"));
        }
    }
    Ok(())
}

fn persist_routes(state: &GatewayState) {
    if let Some(path) = &state.config.routes_file {
        if let Err(e) = write_routes_file(path, &state.routes.list()) {
            warn!("failed to persist routes to {}: {}", path.display(), e);
        }
    }
}

async fn create_route(
    State(state): State<Arc<GatewayState>>,
    Json(rule): Json<RouteRule>,
) -> ApiResult<(StatusCode, Json<RouteRule>)> {
    rule.validate()
        .map_err(|e| ApiError::bad_request(&e.to_string()).with_reason("INVALID_ROUTE"))?;
    admit_backend(&state, &rule).await?;

    state.routes.insert(rule.clone()).map_err(|e| match e {
        RouteError::DuplicateToolId(_) => {
            ApiError::bad_request(&e.to_string()).with_reason("DUPLICATE_TOOL_ID")
        }
        other => ApiError::bad_request(&other.to_string()).with_reason("INVALID_ROUTE"),
    })?;
    persist_routes(&state);
    info!("route {} registered for {}", rule.tool_id, rule.path);
    Ok((StatusCode::CREATED, Json(rule.redacted())))
}

#[derive(Deserialize)]
struct RouteUpdate {
    #[serde(default)]
    price_usdc: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn update_route(
    State(state): State<Arc<GatewayState>>,
    Path(tool_id): Path<String>,
    Json(update): Json<RouteUpdate>,
) -> ApiResult<Json<RouteRule>> {
    let updated = state
        .routes
        .update(&tool_id, update.price_usdc, update.description)
        .map_err(|e| match e {
            RouteError::UnknownToolId(_) => ApiError::not_found(&e.to_string()),
            other => ApiError::bad_request(&other.to_string()).with_reason("INVALID_ROUTE"),
        })?;
    persist_routes(&state);
    Ok(Json(updated.redacted()))
}

async fn delete_route(
    State(state): State<Arc<GatewayState>>,
    Path(tool_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let removed = state
        .routes
        .remove(&tool_id)
        .map_err(|e| ApiError::not_found(&e.to_string()))?;
    persist_routes(&state);
    info!("route {} removed", removed.tool_id);
    Ok(Json(json!({ "deleted": removed.tool_id })))
}

#[derive(Serialize)]
struct ImportResponse {
    created: Vec<String>,
    skipped: Vec<String>,
}

async fn import_routes(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<(StatusCode, Json<ImportResponse>)> {
    let rules = rules_from_openapi(&request)
        .map_err(|e| ApiError::bad_request(&e).with_reason("INVALID_OPENAPI"))?;
    if rules.is_empty() {
        return Err(ApiError::bad_request("document contains no importable operations")
            .with_reason("INVALID_OPENAPI"));
    }

    // One backend, one screening.
    admit_backend(&state, &rules[0]).await?;

    let mut created = Vec::new();
    let mut skipped = Vec::new();
    for rule in rules {
        let tool_id = rule.tool_id.clone();
        match state.routes.insert(rule) {
            Ok(()) => created.push(tool_id),
            Err(e) => {
                warn!("import skipped {}: {}", tool_id, e);
                skipped.push(tool_id);
            }
        }
    }
    persist_routes(&state);
    Ok((StatusCode::CREATED, Json(ImportResponse { created, skipped })))
}

#[derive(Deserialize)]
struct ReceiptsParams {
    #[serde(default)]
    tool_id: Option<String>,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

async fn list_receipts(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<ReceiptsParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = match &params.outcome {
        Some(raw) => Some(parse_outcome(raw)?),
        None => None,
    };
    let receipts = state.receipts.query(&ReceiptQuery {
        tool_id: params.tool_id,
        outcome,
        limit: params.limit.unwrap_or(50).min(500),
        offset: params.offset.unwrap_or(0),
    });
    Ok(Json(json!({ "receipts": receipts })))
}

fn parse_outcome(raw: &str) -> ApiResult<Outcome> {
    serde_json::from_value(json!(raw.to_uppercase()))
        .map_err(|_| ApiError::bad_request(&format!("unknown outcome {}", raw)))
}

async fn receipt_stats(State(state): State<Arc<GatewayState>>) -> Json<crate::receipt::ReceiptStats> {
    Json(state.receipts.stats())
}

async fn list_blacklist(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    Json(json!({ "addresses": state.policy.blacklist.list() }))
}

#[derive(Deserialize)]
struct BlacklistEntry {
    address: String,
}

async fn add_blacklist(
    State(state): State<Arc<GatewayState>>,
    Json(entry): Json<BlacklistEntry>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if !is_evm_address(&entry.address) {
        return Err(
            ApiError::bad_request("address is not a valid EVM address")
                .with_reason("INVALID_ADDRESS"),
        );
    }
    state.policy.blacklist.add(&entry.address);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "blocked": entry.address.to_lowercase() })),
    ))
}

async fn remove_blacklist(
    State(state): State<Arc<GatewayState>>,
    Path(addr): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.policy.blacklist.remove(&addr) {
        return Err(ApiError::not_found("address is not blacklisted"));
    }
    Ok(Json(json!({ "unblocked": addr.to_lowercase() })))
}

/// `intent-*` ids live in the lifetime ledger, everything else in the daily
/// ledger; the two never mix.
async fn spend(
    State(state): State<Arc<GatewayState>>,
    Path(mandate_id): Path<String>,
) -> Json<serde_json::Value> {
    if mandate_id.starts_with("intent-") {
        Json(json!({
            "mandate_id": mandate_id,
            "spent_lifetime_usdc": format_usdc(state.ledgers.lifetime_spent(&mandate_id)),
        }))
    } else {
        Json(json!({
            "mandate_id": mandate_id,
            "spent_today_usdc": format_usdc(state.ledgers.daily_spent(&mandate_id)),
        }))
    }
}

async fn reputation(
    State(state): State<Arc<GatewayState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.policy.reputation_enabled() {
        return Err(ApiError::service_unavailable("reputation oracle is not configured"));
    }
    match state.policy.reputation_of(&agent_id).await {
        Some((count, score)) => Ok(Json(json!({
            "agent_id": agent_id,
            "count": count,
            "score": score,
        }))),
        None => Err(ApiError::not_found("reputation lookup failed")),
    }
}
