// =============================================================================
// HTTP surface — Axum 0.7
// =============================================================================
//
// POST /webhook         — the signal intake (authenticated by webhook secret)
// GET  /health          — uptime, open positions, adapter reachability
// GET  /positions       — tracked-position summary (no credential data)
// POST /positions/sync  — manual reconciliation against every venue
//
// The probes authenticate with the operator admin token; the webhook
// authenticates per user. One audit row is written for every inbound webhook
// request, including those rejected before routing, and no response body
// ever carries the secret back.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::error::GatewayError;
use crate::intent::{self, RawAlert};
use crate::store::WebhookRequestRecord;
use crate::types::RequestStatus;

use super::secret::{admin_token_valid, constant_time_eq};

/// Budget for one adapter reachability probe in /health.
const PROBE_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .route("/positions", get(positions))
        .route("/positions/sync", post(positions_sync))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Webhook intake
// =============================================================================

async fn webhook(State(state): State<Arc<AppState>>, body: String) -> Response {
    // ── Per-process rate limit ───────────────────────────────────────────
    if !state.rate_limiter.try_acquire() {
        return reply(
            StatusCode::TOO_MANY_REQUESTS,
            json!({ "success": false, "error": "rate limit exceeded" }),
        );
    }

    let request_id = uuid::Uuid::new_v4().to_string();

    // ── Parse ────────────────────────────────────────────────────────────
    let alert: RawAlert = match serde_json::from_str(&body) {
        Ok(alert) => alert,
        Err(e) => {
            // Unparseable bodies are logged without content so a secret in a
            // malformed payload cannot leak into the audit trail.
            log_request(
                &state,
                WebhookRequestRecord {
                    id: request_id,
                    user_id: None,
                    exchange: None,
                    action: None,
                    symbol: None,
                    payload: json!({ "unparseable": true }),
                    status: RequestStatus::Rejected,
                    error_message: Some(format!("body parse failed: {e}")),
                    processed_at: Utc::now(),
                },
            )
            .await;
            return reply(
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "error": format!("invalid JSON body: {e}") }),
            );
        }
    };

    // ── Authenticate by webhook secret ───────────────────────────────────
    let presented = match alert.secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => secret,
        None => {
            log_rejected(&state, &request_id, &alert, None, "missing secret").await;
            return reply(
                StatusCode::UNAUTHORIZED,
                json!({ "success": false, "error": "missing webhook secret" }),
            );
        }
    };

    let user = match state.store.find_user_by_webhook_secret(presented).await {
        Ok(Some(user))
            if constant_time_eq(user.webhook_secret.as_bytes(), presented.as_bytes()) =>
        {
            user
        }
        Ok(_) => {
            warn!("webhook secret did not match any user");
            log_rejected(&state, &request_id, &alert, None, "invalid secret").await;
            return reply(
                StatusCode::UNAUTHORIZED,
                json!({ "success": false, "error": "invalid webhook secret" }),
            );
        }
        Err(e) => {
            warn!(error = %e, "user lookup failed");
            log_rejected(&state, &request_id, &alert, None, "user lookup failed").await;
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "success": false, "error": "authentication backend unavailable" }),
            );
        }
    };

    // ── Pending audit row ────────────────────────────────────────────────
    log_request(
        &state,
        WebhookRequestRecord {
            id: request_id.clone(),
            user_id: Some(user.user_id.clone()),
            exchange: alert.exchange.clone(),
            action: alert.action.clone(),
            symbol: alert.symbol.clone(),
            payload: alert.redacted_payload(),
            status: RequestStatus::Pending,
            error_message: None,
            processed_at: Utc::now(),
        },
    )
    .await;

    // ── Normalise ────────────────────────────────────────────────────────
    let trade_intent = match intent::normalise(&alert, &user.user_id) {
        Ok(intent) => intent,
        Err(e) => {
            finalize(&state, &request_id, RequestStatus::Rejected, Some(e.to_string())).await;
            return reply(
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "error": e.to_string() }),
            );
        }
    };

    info!(
        user_id = %trade_intent.user_id,
        venue = %trade_intent.venue,
        symbol = %trade_intent.symbol,
        action = %trade_intent.action,
        signal_id = %trade_intent.signal_id,
        "webhook accepted for execution"
    );

    // ── Execute ──────────────────────────────────────────────────────────
    match state.executor.execute(&trade_intent).await {
        Ok(report) => {
            let note = report.note.clone();
            finalize(&state, &request_id, RequestStatus::Executed, note).await;
            reply(StatusCode::OK, json!(report))
        }
        Err(e) => {
            let (status, request_status) = classify(&e);
            if request_status == RequestStatus::Failed {
                state
                    .notifier
                    .trade_failed(
                        &trade_intent.user_id,
                        &trade_intent.venue,
                        &trade_intent.symbol,
                        &e.to_string(),
                    )
                    .await;
            }
            finalize(&state, &request_id, request_status, Some(e.to_string())).await;
            reply(status, error_body(&e))
        }
    }
}

/// Map an execution error onto the HTTP status and the audit status.
fn classify(error: &GatewayError) -> (StatusCode, RequestStatus) {
    match error {
        GatewayError::Auth(_) => (StatusCode::UNAUTHORIZED, RequestStatus::Rejected),
        GatewayError::OverLimit { .. } => (StatusCode::TOO_MANY_REQUESTS, RequestStatus::Rejected),
        GatewayError::Input { .. }
        | GatewayError::OutsideWindow(_)
        | GatewayError::SymbolDenied(_)
        | GatewayError::Unsupported { .. }
        | GatewayError::NoCredentials { .. }
        | GatewayError::NothingToClose { .. } => (StatusCode::BAD_REQUEST, RequestStatus::Rejected),
        GatewayError::MlBlocked { .. } => (StatusCode::OK, RequestStatus::Rejected),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, RequestStatus::Failed),
    }
}

fn error_body(error: &GatewayError) -> serde_json::Value {
    match error {
        GatewayError::OverLimit {
            limit,
            current,
            cap,
        } => json!({
            "success": false,
            "error": error.to_string(),
            "limit": limit,
            "current": current,
            "cap": cap,
        }),
        _ => json!({ "success": false, "error": error.to_string() }),
    }
}

async fn log_request(state: &AppState, row: WebhookRequestRecord) {
    if let Err(e) = state.store.insert_webhook_request(&row).await {
        warn!(error = %e, "webhook audit write failed");
    }
}

async fn log_rejected(
    state: &AppState,
    request_id: &str,
    alert: &RawAlert,
    user_id: Option<String>,
    reason: &str,
) {
    log_request(
        state,
        WebhookRequestRecord {
            id: request_id.to_string(),
            user_id,
            exchange: alert.exchange.clone(),
            action: alert.action.clone(),
            symbol: alert.symbol.clone(),
            payload: alert.redacted_payload(),
            status: RequestStatus::Rejected,
            error_message: Some(reason.to_string()),
            processed_at: Utc::now(),
        },
    )
    .await;
}

async fn finalize(
    state: &AppState,
    request_id: &str,
    status: RequestStatus,
    error_message: Option<String>,
) {
    if let Err(e) = state
        .store
        .finalize_webhook_request(request_id, status, error_message)
        .await
    {
        warn!(error = %e, "webhook audit finalize failed");
    }
}

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

// =============================================================================
// Authenticated probes
// =============================================================================

fn authenticated(state: &AppState, headers: &HeaderMap) -> bool {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    admin_token_valid(presented, &state.admin_token)
}

fn forbidden() -> Response {
    reply(
        StatusCode::FORBIDDEN,
        json!({ "error": "missing or invalid authorization token" }),
    )
}

async fn health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authenticated(&state, &headers) {
        return forbidden();
    }

    let mut adapters = serde_json::Map::new();
    for ((user_id, venue), adapter) in state.registry.cached() {
        let reachable = tokio::time::timeout(
            Duration::from_secs(PROBE_TIMEOUT_SECS),
            adapter.probe(),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
        adapters.insert(format!("{user_id}:{venue}"), json!(reachable));
    }

    reply(
        StatusCode::OK,
        json!({
            "status": "ok",
            "uptime_secs": state.uptime_secs(),
            "open_positions": state.tracker.count(),
            "adapters": adapters,
            "server_time": Utc::now().timestamp_millis(),
        }),
    )
}

async fn positions(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authenticated(&state, &headers) {
        return forbidden();
    }
    reply(StatusCode::OK, json!(state.tracker.summary()))
}

/// Manual reconciliation: every credential record's venue is re-read and the
/// tracker replaced per (user, venue).
async fn positions_sync(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authenticated(&state, &headers) {
        return forbidden();
    }

    let credentials = match state.store.list_credentials().await {
        Ok(credentials) => credentials,
        Err(e) => {
            warn!(error = %e, "credential listing failed during sync");
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "credential listing failed" }),
            );
        }
    };

    let mut results = serde_json::Map::new();
    for record in credentials {
        let key = format!("{}:{}", record.user_id, record.venue);
        let outcome = match state.registry.resolve(&record.user_id, &record.venue).await {
            Ok(adapter) => {
                match state
                    .tracker
                    .reconcile(&record.user_id, &record.venue, adapter.as_ref())
                    .await
                {
                    Ok(count) => json!({ "ok": true, "positions": count }),
                    Err(e) => json!({ "ok": false, "error": e.to_string() }),
                }
            }
            Err(e) => json!({ "ok": false, "error": e.to_string() }),
        };
        results.insert(key, outcome);
    }

    info!(pairs = results.len(), "manual reconciliation complete");
    reply(StatusCode::OK, json!({ "synced": results }))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn error_classification() {
        let over = GatewayError::OverLimit {
            limit: "max_trades_per_week".to_string(),
            current: dec!(5),
            cap: dec!(5),
        };
        assert_eq!(classify(&over).0, StatusCode::TOO_MANY_REQUESTS);

        let input = GatewayError::input("symbol", "missing");
        assert_eq!(classify(&input).0, StatusCode::BAD_REQUEST);

        let window = GatewayError::OutsideWindow("09:30-16:00".to_string());
        assert_eq!(classify(&window).0, StatusCode::BAD_REQUEST);

        let internal = GatewayError::internal("store", "down");
        let (status, request_status) = classify(&internal);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(request_status, RequestStatus::Failed);
    }

    #[test]
    fn over_limit_body_names_the_limit() {
        let over = GatewayError::OverLimit {
            limit: "max_trades_per_week".to_string(),
            current: dec!(5),
            cap: dec!(5),
        };
        let body = error_body(&over);
        assert_eq!(body["limit"], "max_trades_per_week");
        assert_eq!(body["success"], false);
        assert_eq!(body["current"], serde_json::json!("5"));
    }
}
