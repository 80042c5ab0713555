// =============================================================================
// ML validator / predictor and LLM decision clients
// =============================================================================
//
// Three external decision services sit behind plain JSON POSTs:
//
//   - validate-strategy-signal — the pre-dispatch trade gate (5 s deadline;
//     callers fail open on transport errors),
//   - predict-strategy        — the AI worker's primary model,
//   - the LLM decision endpoint — consulted when ML confidence is below the
//     strategy threshold.
//
// All three are fire-and-collect HTTP calls; retries are left to the caller
// because every call site has its own fail-open policy.
// =============================================================================

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{GatewayError, GatewayResult};

/// Deadline for the pre-dispatch validation gate.
const VALIDATE_TIMEOUT_SECS: u64 = 5;
/// Deadline for worker-side prediction and LLM calls.
const PREDICT_TIMEOUT_SECS: u64 = 15;

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// Outcome of the validation gate.
#[derive(Debug, Clone, Deserialize)]
pub struct MlValidation {
    pub confidence: u8,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub market_context: serde_json::Value,
    #[serde(default)]
    pub feature_scores: serde_json::Value,
}

/// The worker-side model's suggestion.
#[derive(Debug, Clone, Deserialize)]
pub struct MlPrediction {
    pub action: String,
    pub confidence: u8,
}

/// Action vocabulary shared by the ML and LLM decision paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerAction {
    Buy,
    Sell,
    Hold,
    Close,
}

impl WorkerAction {
    /// Parse the wire form, tolerating case.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "BUY" | "LONG" => Some(Self::Buy),
            "SELL" | "SHORT" => Some(Self::Sell),
            "HOLD" => Some(Self::Hold),
            "CLOSE" => Some(Self::Close),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

/// The LLM's decision for a strategy tick.
#[derive(Debug, Clone)]
pub struct LlmDecision {
    pub action: WorkerAction,
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// ML client
// ---------------------------------------------------------------------------

/// Client over the ML prediction service.
pub struct MlClient {
    base_url: String,
    validate_client: reqwest::Client,
    predict_client: reqwest::Client,
}

impl MlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let build = |secs: u64| {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(secs))
                .build()
                .expect("reqwest client builds with static configuration")
        };
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            validate_client: build(VALIDATE_TIMEOUT_SECS),
            predict_client: build(PREDICT_TIMEOUT_SECS),
        }
    }

    /// Pre-dispatch gate: score an inbound signal for an ML-assisted
    /// strategy. Callers treat transport errors as fail-open.
    #[instrument(skip(self, payload), name = "ml::validate")]
    pub async fn validate_signal(
        &self,
        payload: &serde_json::Value,
    ) -> GatewayResult<MlValidation> {
        let url = format!("{}/validate-strategy-signal", self.base_url);
        let resp = self
            .validate_client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| GatewayError::internal("ml", format!("validate request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::internal(
                "ml",
                format!("validate returned {status}"),
            ));
        }
        let validation: MlValidation = resp
            .json()
            .await
            .map_err(|e| GatewayError::internal("ml", format!("validate parse failed: {e}")))?;
        debug!(confidence = validation.confidence, "ml validation scored");
        Ok(validation)
    }

    /// Worker-side model: suggest an action for a strategy/symbol tick.
    #[instrument(skip(self, payload), name = "ml::predict")]
    pub async fn predict_strategy(
        &self,
        payload: &serde_json::Value,
    ) -> GatewayResult<MlPrediction> {
        let url = format!("{}/predict-strategy", self.base_url);
        let resp = self
            .predict_client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| GatewayError::internal("ml", format!("predict request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::internal(
                "ml",
                format!("predict returned {status}"),
            ));
        }
        resp.json()
            .await
            .map_err(|e| GatewayError::internal("ml", format!("predict parse failed: {e}")))
    }
}

impl std::fmt::Debug for MlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// LLM client
// ---------------------------------------------------------------------------

/// Client over the LLM decision endpoint.
pub struct LlmClient {
    endpoint: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(PREDICT_TIMEOUT_SECS))
                .build()
                .expect("reqwest client builds with static configuration"),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask for a trading decision given the strategy prompt and market
    /// context. Unknown actions in the reply resolve to HOLD.
    #[instrument(skip(self, context), name = "llm::decide")]
    pub async fn decide(&self, context: &serde_json::Value) -> GatewayResult<LlmDecision> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "model": self.model,
                "context": context,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::internal("llm", format!("decision request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::internal(
                "llm",
                format!("decision returned {status}"),
            ));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::internal("llm", format!("decision parse failed: {e}")))?;

        let action = body["action"]
            .as_str()
            .and_then(WorkerAction::parse)
            .unwrap_or(WorkerAction::Hold);
        Ok(LlmDecision {
            action,
            reasoning: body["reasoning"].as_str().unwrap_or_default().to_string(),
        })
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish()
    }
}

/// Build the validation payload for a pre-dispatch gate call.
pub fn validation_payload(
    user_id: &str,
    strategy_id: &str,
    symbol: &str,
    action: &str,
    position_size_usd: Option<Decimal>,
) -> serde_json::Value {
    serde_json::json!({
        "user_id": user_id,
        "strategy_id": strategy_id,
        "symbol": symbol,
        "action": action,
        "position_size_usd": position_size_usd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_action_parsing() {
        assert_eq!(WorkerAction::parse("BUY"), Some(WorkerAction::Buy));
        assert_eq!(WorkerAction::parse("sell"), Some(WorkerAction::Sell));
        assert_eq!(WorkerAction::parse(" hold "), Some(WorkerAction::Hold));
        assert_eq!(WorkerAction::parse("LONG"), Some(WorkerAction::Buy));
        assert_eq!(WorkerAction::parse("banana"), None);
    }

    #[test]
    fn validation_deserialises_with_defaults() {
        let v: MlValidation =
            serde_json::from_str(r#"{ "confidence": 55 }"#).expect("parses with defaults");
        assert_eq!(v.confidence, 55);
        assert!(v.reasons.is_empty());
    }

    #[test]
    fn validation_payload_shape() {
        let payload = validation_payload("u1", "s1", "BTCUSDT", "buy", None);
        assert_eq!(payload["strategy_id"], "s1");
        assert_eq!(payload["symbol"], "BTCUSDT");
        assert!(payload["position_size_usd"].is_null());
    }

    #[tokio::test]
    async fn unreachable_ml_service_errors_for_fail_open_callers() {
        let client = MlClient::new("http://192.0.2.1:1");
        let err = client
            .validate_signal(&serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Internal { .. }));
    }
}
