// =============================================================================
// RestStore — PostgREST-style client over the relational service
// =============================================================================
//
// The service exposes each logical table as a REST resource with query-string
// filters (`user_id=eq.u1`). The gateway authenticates with a service key
// sent on every request; row-level authorisation is enforced server-side.
//
// SECURITY: the service key is held in the default header map and never
// surfaces in logs or error messages.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::error::{GatewayError, GatewayResult};
use crate::types::RequestStatus;

use super::{
    AiDecisionRecord, AiStrategyRecord, AiStrategyStatus, CredentialRecord,
    ExchangeSettingsRecord, NotificationRecord, PositionRecord, Store, StrategyRecord,
    TradeRecord, UserRecord, ValidationLogRecord, WebhookRequestRecord,
};

/// Per-call deadline for store requests.
const STORE_TIMEOUT_SECS: u64 = 10;

/// REST client over the persistence service.
pub struct RestStore {
    base_url: String,
    client: reqwest::Client,
}

impl RestStore {
    /// Build a store client for `base_url`, authenticating every request
    /// with `service_key`.
    pub fn new(base_url: impl Into<String>, service_key: &str) -> GatewayResult<Self> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {service_key}"))
            .map_err(|_| GatewayError::internal("store", "service key is not header-safe"))?;
        let key = HeaderValue::from_str(service_key)
            .map_err(|_| GatewayError::internal("store", "service key is not header-safe"))?;
        headers.insert("apikey", key);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(STORE_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::internal("store", format!("client build failed: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    // -------------------------------------------------------------------------
    // Request helpers
    // -------------------------------------------------------------------------

    fn err(message: impl std::fmt::Display) -> GatewayError {
        GatewayError::internal("store", message.to_string())
    }

    /// GET `table?query`, deserialising the JSON array response.
    async fn select<T: DeserializeOwned>(&self, table: &str, query: &str) -> GatewayResult<Vec<T>> {
        let url = format!("{}/{}?{}", self.base_url, table, query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::err(format!("GET {table} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Self::err(format!("GET {table} returned {status}")));
        }

        resp.json::<Vec<T>>()
            .await
            .map_err(|e| Self::err(format!("GET {table} parse failed: {e}")))
    }

    /// POST a row into `table`.
    async fn insert<T: serde::Serialize + ?Sized>(
        &self,
        table: &str,
        row: &T,
    ) -> GatewayResult<()> {
        let url = format!("{}/{}", self.base_url, table);
        let resp = self
            .client
            .post(&url)
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .map_err(|e| Self::err(format!("POST {table} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Self::err(format!("POST {table} returned {status}")));
        }
        debug!(table, "row inserted");
        Ok(())
    }

    /// PATCH rows in `table` matching `query`.
    async fn update(
        &self,
        table: &str,
        query: &str,
        patch: &serde_json::Value,
    ) -> GatewayResult<()> {
        let url = format!("{}/{}?{}", self.base_url, table, query);
        let resp = self
            .client
            .patch(&url)
            .header("Prefer", "return=minimal")
            .json(patch)
            .send()
            .await
            .map_err(|e| Self::err(format!("PATCH {table} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Self::err(format!("PATCH {table} returned {status}")));
        }
        Ok(())
    }

    /// DELETE rows in `table` matching `query`.
    async fn delete_rows(&self, table: &str, query: &str) -> GatewayResult<()> {
        let url = format!("{}/{}?{}", self.base_url, table, query);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::err(format!("DELETE {table} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Self::err(format!("DELETE {table} returned {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for RestStore {
    #[instrument(skip(self, webhook_secret), name = "store::find_user")]
    async fn find_user_by_webhook_secret(
        &self,
        webhook_secret: &str,
    ) -> GatewayResult<Option<UserRecord>> {
        let encoded: String =
            url_encode(webhook_secret);
        let rows: Vec<UserRecord> = self
            .select("users", &format!("webhook_secret=eq.{encoded}&limit=1"))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn get_credentials(
        &self,
        user_id: &str,
        venue: &str,
    ) -> GatewayResult<Option<CredentialRecord>> {
        let rows: Vec<CredentialRecord> = self
            .select(
                "exchange_credentials",
                &format!(
                    "user_id=eq.{}&venue=eq.{}&limit=1",
                    url_encode(user_id),
                    url_encode(venue)
                ),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_credentials(&self) -> GatewayResult<Vec<CredentialRecord>> {
        self.select("exchange_credentials", "select=*").await
    }

    async fn insert_position(&self, position: &PositionRecord) -> GatewayResult<()> {
        self.insert("positions", position).await
    }

    async fn update_position_qty(
        &self,
        user_id: &str,
        exchange: &str,
        symbol: &str,
        qty: Decimal,
    ) -> GatewayResult<()> {
        self.update(
            "positions",
            &position_filter(user_id, exchange, symbol),
            &serde_json::json!({ "qty": qty }),
        )
        .await
    }

    async fn delete_position(
        &self,
        user_id: &str,
        exchange: &str,
        symbol: &str,
    ) -> GatewayResult<()> {
        self.delete_rows("positions", &position_filter(user_id, exchange, symbol))
            .await
    }

    async fn list_positions(&self, user_id: &str) -> GatewayResult<Vec<PositionRecord>> {
        self.select("positions", &format!("user_id=eq.{}", url_encode(user_id)))
            .await
    }

    async fn insert_trade(&self, trade: &TradeRecord) -> GatewayResult<()> {
        self.insert("trades", trade).await
    }

    #[instrument(skip(self), name = "store::count_trades")]
    async fn count_trades_since(
        &self,
        user_id: &str,
        exchange: &str,
        since: DateTime<Utc>,
    ) -> GatewayResult<u32> {
        #[derive(serde::Deserialize)]
        struct Row {}
        let rows: Vec<Row> = self
            .select(
                "trades",
                &format!(
                    "select=id&user_id=eq.{}&exchange=eq.{}&exit_time=gte.{}",
                    url_encode(user_id),
                    url_encode(exchange),
                    since.to_rfc3339()
                ),
            )
            .await?;
        Ok(rows.len() as u32)
    }

    #[instrument(skip(self), name = "store::sum_losses")]
    async fn sum_losses_since(
        &self,
        user_id: &str,
        exchange: &str,
        since: DateTime<Utc>,
    ) -> GatewayResult<Decimal> {
        #[derive(serde::Deserialize)]
        struct Row {
            pnl_usd: Decimal,
        }
        let rows: Vec<Row> = self
            .select(
                "trades",
                &format!(
                    "select=pnl_usd&user_id=eq.{}&exchange=eq.{}&exit_time=gte.{}&pnl_usd=lt.0",
                    url_encode(user_id),
                    url_encode(exchange),
                    since.to_rfc3339()
                ),
            )
            .await?;
        Ok(rows.iter().map(|r| -r.pnl_usd).sum())
    }

    async fn get_strategy(&self, strategy_id: &str) -> GatewayResult<Option<StrategyRecord>> {
        let rows: Vec<StrategyRecord> = self
            .select(
                "strategies",
                &format!("id=eq.{}&limit=1", url_encode(strategy_id)),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn get_exchange_settings(
        &self,
        user_id: &str,
        exchange: &str,
    ) -> GatewayResult<Option<ExchangeSettingsRecord>> {
        let rows: Vec<ExchangeSettingsRecord> = self
            .select(
                "trade_settings_exchange",
                &format!(
                    "user_id=eq.{}&exchange=eq.{}&limit=1",
                    url_encode(user_id),
                    url_encode(exchange)
                ),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_webhook_request(&self, row: &WebhookRequestRecord) -> GatewayResult<()> {
        self.insert("webhook_requests", row).await
    }

    async fn finalize_webhook_request(
        &self,
        id: &str,
        status: RequestStatus,
        error_message: Option<String>,
    ) -> GatewayResult<()> {
        self.update(
            "webhook_requests",
            &format!("id=eq.{}", url_encode(id)),
            &serde_json::json!({
                "status": status,
                "error_message": error_message,
                "processed_at": Utc::now(),
            }),
        )
        .await
    }

    async fn insert_notification(&self, row: &NotificationRecord) -> GatewayResult<()> {
        self.insert("notifications", row).await
    }

    async fn list_running_ai_strategies(&self) -> GatewayResult<Vec<AiStrategyRecord>> {
        self.select("ai_strategies", "status=eq.running").await
    }

    async fn update_ai_strategy_status(
        &self,
        strategy_id: &str,
        status: AiStrategyStatus,
    ) -> GatewayResult<()> {
        self.update(
            "ai_strategies",
            &format!("id=eq.{}", url_encode(strategy_id)),
            &serde_json::json!({ "status": status }),
        )
        .await
    }

    async fn set_ai_strategy_failures(
        &self,
        strategy_id: &str,
        consecutive_failures: u32,
    ) -> GatewayResult<()> {
        self.update(
            "ai_strategies",
            &format!("id=eq.{}", url_encode(strategy_id)),
            &serde_json::json!({ "consecutive_failures": consecutive_failures }),
        )
        .await
    }

    async fn insert_ai_decision(&self, row: &AiDecisionRecord) -> GatewayResult<()> {
        self.insert("ai_trade_decisions", row).await
    }

    async fn insert_validation_log(&self, row: &ValidationLogRecord) -> GatewayResult<()> {
        self.insert("strategy_validation_log", row).await
    }
}

fn position_filter(user_id: &str, exchange: &str, symbol: &str) -> String {
    format!(
        "user_id=eq.{}&exchange=eq.{}&symbol=eq.{}",
        url_encode(user_id),
        url_encode(exchange),
        url_encode(symbol)
    )
}

/// Percent-encode a filter value for the query string. Conservative set:
/// everything except unreserved characters is escaped.
fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
