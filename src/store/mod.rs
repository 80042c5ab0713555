// =============================================================================
// Persistence contract — logical tables behind an opaque client
// =============================================================================
//
// The gateway never owns a database. It talks to a relational service through
// the `Store` trait; `RestStore` is the production implementation (PostgREST
// wire conventions), `MemoryStore` backs demo mode and the test suite.
//
// Row-level authorisation is enforced by the service itself. Every query this
// module issues is already scoped to a single user id; the gateway never
// attempts to read another user's rows.
// =============================================================================

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;
use crate::types::{Environment, ExitReason, RequestStatus, Side};

pub use memory::MemoryStore;
pub use rest::RestStore;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A gateway user, keyed by opaque id. The webhook secret is the only
/// credential this record carries.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub webhook_secret: String,
}

impl std::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRecord")
            .field("user_id", &self.user_id)
            .field("webhook_secret", &"<redacted>")
            .finish()
    }
}

/// Per `(user, venue)` credential record. Which optional fields are populated
/// depends on the venue's authentication scheme; the adapter for that venue
/// knows which ones it needs.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub user_id: String,
    pub venue: String,
    #[serde(default)]
    pub environment: Environment,

    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub passphrase: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    /// PEM- or base64-encoded Ed25519 private key for asymmetric schemes.
    pub private_key: Option<String>,

    /// Venue sub-state discovered after first use (e.g. the account id).
    pub account_id: Option<String>,

    /// Fingerprint for adapter-cache invalidation: a cached adapter built
    /// from an older `updated_at` is discarded.
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("user_id", &self.user_id)
            .field("venue", &self.venue)
            .field("environment", &self.environment)
            .field("account_id", &self.account_id)
            .field("updated_at", &self.updated_at)
            .field("fields", &"<redacted>")
            .finish()
    }
}

/// An open position as persisted (`positions` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub user_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub qty: Decimal,
    pub position_size_usd: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub entry_order_id: Option<String>,
    pub stop_loss_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    pub asset_class: String,
    pub strategy_id: Option<String>,
}

/// A closed trade as persisted (`trades` table). Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub user_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Decimal,
    pub exit_time: DateTime<Utc>,
    pub qty: Decimal,
    pub position_size_usd: Decimal,
    pub pnl_usd: Decimal,
    pub pnl_percent: Decimal,
    pub is_winner: bool,
    pub exit_reason: ExitReason,
    pub order_id: Option<String>,
    pub asset_class: String,
    pub strategy_id: Option<String>,
}

/// Lifecycle status of a webhook-driven strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    Active,
    Inactive,
    Testing,
}

/// A webhook-driven strategy definition (`strategies` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: StrategyStatus,
    pub asset_class: String,
    /// Per-strategy order-config overrides (position size, SL/TP defaults).
    #[serde(default)]
    pub order_config: serde_json::Value,
    #[serde(default)]
    pub ml_validation_enabled: bool,
    /// Confidence floor (0–100) below which the ML validator blocks a trade.
    #[serde(default = "default_confidence_threshold")]
    pub ml_confidence_threshold: u8,
}

fn default_confidence_threshold() -> u8 {
    70
}

impl StrategyRecord {
    /// Position-size override from `order_config`, if one is set.
    pub fn default_position_size_usd(&self) -> Option<Decimal> {
        self.order_config
            .get("position_size_usd")
            .and_then(|v| v.as_str().map(str::to_string).or_else(|| Some(v.to_string())))
            .and_then(|s| s.parse().ok())
    }
}

/// Per `(user, venue)` trade settings (`trade_settings_exchange` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSettingsRecord {
    pub user_id: String,
    pub exchange: String,
    /// One of `24/5`, `ny-session`, `london-session`, `weekend`, `custom`.
    pub trading_hours_preset: String,
    /// IANA timezone the window minutes are evaluated in.
    pub window_timezone: String,
    /// Window start, minutes after local midnight.
    pub window_start_minute: u16,
    /// Window end, minutes after local midnight. May be below start for
    /// windows crossing midnight.
    pub window_end_minute: u16,
    pub auto_close_outside_window: bool,
    /// 0 = unlimited.
    pub max_trades_per_week: u32,
    /// 0 = unlimited.
    pub max_loss_per_week_usd: Decimal,
    pub default_position_size_usd: Option<Decimal>,
}

/// One row in the append-only webhook audit log (`webhook_requests`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequestRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub exchange: Option<String>,
    pub action: Option<String>,
    pub symbol: Option<String>,
    /// Secret-redacted copy of the inbound payload.
    pub payload: serde_json::Value,
    pub status: RequestStatus,
    pub error_message: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// A notification row (`notifications` table). Delivery is fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of an AI strategy (`ai_strategies` table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiStrategyStatus {
    Running,
    Paused,
    Backtesting,
    Terminated,
}

/// An autonomous AI strategy evaluated by the signal worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiStrategyRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: AiStrategyStatus,
    pub exchange: String,
    pub risk_profile: String,
    pub target_assets: Vec<String>,
    #[serde(default)]
    pub symbol_blacklist: Vec<String>,
    /// Empty = no whitelist restriction.
    #[serde(default)]
    pub symbol_whitelist: Vec<String>,
    pub max_drawdown_percent: Decimal,
    pub leverage_max: Decimal,
    pub is_paper_trading: bool,
    pub position_size_usd: Decimal,
    /// Confidence floor for using the ML action directly; below it the LLM
    /// is consulted instead.
    pub confidence_threshold: u8,
    /// ML share of the hybrid routing mix, percent (e.g. 60 = 60/40 ML/LLM).
    #[serde(default = "default_ml_weight")]
    pub ml_weight: u8,
    /// Consecutive failed worker ticks; the worker pauses the strategy once
    /// this crosses the configured quarantine threshold.
    #[serde(default)]
    pub consecutive_failures: u32,
}

fn default_ml_weight() -> u8 {
    60
}

/// One evaluated decision (including HOLDs) from the AI signal worker
/// (`ai_trade_decisions` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiDecisionRecord {
    pub user_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub decided_at: DateTime<Utc>,
    pub market_snapshot: serde_json::Value,
    pub technical_indicators: serde_json::Value,
    pub parsed_decision: serde_json::Value,
    pub confidence_final: u8,
    /// Which model(s) produced the decision (`ml`, `llm`, or both ids).
    pub model_ids: Vec<String>,
    pub pnl_1h: Option<Decimal>,
    pub pnl_24h: Option<Decimal>,
}

/// One ML pre-dispatch validation outcome (`strategy_validation_log`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationLogRecord {
    pub user_id: String,
    pub strategy_id: String,
    pub signal_id: String,
    pub symbol: String,
    /// `approved` or `blocked`.
    pub validation_result: String,
    pub confidence: u8,
    pub threshold: u8,
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// The Store trait
// ---------------------------------------------------------------------------

/// Opaque client over the relational service. All calls are network I/O with
/// their own deadlines; callers decide fail-open vs fail-closed.
#[async_trait]
pub trait Store: Send + Sync {
    // -- users / credentials ------------------------------------------------

    /// Look up the user owning `webhook_secret`. The caller must still
    /// perform a constant-time comparison against the returned record.
    async fn find_user_by_webhook_secret(
        &self,
        webhook_secret: &str,
    ) -> GatewayResult<Option<UserRecord>>;

    async fn get_credentials(
        &self,
        user_id: &str,
        venue: &str,
    ) -> GatewayResult<Option<CredentialRecord>>;

    /// Every live credential record (used for startup reconciliation).
    async fn list_credentials(&self) -> GatewayResult<Vec<CredentialRecord>>;

    // -- positions ----------------------------------------------------------

    async fn insert_position(&self, position: &PositionRecord) -> GatewayResult<()>;

    async fn update_position_qty(
        &self,
        user_id: &str,
        exchange: &str,
        symbol: &str,
        qty: Decimal,
    ) -> GatewayResult<()>;

    async fn delete_position(
        &self,
        user_id: &str,
        exchange: &str,
        symbol: &str,
    ) -> GatewayResult<()>;

    async fn list_positions(&self, user_id: &str) -> GatewayResult<Vec<PositionRecord>>;

    // -- trades -------------------------------------------------------------

    async fn insert_trade(&self, trade: &TradeRecord) -> GatewayResult<()>;

    /// Count of closed trades with `exit_time >= since` for `(user, venue)`.
    async fn count_trades_since(
        &self,
        user_id: &str,
        exchange: &str,
        since: DateTime<Utc>,
    ) -> GatewayResult<u32>;

    /// Sum of losing-trade PnL (reported positive) with `exit_time >= since`.
    async fn sum_losses_since(
        &self,
        user_id: &str,
        exchange: &str,
        since: DateTime<Utc>,
    ) -> GatewayResult<Decimal>;

    // -- strategies ---------------------------------------------------------

    async fn get_strategy(&self, strategy_id: &str) -> GatewayResult<Option<StrategyRecord>>;

    // -- settings -----------------------------------------------------------

    async fn get_exchange_settings(
        &self,
        user_id: &str,
        exchange: &str,
    ) -> GatewayResult<Option<ExchangeSettingsRecord>>;

    // -- webhook audit log --------------------------------------------------

    async fn insert_webhook_request(&self, row: &WebhookRequestRecord) -> GatewayResult<()>;

    async fn finalize_webhook_request(
        &self,
        id: &str,
        status: RequestStatus,
        error_message: Option<String>,
    ) -> GatewayResult<()>;

    // -- notifications ------------------------------------------------------

    async fn insert_notification(&self, row: &NotificationRecord) -> GatewayResult<()>;

    // -- AI strategies / decisions ------------------------------------------

    async fn list_running_ai_strategies(&self) -> GatewayResult<Vec<AiStrategyRecord>>;

    async fn update_ai_strategy_status(
        &self,
        strategy_id: &str,
        status: AiStrategyStatus,
    ) -> GatewayResult<()>;

    async fn set_ai_strategy_failures(
        &self,
        strategy_id: &str,
        consecutive_failures: u32,
    ) -> GatewayResult<()>;

    async fn insert_ai_decision(&self, row: &AiDecisionRecord) -> GatewayResult<()>;

    async fn insert_validation_log(&self, row: &ValidationLogRecord) -> GatewayResult<()>;
}
