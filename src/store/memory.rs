// =============================================================================
// MemoryStore — in-process store for demo mode and the test suite
// =============================================================================
//
// Implements the full `Store` contract against plain vectors behind
// `parking_lot::Mutex`. No network, no persistence across restarts. Seeding
// helpers let tests install users, credentials, and policies directly.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::error::GatewayResult;
use crate::types::RequestStatus;

use super::{
    AiDecisionRecord, AiStrategyRecord, AiStrategyStatus, CredentialRecord,
    ExchangeSettingsRecord, NotificationRecord, PositionRecord, Store, StrategyRecord,
    TradeRecord, UserRecord, ValidationLogRecord, WebhookRequestRecord,
};

/// Vector-backed store. Cheap to construct, safe to share via `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<Vec<UserRecord>>,
    credentials: Mutex<Vec<CredentialRecord>>,
    positions: Mutex<Vec<PositionRecord>>,
    trades: Mutex<Vec<TradeRecord>>,
    strategies: Mutex<Vec<StrategyRecord>>,
    settings: Mutex<Vec<ExchangeSettingsRecord>>,
    webhook_requests: Mutex<Vec<WebhookRequestRecord>>,
    notifications: Mutex<Vec<NotificationRecord>>,
    ai_strategies: Mutex<Vec<AiStrategyRecord>>,
    ai_decisions: Mutex<Vec<AiDecisionRecord>>,
    validation_log: Mutex<Vec<ValidationLogRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- seeding ------------------------------------------------------------

    pub fn seed_user(&self, user: UserRecord) {
        self.users.lock().push(user);
    }

    pub fn seed_credentials(&self, record: CredentialRecord) {
        self.credentials.lock().push(record);
    }

    pub fn seed_settings(&self, record: ExchangeSettingsRecord) {
        self.settings.lock().push(record);
    }

    pub fn seed_strategy(&self, record: StrategyRecord) {
        self.strategies.lock().push(record);
    }

    pub fn seed_ai_strategy(&self, record: AiStrategyRecord) {
        self.ai_strategies.lock().push(record);
    }

    pub fn seed_trade(&self, record: TradeRecord) {
        self.trades.lock().push(record);
    }

    // -- inspection (tests assert through these) ----------------------------

    pub fn trades_snapshot(&self) -> Vec<TradeRecord> {
        self.trades.lock().clone()
    }

    pub fn positions_snapshot(&self) -> Vec<PositionRecord> {
        self.positions.lock().clone()
    }

    pub fn webhook_requests_snapshot(&self) -> Vec<WebhookRequestRecord> {
        self.webhook_requests.lock().clone()
    }

    pub fn notifications_snapshot(&self) -> Vec<NotificationRecord> {
        self.notifications.lock().clone()
    }

    pub fn ai_decisions_snapshot(&self) -> Vec<AiDecisionRecord> {
        self.ai_decisions.lock().clone()
    }

    pub fn validation_log_snapshot(&self) -> Vec<ValidationLogRecord> {
        self.validation_log.lock().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user_by_webhook_secret(
        &self,
        webhook_secret: &str,
    ) -> GatewayResult<Option<UserRecord>> {
        Ok(self
            .users
            .lock()
            .iter()
            .find(|u| u.webhook_secret == webhook_secret)
            .cloned())
    }

    async fn get_credentials(
        &self,
        user_id: &str,
        venue: &str,
    ) -> GatewayResult<Option<CredentialRecord>> {
        Ok(self
            .credentials
            .lock()
            .iter()
            .find(|c| c.user_id == user_id && c.venue == venue)
            .cloned())
    }

    async fn list_credentials(&self) -> GatewayResult<Vec<CredentialRecord>> {
        Ok(self.credentials.lock().clone())
    }

    async fn insert_position(&self, position: &PositionRecord) -> GatewayResult<()> {
        self.positions.lock().push(position.clone());
        Ok(())
    }

    async fn update_position_qty(
        &self,
        user_id: &str,
        exchange: &str,
        symbol: &str,
        qty: Decimal,
    ) -> GatewayResult<()> {
        let mut positions = self.positions.lock();
        if let Some(pos) = positions
            .iter_mut()
            .find(|p| p.user_id == user_id && p.exchange == exchange && p.symbol == symbol)
        {
            pos.qty = qty;
        }
        Ok(())
    }

    async fn delete_position(
        &self,
        user_id: &str,
        exchange: &str,
        symbol: &str,
    ) -> GatewayResult<()> {
        self.positions
            .lock()
            .retain(|p| !(p.user_id == user_id && p.exchange == exchange && p.symbol == symbol));
        Ok(())
    }

    async fn list_positions(&self, user_id: &str) -> GatewayResult<Vec<PositionRecord>> {
        Ok(self
            .positions
            .lock()
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_trade(&self, trade: &TradeRecord) -> GatewayResult<()> {
        self.trades.lock().push(trade.clone());
        Ok(())
    }

    async fn count_trades_since(
        &self,
        user_id: &str,
        exchange: &str,
        since: DateTime<Utc>,
    ) -> GatewayResult<u32> {
        Ok(self
            .trades
            .lock()
            .iter()
            .filter(|t| t.user_id == user_id && t.exchange == exchange && t.exit_time >= since)
            .count() as u32)
    }

    async fn sum_losses_since(
        &self,
        user_id: &str,
        exchange: &str,
        since: DateTime<Utc>,
    ) -> GatewayResult<Decimal> {
        Ok(self
            .trades
            .lock()
            .iter()
            .filter(|t| {
                t.user_id == user_id
                    && t.exchange == exchange
                    && t.exit_time >= since
                    && t.pnl_usd < Decimal::ZERO
            })
            .map(|t| -t.pnl_usd)
            .sum())
    }

    async fn get_strategy(&self, strategy_id: &str) -> GatewayResult<Option<StrategyRecord>> {
        Ok(self
            .strategies
            .lock()
            .iter()
            .find(|s| s.id == strategy_id)
            .cloned())
    }

    async fn get_exchange_settings(
        &self,
        user_id: &str,
        exchange: &str,
    ) -> GatewayResult<Option<ExchangeSettingsRecord>> {
        Ok(self
            .settings
            .lock()
            .iter()
            .find(|s| s.user_id == user_id && s.exchange == exchange)
            .cloned())
    }

    async fn insert_webhook_request(&self, row: &WebhookRequestRecord) -> GatewayResult<()> {
        self.webhook_requests.lock().push(row.clone());
        Ok(())
    }

    async fn finalize_webhook_request(
        &self,
        id: &str,
        status: RequestStatus,
        error_message: Option<String>,
    ) -> GatewayResult<()> {
        let mut rows = self.webhook_requests.lock();
        if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
            row.status = status;
            row.error_message = error_message;
            row.processed_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_notification(&self, row: &NotificationRecord) -> GatewayResult<()> {
        self.notifications.lock().push(row.clone());
        Ok(())
    }

    async fn list_running_ai_strategies(&self) -> GatewayResult<Vec<AiStrategyRecord>> {
        Ok(self
            .ai_strategies
            .lock()
            .iter()
            .filter(|s| s.status == AiStrategyStatus::Running)
            .cloned()
            .collect())
    }

    async fn update_ai_strategy_status(
        &self,
        strategy_id: &str,
        status: AiStrategyStatus,
    ) -> GatewayResult<()> {
        let mut strategies = self.ai_strategies.lock();
        if let Some(s) = strategies.iter_mut().find(|s| s.id == strategy_id) {
            s.status = status;
        }
        Ok(())
    }

    async fn set_ai_strategy_failures(
        &self,
        strategy_id: &str,
        consecutive_failures: u32,
    ) -> GatewayResult<()> {
        let mut strategies = self.ai_strategies.lock();
        if let Some(s) = strategies.iter_mut().find(|s| s.id == strategy_id) {
            s.consecutive_failures = consecutive_failures;
        }
        Ok(())
    }

    async fn insert_ai_decision(&self, row: &AiDecisionRecord) -> GatewayResult<()> {
        self.ai_decisions.lock().push(row.clone());
        Ok(())
    }

    async fn insert_validation_log(&self, row: &ValidationLogRecord) -> GatewayResult<()> {
        self.validation_log.lock().push(row.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Side};
    use rust_decimal_macros::dec;

    fn trade(pnl: Decimal, exit_time: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            user_id: "u1".to_string(),
            exchange: "aster".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_price: dec!(100),
            entry_time: exit_time,
            exit_price: dec!(101),
            exit_time,
            qty: dec!(1),
            position_size_usd: dec!(100),
            pnl_usd: pnl,
            pnl_percent: dec!(1),
            is_winner: pnl > Decimal::ZERO,
            exit_reason: ExitReason::Manual,
            order_id: None,
            asset_class: "crypto".to_string(),
            strategy_id: None,
        }
    }

    #[tokio::test]
    async fn weekly_aggregates_filter_by_time_and_sign() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);

        store.seed_trade(trade(dec!(-40), now));
        store.seed_trade(trade(dec!(25), now));
        store.seed_trade(trade(dec!(-99), old));

        let since = now - chrono::Duration::days(1);
        assert_eq!(
            store.count_trades_since("u1", "aster", since).await.unwrap(),
            2
        );
        assert_eq!(
            store.sum_losses_since("u1", "aster", since).await.unwrap(),
            dec!(40)
        );
    }

    #[tokio::test]
    async fn position_lifecycle_roundtrip() {
        let store = MemoryStore::new();
        let pos = PositionRecord {
            user_id: "u1".to_string(),
            exchange: "aster".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_price: dec!(50000),
            entry_time: Utc::now(),
            qty: dec!(0.02),
            position_size_usd: dec!(1000),
            stop_loss_price: None,
            take_profit_price: None,
            entry_order_id: Some("e1".to_string()),
            stop_loss_order_id: None,
            take_profit_order_id: None,
            asset_class: "crypto".to_string(),
            strategy_id: None,
        };
        store.insert_position(&pos).await.unwrap();
        store
            .update_position_qty("u1", "aster", "BTCUSDT", dec!(0.015))
            .await
            .unwrap();
        assert_eq!(store.list_positions("u1").await.unwrap()[0].qty, dec!(0.015));
        store.delete_position("u1", "aster", "BTCUSDT").await.unwrap();
        assert!(store.list_positions("u1").await.unwrap().is_empty());
    }
}
