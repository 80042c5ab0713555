// =============================================================================
// Notifier — write-only, fire-and-forget event notifications
// =============================================================================
//
// Notifications are rows in the store's notifications table; an external
// transport picks them up for delivery. Emission never fails the calling
// operation: a store error is logged and swallowed.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::warn;

use crate::store::{NotificationRecord, Store};

/// Fire-and-forget notification sink.
pub struct Notifier {
    store: Arc<dyn Store>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Write one notification row. Errors are logged, never propagated.
    pub async fn emit(
        &self,
        user_id: &str,
        kind: &str,
        title: &str,
        message: String,
        metadata: serde_json::Value,
    ) {
        let row = NotificationRecord {
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            message,
            metadata,
            read: false,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_notification(&row).await {
            warn!(user_id, kind, error = %e, "notification write failed — dropping");
        }
    }

    // -------------------------------------------------------------------------
    // Event helpers
    // -------------------------------------------------------------------------

    pub async fn trade_success(
        &self,
        user_id: &str,
        venue: &str,
        symbol: &str,
        side: &str,
        qty: Decimal,
        entry_price: Decimal,
    ) {
        self.emit(
            user_id,
            "trade_success",
            "Trade Executed",
            format!("{side} {qty} {symbol} @ {entry_price} on {venue}"),
            serde_json::json!({
                "venue": venue,
                "symbol": symbol,
                "side": side,
                "qty": qty,
                "entry_price": entry_price,
            }),
        )
        .await;
    }

    pub async fn position_closed(
        &self,
        user_id: &str,
        venue: &str,
        symbol: &str,
        pnl_usd: Decimal,
        exit_reason: &str,
    ) {
        let (kind, title) = if pnl_usd >= Decimal::ZERO {
            ("position_closed_profit", "Position Closed in Profit")
        } else {
            ("position_closed_loss", "Position Closed at a Loss")
        };
        self.emit(
            user_id,
            kind,
            title,
            format!("{symbol} on {venue} closed ({exit_reason}): {pnl_usd} USD"),
            serde_json::json!({
                "venue": venue,
                "symbol": symbol,
                "pnl_usd": pnl_usd,
                "exit_reason": exit_reason,
            }),
        )
        .await;
    }

    /// One-shot weekly-limit notification; callers gate on the risk engine's
    /// `newly_breached` flag.
    pub async fn limit_reached(
        &self,
        user_id: &str,
        venue: &str,
        limit: &str,
        current: Decimal,
        cap: Decimal,
    ) {
        let title = match limit {
            "max_trades_per_week" => "Weekly Trade Limit Reached",
            "max_loss_per_week_usd" => "Weekly Loss Limit Reached",
            _ => "Risk Limit Reached",
        };
        self.emit(
            user_id,
            "risk_limit",
            title,
            format!("{limit} reached on {venue}: {current} of {cap}"),
            serde_json::json!({
                "venue": venue,
                "limit": limit,
                "current": current,
                "cap": cap,
            }),
        )
        .await;
    }

    pub async fn ml_blocked(
        &self,
        user_id: &str,
        symbol: &str,
        strategy_id: &str,
        confidence: u8,
        threshold: u8,
    ) {
        self.emit(
            user_id,
            "ai_trade_blocked",
            "Trade Blocked by ML Validation",
            format!(
                "{symbol} signal blocked: confidence {confidence} below threshold {threshold}"
            ),
            serde_json::json!({
                "symbol": symbol,
                "strategy_id": strategy_id,
                "confidence": confidence,
                "threshold": threshold,
            }),
        )
        .await;
    }

    pub async fn trade_failed(&self, user_id: &str, venue: &str, symbol: &str, error: &str) {
        self.emit(
            user_id,
            "trade_error",
            "Trade Execution Failed",
            format!("{symbol} on {venue}: {error}"),
            serde_json::json!({ "venue": venue, "symbol": symbol }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn position_closed_picks_kind_by_sign() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(store.clone());

        notifier
            .position_closed("u1", "aster", "BTCUSDT", dec!(12.5), "take_profit")
            .await;
        notifier
            .position_closed("u1", "aster", "BTCUSDT", dec!(-3), "stop_loss")
            .await;

        let rows = store.notifications_snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "position_closed_profit");
        assert_eq!(rows[1].kind, "position_closed_loss");
    }

    #[tokio::test]
    async fn limit_notification_names_the_limit() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(store.clone());
        notifier
            .limit_reached("u1", "aster", "max_trades_per_week", dec!(5), dec!(5))
            .await;

        let rows = store.notifications_snapshot();
        assert_eq!(rows[0].title, "Weekly Trade Limit Reached");
        assert!(rows[0].message.contains("max_trades_per_week"));
        assert_eq!(rows[0].metadata["current"], serde_json::json!("5"));
    }

    #[tokio::test]
    async fn ml_block_notification_carries_scores() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(store.clone());
        notifier.ml_blocked("u1", "BTCUSDT", "s1", 55, 70).await;

        let rows = store.notifications_snapshot();
        assert_eq!(rows[0].kind, "ai_trade_blocked");
        assert_eq!(rows[0].metadata["confidence"], 55);
        assert_eq!(rows[0].metadata["threshold"], 70);
    }
}
