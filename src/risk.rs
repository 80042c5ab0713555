// =============================================================================
// Risk-limit engine — weekly trade-count and realised-loss enforcement
// =============================================================================
//
// Counters are aggregates over the closed-trades table, scoped to the current
// week (Monday 00:00 UTC). Reads go through three tiers:
//
//   (i)   shared redis cache, key risk:{user}:{venue}:{counter}:{week_start}
//   (ii)  in-process TTL map with the same TTL
//   (iii) aggregation query against the store
//
// Tier (iii) results are written back up. When a trade closes, the engine's
// cache keys for that (user, venue) are invalidated so the next read re-reads
// ground truth.
//
// FAIL-OPEN: any internal failure (store, cache) allows the trade with a
// warning. The gateway must not deadlock trading on its own dependencies;
// risk remains bounded by per-venue settings and per-order caps.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use redis::AsyncCommands;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::settings::VenuePolicy;
use crate::store::Store;

/// TTL for both cache tiers.
const RISK_CACHE_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Week boundary
// ---------------------------------------------------------------------------

/// Start of the trading week containing `now`: Monday 00:00 UTC. Pure and
/// independent of local time.
pub fn week_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_from_monday = now.weekday().num_days_from_monday() as i64;
    let monday = now.date_naive() - ChronoDuration::days(days_from_monday);
    Utc.from_utc_datetime(&monday.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

// ---------------------------------------------------------------------------
// Decision type
// ---------------------------------------------------------------------------

/// Which weekly counter a denial refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Counter {
    Trades,
    Loss,
}

impl Counter {
    fn name(self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Loss => "loss",
        }
    }
}

/// Outcome of a risk check. A denial names the limit that fired together
/// with the observed value and the configured cap.
#[derive(Debug, Clone, Serialize)]
pub struct RiskDecision {
    pub allowed: bool,
    pub limit: Option<String>,
    pub current: Option<Decimal>,
    pub cap: Option<Decimal>,
    /// True the first time this limit is seen breached within the current
    /// week window; drives the one-shot notification.
    pub newly_breached: bool,
}

impl RiskDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            limit: None,
            current: None,
            cap: None,
            newly_breached: false,
        }
    }

    fn deny(limit: &str, current: Decimal, cap: Decimal, newly_breached: bool) -> Self {
        Self {
            allowed: false,
            limit: Some(limit.to_string()),
            current: Some(current),
            cap: Some(cap),
            newly_breached,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Weekly risk-limit enforcement with the tiered cache described above.
pub struct RiskLimitEngine {
    store: Arc<dyn Store>,
    /// Shared cache connection; `None` runs tier (ii)+(iii) only.
    redis: Option<redis::aio::ConnectionManager>,
    local: RwLock<HashMap<String, (Instant, Decimal)>>,
    ttl: Duration,
    /// Limits already notified this week, keyed
    /// `{user}:{venue}:{limit}:{week_start}`.
    notified: Mutex<HashSet<String>>,
}

impl RiskLimitEngine {
    pub fn new(store: Arc<dyn Store>, redis: Option<redis::aio::ConnectionManager>) -> Self {
        Self {
            store,
            redis,
            local: RwLock::new(HashMap::new()),
            ttl: RISK_CACHE_TTL,
            notified: Mutex::new(HashSet::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Public decision API
    // -------------------------------------------------------------------------

    /// Evaluate the weekly limits in `policy` for `(user, venue)`.
    ///
    /// Fail-open: internal errors resolve to an allow with a warning.
    pub async fn check(&self, user_id: &str, venue: &str, policy: &VenuePolicy) -> RiskDecision {
        let max_trades = Decimal::from(policy.max_trades_per_week);
        let max_loss = policy.max_loss_per_week_usd;

        if max_trades.is_zero() && max_loss.is_zero() {
            return RiskDecision::allow();
        }

        let now = Utc::now();

        if !max_trades.is_zero() {
            match self.counter(user_id, venue, Counter::Trades, now).await {
                Ok(current) if current >= max_trades => {
                    let newly = self.mark_breached(user_id, venue, "max_trades_per_week", now);
                    warn!(
                        user_id,
                        venue,
                        current = %current,
                        cap = %max_trades,
                        "weekly trade limit reached"
                    );
                    return RiskDecision::deny("max_trades_per_week", current, max_trades, newly);
                }
                Ok(current) => {
                    debug!(user_id, venue, current = %current, cap = %max_trades, "trade count under cap");
                }
                Err(e) => {
                    warn!(user_id, venue, error = %e, "trade-count check failed — failing open");
                    return RiskDecision::allow();
                }
            }
        }

        if !max_loss.is_zero() {
            match self.counter(user_id, venue, Counter::Loss, now).await {
                Ok(current) if current >= max_loss => {
                    let newly = self.mark_breached(user_id, venue, "max_loss_per_week_usd", now);
                    warn!(
                        user_id,
                        venue,
                        current = %current,
                        cap = %max_loss,
                        "weekly loss limit reached"
                    );
                    return RiskDecision::deny("max_loss_per_week_usd", current, max_loss, newly);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(user_id, venue, error = %e, "weekly-loss check failed — failing open");
                    return RiskDecision::allow();
                }
            }
        }

        RiskDecision::allow()
    }

    /// Invalidate both cache tiers for `(user, venue)` after a trade closes.
    pub async fn invalidate(&self, user_id: &str, venue: &str) {
        let ws = week_start(Utc::now());
        for counter in [Counter::Trades, Counter::Loss] {
            let key = cache_key(user_id, venue, counter, ws);
            self.local.write().remove(&key);
            if let Some(redis) = &self.redis {
                let mut conn = redis.clone();
                if let Err(e) = conn.del::<_, ()>(&key).await {
                    warn!(key, error = %e, "redis invalidation failed");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Tiered counter read
    // -------------------------------------------------------------------------

    async fn counter(
        &self,
        user_id: &str,
        venue: &str,
        counter: Counter,
        now: DateTime<Utc>,
    ) -> crate::error::GatewayResult<Decimal> {
        let ws = week_start(now);
        let key = cache_key(user_id, venue, counter, ws);

        // Tier (i): shared redis cache.
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            match conn.get::<_, Option<String>>(&key).await {
                Ok(Some(raw)) => {
                    if let Ok(value) = raw.parse::<Decimal>() {
                        debug!(key, value = %value, "risk counter served from redis");
                        return Ok(value);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "redis read failed — falling through"),
            }
        }

        // Tier (ii): in-process TTL map.
        if let Some((fetched_at, value)) = self.local.read().get(&key) {
            if fetched_at.elapsed() < self.ttl {
                debug!(key, value = %value, "risk counter served from local cache");
                return Ok(*value);
            }
        }

        // Tier (iii): fresh aggregation against the store.
        let value = match counter {
            Counter::Trades => {
                Decimal::from(self.store.count_trades_since(user_id, venue, ws).await?)
            }
            Counter::Loss => self.store.sum_losses_since(user_id, venue, ws).await?,
        };
        debug!(key, value = %value, "risk counter aggregated from store");

        // Write back up.
        self.local
            .write()
            .insert(key.clone(), (Instant::now(), value));
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            if let Err(e) = conn
                .set_ex::<_, _, ()>(&key, value.to_string(), self.ttl.as_secs())
                .await
            {
                warn!(key, error = %e, "redis write-back failed");
            }
        }

        Ok(value)
    }

    /// Record a breach; returns true only on the first sighting within the
    /// current week window.
    fn mark_breached(&self, user_id: &str, venue: &str, limit: &str, now: DateTime<Utc>) -> bool {
        let key = format!("{user_id}:{venue}:{limit}:{}", week_start(now).timestamp());
        self.notified.lock().insert(key)
    }
}

fn cache_key(user_id: &str, venue: &str, counter: Counter, ws: DateTime<Utc>) -> String {
    format!(
        "risk:{user_id}:{venue}:{}:{}",
        counter.name(),
        ws.timestamp()
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, GatewayResult};
    use crate::settings::TradingWindow;
    use crate::store::{
        AiDecisionRecord, AiStrategyRecord, AiStrategyStatus, CredentialRecord,
        ExchangeSettingsRecord, MemoryStore, NotificationRecord, PositionRecord, StrategyRecord,
        TradeRecord, UserRecord, ValidationLogRecord, WebhookRequestRecord,
    };
    use crate::types::{ExitReason, RequestStatus, Side};
    use rust_decimal_macros::dec;

    fn policy(max_trades: u32, max_loss: Decimal) -> VenuePolicy {
        VenuePolicy {
            window: TradingWindow::always_open(),
            auto_close_outside_window: false,
            max_trades_per_week: max_trades,
            max_loss_per_week_usd: max_loss,
            default_position_size_usd: None,
        }
    }

    fn closed_trade(pnl: Decimal) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            user_id: "u1".to_string(),
            exchange: "aster".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_price: dec!(100),
            entry_time: now,
            exit_price: dec!(99),
            exit_time: now,
            qty: dec!(1),
            position_size_usd: dec!(100),
            pnl_usd: pnl,
            pnl_percent: dec!(-1),
            is_winner: pnl > Decimal::ZERO,
            exit_reason: ExitReason::StopLoss,
            order_id: None,
            asset_class: "crypto".to_string(),
            strategy_id: None,
        }
    }

    // ---- week_start --------------------------------------------------------

    #[test]
    fn week_start_is_monday_midnight() {
        // 2026-08-01 is a Saturday; its week began Monday 2026-07-27.
        let saturday = Utc.with_ymd_and_hms(2026, 8, 1, 15, 30, 0).unwrap();
        let ws = week_start(saturday);
        assert_eq!(ws, Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap());
    }

    #[test]
    fn week_start_of_monday_is_itself() {
        let monday = Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap();
        assert_eq!(week_start(monday), monday);
        // Just before midnight Monday still belongs to the prior week.
        let sunday_late = Utc.with_ymd_and_hms(2026, 7, 26, 23, 59, 59).unwrap();
        assert_eq!(
            week_start(sunday_late),
            Utc.with_ymd_and_hms(2026, 7, 20, 0, 0, 0).unwrap()
        );
    }

    // ---- decisions ---------------------------------------------------------

    #[tokio::test]
    async fn unlimited_policy_always_allows() {
        let store = Arc::new(MemoryStore::new());
        let engine = RiskLimitEngine::new(store, None);
        let decision = engine.check("u1", "aster", &policy(0, dec!(0))).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn trade_limit_denies_at_cap() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..5 {
            store.seed_trade(closed_trade(dec!(1)));
        }
        let engine = RiskLimitEngine::new(store, None);

        let decision = engine.check("u1", "aster", &policy(5, dec!(0))).await;
        assert!(!decision.allowed);
        assert_eq!(decision.limit.as_deref(), Some("max_trades_per_week"));
        assert_eq!(decision.current, Some(dec!(5)));
        assert_eq!(decision.cap, Some(dec!(5)));
        assert!(decision.newly_breached);

        // Second breach in the same week is not "new".
        let again = engine.check("u1", "aster", &policy(5, dec!(0))).await;
        assert!(!again.allowed);
        assert!(!again.newly_breached);
    }

    #[tokio::test]
    async fn loss_limit_denies_when_losses_reach_cap() {
        let store = Arc::new(MemoryStore::new());
        store.seed_trade(closed_trade(dec!(-150)));
        store.seed_trade(closed_trade(dec!(-60)));
        store.seed_trade(closed_trade(dec!(40))); // winner — not counted
        let engine = RiskLimitEngine::new(store, None);

        let decision = engine.check("u1", "aster", &policy(0, dec!(200))).await;
        assert!(!decision.allowed);
        assert_eq!(decision.limit.as_deref(), Some("max_loss_per_week_usd"));
        assert_eq!(decision.current, Some(dec!(210)));
    }

    #[tokio::test]
    async fn under_cap_allows() {
        let store = Arc::new(MemoryStore::new());
        store.seed_trade(closed_trade(dec!(-10)));
        let engine = RiskLimitEngine::new(store, None);
        let decision = engine.check("u1", "aster", &policy(5, dec!(200))).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn cached_counter_survives_store_mutation_until_invalidated() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..3 {
            store.seed_trade(closed_trade(dec!(1)));
        }
        let engine = RiskLimitEngine::new(store.clone(), None);

        // Prime the cache at 3 trades.
        assert!(engine.check("u1", "aster", &policy(5, dec!(0))).await.allowed);

        // Two more closures land in the store, but the cache still says 3.
        store.seed_trade(closed_trade(dec!(1)));
        store.seed_trade(closed_trade(dec!(1)));
        assert!(engine.check("u1", "aster", &policy(5, dec!(0))).await.allowed);

        // Invalidation forces a re-read at 5 — now at the cap.
        engine.invalidate("u1", "aster").await;
        let decision = engine.check("u1", "aster", &policy(5, dec!(0))).await;
        assert!(!decision.allowed);
    }

    // ---- fail-open ---------------------------------------------------------

    struct FailingStore;

    fn down<T>() -> GatewayResult<T> {
        Err(GatewayError::internal("store", "down"))
    }

    #[async_trait::async_trait]
    impl Store for FailingStore {
        async fn find_user_by_webhook_secret(
            &self,
            _: &str,
        ) -> GatewayResult<Option<UserRecord>> {
            down()
        }
        async fn get_credentials(
            &self,
            _: &str,
            _: &str,
        ) -> GatewayResult<Option<CredentialRecord>> {
            down()
        }
        async fn list_credentials(&self) -> GatewayResult<Vec<CredentialRecord>> {
            down()
        }
        async fn insert_position(&self, _: &PositionRecord) -> GatewayResult<()> {
            down()
        }
        async fn update_position_qty(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Decimal,
        ) -> GatewayResult<()> {
            down()
        }
        async fn delete_position(&self, _: &str, _: &str, _: &str) -> GatewayResult<()> {
            down()
        }
        async fn list_positions(&self, _: &str) -> GatewayResult<Vec<PositionRecord>> {
            down()
        }
        async fn insert_trade(&self, _: &TradeRecord) -> GatewayResult<()> {
            down()
        }
        async fn count_trades_since(
            &self,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
        ) -> GatewayResult<u32> {
            down()
        }
        async fn sum_losses_since(
            &self,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
        ) -> GatewayResult<Decimal> {
            down()
        }
        async fn get_strategy(&self, _: &str) -> GatewayResult<Option<StrategyRecord>> {
            down()
        }
        async fn get_exchange_settings(
            &self,
            _: &str,
            _: &str,
        ) -> GatewayResult<Option<ExchangeSettingsRecord>> {
            down()
        }
        async fn insert_webhook_request(&self, _: &WebhookRequestRecord) -> GatewayResult<()> {
            down()
        }
        async fn finalize_webhook_request(
            &self,
            _: &str,
            _: RequestStatus,
            _: Option<String>,
        ) -> GatewayResult<()> {
            down()
        }
        async fn insert_notification(&self, _: &NotificationRecord) -> GatewayResult<()> {
            down()
        }
        async fn list_running_ai_strategies(&self) -> GatewayResult<Vec<AiStrategyRecord>> {
            down()
        }
        async fn update_ai_strategy_status(
            &self,
            _: &str,
            _: AiStrategyStatus,
        ) -> GatewayResult<()> {
            down()
        }
        async fn set_ai_strategy_failures(&self, _: &str, _: u32) -> GatewayResult<()> {
            down()
        }
        async fn insert_ai_decision(&self, _: &AiDecisionRecord) -> GatewayResult<()> {
            down()
        }
        async fn insert_validation_log(&self, _: &ValidationLogRecord) -> GatewayResult<()> {
            down()
        }
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let engine = RiskLimitEngine::new(Arc::new(FailingStore), None);
        let decision = engine.check("u1", "aster", &policy(1, dec!(1))).await;
        assert!(decision.allowed, "internal failure must not block trading");
    }
}
