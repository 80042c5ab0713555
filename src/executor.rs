// =============================================================================
// Trade executor — the open/close state machine over adapters and policy
// =============================================================================
//
// Every intent, webhook-borne or AI-synthesised, passes through here:
//
//   guard:  ML validation gate (blocked ≠ denied, fail-open on transport)
//           → weekly risk limits → trading window (entries only)
//   open:   tracker check → venue confirmation (auto-heal divergence)
//           → same-side idempotent skip → opposite-side reversal
//           → sizing chain → protective-order planning by capability
//   close:  reconcile → partial/full quantity → reduce-only close
//           → protective-order cleanup → PnL → persistence → notification
//
// Concurrency: one in-flight open or close per (user, venue, symbol); later
// intents on the same key serialise behind a per-key async mutex.
//
// A failed protective leg after a successful entry is deliberately NOT
// rolled back: the position is tracked with a null protective-order id and
// the failure is logged at error level so an operator can repair it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::intent::TradingIntent;
use crate::ml::{MlClient, MlValidation};
use crate::notify::Notifier;
use crate::risk::RiskLimitEngine;
use crate::settings::{SettingsService, VenuePolicy};
use crate::store::{PositionRecord, Store, StrategyRecord, TradeRecord, ValidationLogRecord};
use crate::tracker::{PositionKey, PositionTracker, TrackedPosition};
use crate::types::{Action, ExitReason, OrderKind, Side, StopKind};
use crate::venues::registry::AdapterSource;
use crate::venues::{
    occ_symbol, BracketSpec, Capability, OrderAck, OrderSide, SymbolRules, TrailSpec, VenueAdapter,
};

// ---------------------------------------------------------------------------
// Report type
// ---------------------------------------------------------------------------

/// What an execution attempt produced, serialised into the webhook response.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub action: String,
    pub venue: String,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_usd: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by_ml: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u8>,
}

impl ExecutionReport {
    fn bare(intent: &TradingIntent, success: bool, action: &str) -> Self {
        Self {
            success,
            action: action.to_string(),
            venue: intent.venue.clone(),
            symbol: intent.symbol.clone(),
            order_id: None,
            qty: None,
            price: None,
            pnl_usd: None,
            note: None,
            blocked_by_ml: None,
            confidence: None,
            threshold: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ML gate seam
// ---------------------------------------------------------------------------

/// The slice of the ML service the pre-dispatch gate needs.
#[async_trait]
pub trait SignalValidator: Send + Sync {
    async fn validate(&self, payload: &serde_json::Value) -> GatewayResult<MlValidation>;
}

#[async_trait]
impl SignalValidator for MlClient {
    async fn validate(&self, payload: &serde_json::Value) -> GatewayResult<MlValidation> {
        self.validate_signal(payload).await
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Static executor tunables from the gateway config.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Last resort of the position-sizing chain.
    pub default_position_size_usd: Option<Decimal>,
    /// Below this notional, fractional-capable venues take the
    /// notional-denominated order path.
    pub fractional_threshold_usd: Decimal,
    /// Pause between closing the old side and opening the new one on a
    /// reversal, giving the venue time to settle the reduce-only fill.
    pub reversal_pause_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_position_size_usd: None,
            fractional_threshold_usd: Decimal::new(200, 0),
            reversal_pause_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct TradeExecutor {
    store: Arc<dyn Store>,
    adapters: Arc<dyn AdapterSource>,
    tracker: Arc<PositionTracker>,
    settings: Arc<SettingsService>,
    risk: Arc<RiskLimitEngine>,
    notifier: Arc<Notifier>,
    validator: Option<Arc<dyn SignalValidator>>,
    config: ExecutorConfig,
    locks: Mutex<HashMap<PositionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl TradeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        adapters: Arc<dyn AdapterSource>,
        tracker: Arc<PositionTracker>,
        settings: Arc<SettingsService>,
        risk: Arc<RiskLimitEngine>,
        notifier: Arc<Notifier>,
        validator: Option<Arc<dyn SignalValidator>>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            tracker,
            settings,
            risk,
            notifier,
            validator,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The per-key serialisation mutex for `(user, venue, symbol)`.
    fn lock_for(&self, key: &PositionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(key.clone()).or_default().clone()
    }

    // =========================================================================
    // Public entry points
    // =========================================================================

    /// Execute one normalised intent end to end.
    pub async fn execute(&self, intent: &TradingIntent) -> GatewayResult<ExecutionReport> {
        let _guard = self.lock_for(&intent.position_key()).lock_owned().await;

        // ── 1. ML validation gate ────────────────────────────────────────
        let strategy = self.load_strategy(intent).await;
        if let Some(report) = self.ml_gate(intent, strategy.as_ref()).await {
            return Ok(report);
        }

        let policy = self.settings.policy(&intent.user_id, &intent.venue).await;

        match intent.action {
            Action::Buy | Action::Sell => {
                // ── 2. Weekly risk limits ────────────────────────────────
                let decision = self
                    .risk
                    .check(&intent.user_id, &intent.venue, &policy)
                    .await;
                if !decision.allowed {
                    if decision.newly_breached {
                        self.notifier
                            .limit_reached(
                                &intent.user_id,
                                &intent.venue,
                                decision.limit.as_deref().unwrap_or("risk limit"),
                                decision.current.unwrap_or_default(),
                                decision.cap.unwrap_or_default(),
                            )
                            .await;
                    }
                    return Err(GatewayError::OverLimit {
                        limit: decision.limit.unwrap_or_else(|| "risk limit".to_string()),
                        current: decision.current.unwrap_or_default(),
                        cap: decision.cap.unwrap_or_default(),
                    });
                }

                // ── 3. Trading window (entries only) ─────────────────────
                if !policy.window.is_open_at(Utc::now()) {
                    return Err(GatewayError::OutsideWindow(policy.window.describe()));
                }

                let side = match intent.action {
                    Action::Buy => Side::Long,
                    _ => Side::Short,
                };
                self.open_flow(intent, side, strategy.as_ref(), &policy)
                    .await
            }
            Action::Close => {
                self.close_flow(intent, intent.sell_percentage, ExitReason::Manual)
                    .await
            }
        }
    }

    /// Close a tracked position outside the webhook path (auto-close
    /// sweeper, AI worker CLOSE decisions). Serialises on the same per-key
    /// lock as `execute`.
    pub async fn close_tracked(
        &self,
        user_id: &str,
        venue: &str,
        symbol: &str,
        reason: ExitReason,
    ) -> GatewayResult<ExecutionReport> {
        let intent = synthetic_close(user_id, venue, symbol);
        let _guard = self.lock_for(&intent.position_key()).lock_owned().await;
        self.close_flow(&intent, Decimal::ONE_HUNDRED, reason).await
    }

    // =========================================================================
    // Pre-dispatch guard pieces
    // =========================================================================

    /// Strategy lookup is fail-open: a store fault must not block trading.
    async fn load_strategy(&self, intent: &TradingIntent) -> Option<StrategyRecord> {
        let strategy_id = intent.strategy_id.as_deref()?;
        match self.store.get_strategy(strategy_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(strategy_id, error = %e, "strategy lookup failed — continuing without it");
                None
            }
        }
    }

    /// Returns a blocked report when the ML validator rejects the signal;
    /// `None` lets the intent continue. Transport failures fail open.
    async fn ml_gate(
        &self,
        intent: &TradingIntent,
        strategy: Option<&StrategyRecord>,
    ) -> Option<ExecutionReport> {
        let strategy = strategy?;
        if !strategy.ml_validation_enabled {
            return None;
        }
        let validator = self.validator.as_ref()?;

        let payload = crate::ml::validation_payload(
            &intent.user_id,
            &strategy.id,
            &intent.symbol,
            &intent.action.to_string(),
            intent.position_size_usd,
        );
        let validation = match validator.validate(&payload).await {
            Ok(validation) => validation,
            Err(e) => {
                warn!(
                    strategy_id = %strategy.id,
                    symbol = %intent.symbol,
                    error = %e,
                    "ML validation unavailable — failing open"
                );
                return None;
            }
        };

        let threshold = strategy.ml_confidence_threshold;
        let blocked = validation.confidence < threshold;
        let log = ValidationLogRecord {
            user_id: intent.user_id.clone(),
            strategy_id: strategy.id.clone(),
            signal_id: intent.signal_id.clone(),
            symbol: intent.symbol.clone(),
            validation_result: if blocked { "blocked" } else { "approved" }.to_string(),
            confidence: validation.confidence,
            threshold,
            reasons: validation.reasons.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_validation_log(&log).await {
            warn!(error = %e, "validation log write failed");
        }

        if !blocked {
            debug!(
                confidence = validation.confidence,
                threshold, "ML validation approved signal"
            );
            return None;
        }

        info!(
            strategy_id = %strategy.id,
            symbol = %intent.symbol,
            confidence = validation.confidence,
            threshold,
            "trade blocked by ML validation"
        );
        self.notifier
            .ml_blocked(
                &intent.user_id,
                &intent.symbol,
                &strategy.id,
                validation.confidence,
                threshold,
            )
            .await;

        let mut report = ExecutionReport::bare(intent, false, "blocked");
        report.blocked_by_ml = Some(true);
        report.confidence = Some(validation.confidence);
        report.threshold = Some(threshold);
        Some(report)
    }

    // =========================================================================
    // Open flow
    // =========================================================================

    async fn open_flow(
        &self,
        intent: &TradingIntent,
        side: Side,
        strategy: Option<&StrategyRecord>,
        policy: &VenuePolicy,
    ) -> GatewayResult<ExecutionReport> {
        let adapter = self
            .adapters
            .adapter_for(&intent.user_id, &intent.venue)
            .await?;
        let symbol = order_symbol(intent);

        if self
            .tracker
            .has(&intent.user_id, &intent.venue, &symbol)
        {
            // The tracker claims a position; the venue decides what is true.
            match adapter.get_position(&symbol).await? {
                None => {
                    warn!(
                        user_id = %intent.user_id,
                        venue = %intent.venue,
                        symbol = %symbol,
                        "tracker claimed a position the venue cannot confirm — healing"
                    );
                    self.tracker.remove(&intent.user_id, &intent.venue, &symbol);
                }
                Some(existing) if existing.side == side => {
                    debug!(
                        symbol = %symbol,
                        side = %side,
                        "same-side signal into open position — idempotent skip"
                    );
                    let mut report = ExecutionReport::bare(intent, false, "skipped");
                    report.note = Some("position already open on the same side".to_string());
                    return Ok(report);
                }
                Some(existing) => {
                    info!(
                        symbol = %symbol,
                        held = %existing.side,
                        wanted = %side,
                        "opposite-side signal — reversing position"
                    );
                    self.close_flow(intent, Decimal::ONE_HUNDRED, ExitReason::Reversal)
                        .await?;
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.reversal_pause_ms,
                    ))
                    .await;
                }
            }
        }

        self.open_new(intent, side, strategy, policy, adapter.as_ref(), &symbol)
            .await
    }

    /// The OPEN NEW procedure: sizing, reference price, protective planning,
    /// placement, persistence.
    async fn open_new(
        &self,
        intent: &TradingIntent,
        side: Side,
        strategy: Option<&StrategyRecord>,
        policy: &VenuePolicy,
        adapter: &dyn VenueAdapter,
        symbol: &str,
    ) -> GatewayResult<ExecutionReport> {
        // ── 1. Position size resolution chain ────────────────────────────
        let size_usd = intent
            .position_size_usd
            .or_else(|| strategy.and_then(StrategyRecord::default_position_size_usd))
            .or(policy.default_position_size_usd)
            .or(self.config.default_position_size_usd)
            .ok_or_else(|| {
                GatewayError::input(
                    "position_size_usd",
                    "no size on the intent, strategy, venue settings, or static config",
                )
            })?;
        if size_usd <= Decimal::ZERO {
            return Err(GatewayError::input(
                "position_size_usd",
                "must be positive",
            ));
        }

        // ── 2. Reference price (fail-closed) ─────────────────────────────
        let ticker = adapter.get_ticker(symbol).await?;
        let reference = match intent.order_kind {
            OrderKind::Limit => intent.limit_price.unwrap_or(ticker.last),
            OrderKind::Market => ticker.last,
        };
        if reference <= Decimal::ZERO {
            return Err(GatewayError::internal(
                "executor",
                format!("venue returned a non-positive reference price for {symbol}"),
            ));
        }

        // ── 3. Quantity and protective prices ────────────────────────────
        let rules = adapter.symbol_rules(symbol).await?;
        let qty = rules.round_qty(size_usd / reference);
        if qty.is_zero() || qty < rules.min_qty {
            return Err(GatewayError::input(
                "position_size_usd",
                format!("{size_usd} USD rounds below one lot at {reference}"),
            ));
        }
        let (stop_price, take_profit_price) = protective_prices(
            side,
            reference,
            intent.stop_loss_percent,
            intent.take_profit_percent,
            &rules,
        );
        let trailing = trailing_spec(intent);

        // ── 4. Plan: refuse impossible combinations up front ─────────────
        let plan = plan_protection(
            adapter,
            intent,
            stop_price.is_some(),
            take_profit_price.is_some(),
            trailing.is_some(),
        )?;

        let entry_side = OrderSide::from(side);
        let exit_side = entry_side.opposite();
        let spec = BracketSpec {
            symbol: symbol.to_string(),
            side: entry_side,
            qty,
            entry_limit_price: match intent.order_kind {
                OrderKind::Limit => intent.limit_price,
                OrderKind::Market => None,
            },
            take_profit_price,
            stop_loss_price: stop_price,
            stop_limit_price: stop_limit_price(side, stop_price, intent.stop_limit_offset, &rules),
            trailing,
            extended_hours: intent.extended_hours,
        };

        // ── 5. Placement ─────────────────────────────────────────────────
        let stop_kind = stop_kind_of(intent, trailing.is_some());
        let (entry_ack, sl_order_id, tp_order_id) = match plan {
            ProtectionPlan::Bracket => {
                let ack = adapter.place_bracket_order(&spec).await?;
                (
                    OrderAck {
                        order_id: ack.entry_order_id,
                        status: "accepted".to_string(),
                        fill_price: None,
                    },
                    ack.stop_loss_order_id,
                    ack.take_profit_order_id,
                )
            }
            ProtectionPlan::AtomicBatch => {
                let ack = adapter.place_entry_with_protection(&spec).await?;
                (
                    OrderAck {
                        order_id: ack.entry_order_id,
                        status: "accepted".to_string(),
                        fill_price: None,
                    },
                    ack.stop_loss_order_id,
                    ack.take_profit_order_id,
                )
            }
            ProtectionPlan::Oto => {
                let ack = adapter.place_oto_order(&spec).await?;
                (
                    OrderAck {
                        order_id: ack.entry_order_id,
                        status: "accepted".to_string(),
                        fill_price: None,
                    },
                    ack.stop_loss_order_id,
                    ack.take_profit_order_id,
                )
            }
            ProtectionPlan::SeparateLegs => {
                let entry = self
                    .place_entry(adapter, intent, symbol, entry_side, qty, size_usd)
                    .await?;
                let (sl, tp) = self
                    .place_protective_legs(
                        adapter,
                        symbol,
                        exit_side,
                        qty,
                        stop_price,
                        spec.stop_limit_price,
                        take_profit_price,
                        trailing,
                    )
                    .await;
                (entry, sl, tp)
            }
        };

        let entry_price = entry_ack.fill_price.unwrap_or(reference);

        // ── 6. Persist, track, notify ────────────────────────────────────
        let position = TrackedPosition {
            user_id: intent.user_id.clone(),
            venue: intent.venue.clone(),
            symbol: symbol.to_string(),
            side,
            qty,
            entry_price,
            entry_time: Utc::now(),
            position_size_usd: size_usd,
            entry_order_id: Some(entry_ack.order_id.clone()),
            stop_loss_order_id: sl_order_id,
            take_profit_order_id: tp_order_id,
            stop_loss_price: stop_price,
            take_profit_price,
            stop_kind,
            trailing,
            asset_class: adapter.asset_class().to_string(),
            strategy_id: intent.strategy_id.clone(),
        };

        if let Err(e) = self.store.insert_position(&to_record(&position)).await {
            warn!(
                symbol = %symbol,
                error = %e,
                "position persisted on venue but store write failed"
            );
        }
        self.tracker.add(position);

        self.notifier
            .trade_success(
                &intent.user_id,
                &intent.venue,
                symbol,
                &side.to_string(),
                qty,
                entry_price,
            )
            .await;

        info!(
            user_id = %intent.user_id,
            venue = %intent.venue,
            symbol = %symbol,
            side = %side,
            qty = %qty,
            entry_price = %entry_price,
            order_id = %entry_ack.order_id,
            "position opened"
        );

        let mut report = ExecutionReport::bare(intent, true, "opened");
        report.order_id = Some(entry_ack.order_id);
        report.qty = Some(qty);
        report.price = Some(entry_price);
        Ok(report)
    }

    /// Entry leg for the separate-legs plan, routing small notionals through
    /// the fractional path where the venue offers one.
    async fn place_entry(
        &self,
        adapter: &dyn VenueAdapter,
        intent: &TradingIntent,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        size_usd: Decimal,
    ) -> GatewayResult<OrderAck> {
        let fractional_fit = adapter.capabilities().supports(Capability::Fractional)
            && intent.order_kind == OrderKind::Market
            && size_usd < self.config.fractional_threshold_usd;
        if fractional_fit {
            debug!(symbol, notional = %size_usd, "using fractional notional entry");
            return adapter.place_fractional_order(symbol, side, size_usd).await;
        }
        match intent.order_kind {
            OrderKind::Market => adapter.place_market_order(symbol, side, qty).await,
            OrderKind::Limit => {
                let price = intent
                    .limit_price
                    .ok_or_else(|| GatewayError::input("limit_price", "required for limit"))?;
                adapter.place_limit_order(symbol, side, qty, price).await
            }
        }
    }

    /// Protective legs after a successful entry. Failures are logged at
    /// error level and produce null ids; the entry is never rolled back.
    #[allow(clippy::too_many_arguments)]
    async fn place_protective_legs(
        &self,
        adapter: &dyn VenueAdapter,
        symbol: &str,
        exit_side: OrderSide,
        qty: Decimal,
        stop_price: Option<Decimal>,
        stop_limit: Option<Decimal>,
        take_profit_price: Option<Decimal>,
        trailing: Option<TrailSpec>,
    ) -> (Option<String>, Option<String>) {
        let mut tp_id = None;
        if let Some(tp) = take_profit_price {
            match adapter.place_take_profit(symbol, exit_side, qty, tp).await {
                Ok(ack) => tp_id = Some(ack.order_id),
                Err(e) => error!(
                    symbol,
                    price = %tp,
                    error = %e,
                    "take-profit leg failed after entry — position is unprotected on the upside"
                ),
            }
        }

        let mut sl_id = None;
        if let Some(trail) = trailing {
            match adapter
                .place_trailing_stop(symbol, exit_side, qty, trail)
                .await
            {
                Ok(ack) => sl_id = Some(ack.order_id),
                Err(e) => error!(
                    symbol,
                    error = %e,
                    "trailing-stop leg failed after entry — position has no stop"
                ),
            }
        } else if let Some(stop) = stop_price {
            match adapter
                .place_stop_loss(symbol, exit_side, qty, stop, stop_limit)
                .await
            {
                Ok(ack) => sl_id = Some(ack.order_id),
                Err(e) => error!(
                    symbol,
                    stop = %stop,
                    error = %e,
                    "stop-loss leg failed after entry — position has no stop"
                ),
            }
        }

        (sl_id, tp_id)
    }

    // =========================================================================
    // Close flow
    // =========================================================================

    async fn close_flow(
        &self,
        intent: &TradingIntent,
        sell_percentage: Decimal,
        exit_reason: ExitReason,
    ) -> GatewayResult<ExecutionReport> {
        let adapter = self
            .adapters
            .adapter_for(&intent.user_id, &intent.venue)
            .await?;
        let symbol = order_symbol(intent);

        // ── 1. Reconcile tracker and venue views ─────────────────────────
        let venue_position = adapter.get_position(&symbol).await?;
        if self.tracker.has(&intent.user_id, &intent.venue, &symbol) && venue_position.is_none() {
            warn!(
                user_id = %intent.user_id,
                venue = %intent.venue,
                symbol = %symbol,
                "tracker claimed a position the venue cannot confirm — healing"
            );
            self.tracker.remove(&intent.user_id, &intent.venue, &symbol);
            if let Err(e) = self
                .store
                .delete_position(&intent.user_id, &intent.venue, &symbol)
                .await
            {
                warn!(symbol = %symbol, error = %e, "stale position delete failed");
            }
            let mut report = ExecutionReport::bare(intent, true, "nothing_to_close");
            report.note = Some("tracked position no longer on venue".to_string());
            return Ok(report);
        }
        if !self.tracker.has(&intent.user_id, &intent.venue, &symbol) {
            match &venue_position {
                Some(_) => {
                    info!(
                        user_id = %intent.user_id,
                        venue = %intent.venue,
                        symbol = %symbol,
                        "venue holds an untracked position — reconciling before close"
                    );
                    self.tracker
                        .reconcile(&intent.user_id, &intent.venue, adapter.as_ref())
                        .await?;
                }
                None => {
                    // ── 2. Nothing anywhere: benign no-op ────────────────
                    let mut report = ExecutionReport::bare(intent, true, "nothing_to_close");
                    report.note = Some("no open position".to_string());
                    return Ok(report);
                }
            }
        }
        let tracked = self
            .tracker
            .get(&intent.user_id, &intent.venue, &symbol)
            .ok_or_else(|| GatewayError::NothingToClose {
                symbol: symbol.clone(),
            })?;

        // ── 3. Close quantity from sell_percentage ───────────────────────
        let venue_qty = venue_position
            .as_ref()
            .map(|p| p.qty)
            .unwrap_or(tracked.qty);
        let rules = adapter.symbol_rules(&symbol).await?;
        let close_qty = close_quantity(venue_qty, sell_percentage, &rules);
        let full_close = sell_percentage >= Decimal::ONE_HUNDRED || close_qty >= venue_qty;

        // ── 4. Reduce-only close order ───────────────────────────────────
        let exit_side = OrderSide::from(tracked.side.opposite());
        let ack = adapter.close_position(&symbol, exit_side, close_qty).await?;

        // ── 5. Cancel outstanding protective orders ──────────────────────
        if tracked.stop_loss_order_id.is_some() || tracked.take_profit_order_id.is_some() {
            if adapter.capabilities().supports(Capability::CancelAll) {
                if let Err(e) = adapter.cancel_all_orders(&symbol).await {
                    warn!(symbol = %symbol, error = %e, "cancel-all after close failed");
                }
            } else {
                for order_id in [&tracked.take_profit_order_id, &tracked.stop_loss_order_id]
                    .into_iter()
                    .flatten()
                {
                    if let Err(e) = adapter.cancel_order(&symbol, order_id).await {
                        // An already-filled leg cancels as "not found"; benign.
                        debug!(symbol = %symbol, order_id, error = %e, "protective cancel tolerated");
                    }
                }
            }
        }

        // ── 6. Realised PnL ──────────────────────────────────────────────
        let exit_price = match ack.fill_price {
            Some(price) => price,
            None => match venue_position.as_ref().and_then(|p| p.mark_price) {
                Some(mark) => mark,
                None => adapter.get_ticker(&symbol).await.map(|t| t.last).unwrap_or(tracked.entry_price),
            },
        };
        let pnl = pnl_usd(tracked.side, tracked.entry_price, exit_price, close_qty);
        let pnl_percent = if tracked.entry_price.is_zero() {
            Decimal::ZERO
        } else {
            let denominator = tracked.entry_price * close_qty;
            if denominator.is_zero() {
                Decimal::ZERO
            } else {
                (pnl / denominator) * Decimal::ONE_HUNDRED
            }
        };

        // ── 7. Persistence ───────────────────────────────────────────────
        let trade = TradeRecord {
            user_id: tracked.user_id.clone(),
            exchange: tracked.venue.clone(),
            symbol: symbol.clone(),
            side: tracked.side,
            entry_price: tracked.entry_price,
            entry_time: tracked.entry_time,
            exit_price,
            exit_time: Utc::now(),
            qty: close_qty,
            position_size_usd: tracked.position_size_usd,
            pnl_usd: pnl,
            pnl_percent,
            is_winner: pnl >= Decimal::ZERO,
            exit_reason,
            order_id: Some(ack.order_id.clone()),
            asset_class: tracked.asset_class.clone(),
            strategy_id: tracked.strategy_id.clone(),
        };
        if let Err(e) = self.store.insert_trade(&trade).await {
            warn!(symbol = %symbol, error = %e, "closed-trade write failed");
        }

        if full_close {
            self.tracker.remove(&intent.user_id, &intent.venue, &symbol);
            if let Err(e) = self
                .store
                .delete_position(&intent.user_id, &intent.venue, &symbol)
                .await
            {
                warn!(symbol = %symbol, error = %e, "position delete failed");
            }
        } else {
            let remaining = venue_qty - close_qty;
            self.tracker
                .update(&intent.user_id, &intent.venue, &symbol, |p| {
                    p.qty = remaining;
                });
            if let Err(e) = self
                .store
                .update_position_qty(&intent.user_id, &intent.venue, &symbol, remaining)
                .await
            {
                warn!(symbol = %symbol, error = %e, "position qty update failed");
            }
        }

        // Weekly counters changed; force a fresh read next check.
        self.risk.invalidate(&intent.user_id, &intent.venue).await;

        self.notifier
            .position_closed(
                &intent.user_id,
                &intent.venue,
                &symbol,
                pnl,
                &exit_reason.to_string(),
            )
            .await;

        info!(
            user_id = %intent.user_id,
            venue = %intent.venue,
            symbol = %symbol,
            qty = %close_qty,
            exit_price = %exit_price,
            pnl_usd = %pnl,
            exit_reason = %exit_reason,
            full_close,
            "position closed"
        );

        let mut report = ExecutionReport::bare(
            intent,
            true,
            if full_close { "closed" } else { "partially_closed" },
        );
        report.order_id = Some(ack.order_id);
        report.qty = Some(close_qty);
        report.price = Some(exit_price);
        report.pnl_usd = Some(pnl);
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtectionPlan {
    Bracket,
    AtomicBatch,
    Oto,
    SeparateLegs,
}

/// Pick the strongest compound primitive the adapter supports, refusing
/// combinations no capability can express.
fn plan_protection(
    adapter: &dyn VenueAdapter,
    intent: &TradingIntent,
    wants_stop: bool,
    wants_take_profit: bool,
    wants_trailing: bool,
) -> GatewayResult<ProtectionPlan> {
    let caps = adapter.capabilities();
    let unsupported = |operation: &str| GatewayError::Unsupported {
        venue: adapter.name().to_string(),
        operation: operation.to_string(),
    };

    let wants_protection = wants_stop || wants_take_profit || wants_trailing;
    let has_compound = caps.supports(Capability::Bracket)
        || caps.supports(Capability::EntryWithProtection)
        || caps.supports(Capability::Oto);

    // Up-front refusal: a requested protective leg nothing can place.
    if wants_trailing && !caps.supports(Capability::TrailingStop) && !caps.supports(Capability::Bracket) {
        return Err(unsupported("trailing stop"));
    }
    if wants_stop && !caps.supports(Capability::StopLoss) && !has_compound {
        return Err(unsupported("stop-loss order"));
    }
    if wants_take_profit && !caps.supports(Capability::TakeProfit) && !has_compound {
        return Err(unsupported("take-profit order"));
    }
    if intent.stop_limit_offset.is_some() && !caps.supports(Capability::StopLimit) {
        return Err(unsupported("stop-limit order"));
    }
    if intent.use_oco && !caps.supports(Capability::Oco) {
        return Err(unsupported("OCO order"));
    }
    if intent.extended_hours && !caps.supports(Capability::ExtendedHours) {
        return Err(unsupported("extended-hours trading"));
    }

    if intent.use_bracket && caps.supports(Capability::Bracket) && wants_protection {
        return Ok(ProtectionPlan::Bracket);
    }
    if caps.supports(Capability::EntryWithProtection) && (wants_stop || wants_take_profit) {
        return Ok(ProtectionPlan::AtomicBatch);
    }
    if intent.use_oto && caps.supports(Capability::Oto) && wants_protection {
        return Ok(ProtectionPlan::Oto);
    }
    Ok(ProtectionPlan::SeparateLegs)
}

// ---------------------------------------------------------------------------
// Pure arithmetic helpers
// ---------------------------------------------------------------------------

/// Stop and take-profit prices from percentage distances, tick-rounded, with
/// the sign of the side respected.
fn protective_prices(
    side: Side,
    reference: Decimal,
    stop_loss_percent: Option<Decimal>,
    take_profit_percent: Option<Decimal>,
    rules: &SymbolRules,
) -> (Option<Decimal>, Option<Decimal>) {
    let factor = |pct: Decimal| pct / Decimal::ONE_HUNDRED;
    let stop = stop_loss_percent.map(|pct| {
        let price = match side {
            Side::Long => reference * (Decimal::ONE - factor(pct)),
            Side::Short => reference * (Decimal::ONE + factor(pct)),
        };
        rules.round_price(price)
    });
    let take_profit = take_profit_percent.map(|pct| {
        let price = match side {
            Side::Long => reference * (Decimal::ONE + factor(pct)),
            Side::Short => reference * (Decimal::ONE - factor(pct)),
        };
        rules.round_price(price)
    });
    (stop, take_profit)
}

/// Stop-limit price from the offset, on the loss-protective side of the stop.
fn stop_limit_price(
    side: Side,
    stop_price: Option<Decimal>,
    offset: Option<Decimal>,
    rules: &SymbolRules,
) -> Option<Decimal> {
    let stop = stop_price?;
    let offset = offset?;
    let price = match side {
        Side::Long => stop - offset,
        Side::Short => stop + offset,
    };
    Some(rules.round_price(price))
}

/// Partial-close quantity: `sell_percentage` of the venue-reported size,
/// floored to the lot grid, never below one lot, never above the position.
fn close_quantity(venue_qty: Decimal, sell_percentage: Decimal, rules: &SymbolRules) -> Decimal {
    if sell_percentage >= Decimal::ONE_HUNDRED {
        return venue_qty;
    }
    let fraction = venue_qty * sell_percentage / Decimal::ONE_HUNDRED;
    let mut qty = rules.round_qty(fraction);
    let one_lot = if rules.lot_size.is_zero() {
        rules.min_qty
    } else {
        rules.lot_size
    };
    if qty < one_lot {
        qty = one_lot;
    }
    qty.min(venue_qty)
}

/// Realised PnL in quote currency: `qty × (exit − entry)`, negated for short.
fn pnl_usd(side: Side, entry: Decimal, exit: Decimal, qty: Decimal) -> Decimal {
    let raw = qty * (exit - entry);
    match side {
        Side::Long => raw,
        Side::Short => -raw,
    }
}

fn trailing_spec(intent: &TradingIntent) -> Option<TrailSpec> {
    if let Some(pct) = intent.trailing_percent {
        return Some(TrailSpec::CallbackRatePercent(pct));
    }
    intent.trailing_distance.map(TrailSpec::PriceDistance)
}

fn stop_kind_of(intent: &TradingIntent, trailing: bool) -> StopKind {
    if trailing {
        StopKind::Trailing
    } else if intent.stop_limit_offset.is_some() {
        StopKind::StopLimit
    } else {
        StopKind::Regular
    }
}

/// Resolve the symbol actually sent to the venue; options intents encode
/// into OCC symbology.
fn order_symbol(intent: &TradingIntent) -> String {
    match (intent.option_right, intent.option_strike, intent.option_expiration) {
        (Some(right), Some(strike), Some(expiration)) => {
            occ_symbol(&intent.symbol, expiration, right, strike)
        }
        _ => intent.symbol.clone(),
    }
}

fn to_record(position: &TrackedPosition) -> PositionRecord {
    PositionRecord {
        user_id: position.user_id.clone(),
        exchange: position.venue.clone(),
        symbol: position.symbol.clone(),
        side: position.side,
        entry_price: position.entry_price,
        entry_time: position.entry_time,
        qty: position.qty,
        position_size_usd: position.position_size_usd,
        stop_loss_price: position.stop_loss_price,
        take_profit_price: position.take_profit_price,
        entry_order_id: position.entry_order_id.clone(),
        stop_loss_order_id: position.stop_loss_order_id.clone(),
        take_profit_order_id: position.take_profit_order_id.clone(),
        asset_class: position.asset_class.clone(),
        strategy_id: position.strategy_id.clone(),
    }
}

/// Minimal close intent for the sweeper and worker paths.
fn synthetic_close(user_id: &str, venue: &str, symbol: &str) -> TradingIntent {
    TradingIntent {
        user_id: user_id.to_string(),
        venue: venue.to_string(),
        action: Action::Close,
        symbol: symbol.to_string(),
        order_kind: OrderKind::Market,
        limit_price: None,
        position_size_usd: None,
        stop_loss_percent: None,
        take_profit_percent: None,
        trailing_distance: None,
        trailing_percent: None,
        use_bracket: false,
        use_oco: false,
        use_oto: false,
        stop_limit_offset: None,
        extended_hours: false,
        sell_percentage: Decimal::ONE_HUNDRED,
        strategy_id: None,
        signal_id: uuid::Uuid::new_v4().to_string(),
        source: "gateway".to_string(),
        option_right: None,
        option_strike: None,
        option_expiration: None,
        contract_side: None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExchangeSettingsRecord, MemoryStore};
    use crate::venues::testing::MockVenue;
    use crate::venues::PositionSnapshot;
    use rust_decimal_macros::dec;

    struct FixedAdapters(Arc<MockVenue>);

    #[async_trait]
    impl AdapterSource for FixedAdapters {
        async fn adapter_for(
            &self,
            _user_id: &str,
            _venue: &str,
        ) -> GatewayResult<Arc<dyn VenueAdapter>> {
            Ok(self.0.clone())
        }
    }

    struct FixedValidator(u8);

    #[async_trait]
    impl SignalValidator for FixedValidator {
        async fn validate(&self, _payload: &serde_json::Value) -> GatewayResult<MlValidation> {
            Ok(MlValidation {
                confidence: self.0,
                reasons: vec!["test".to_string()],
                market_context: serde_json::Value::Null,
                feature_scores: serde_json::Value::Null,
            })
        }
    }

    struct FailingValidator;

    #[async_trait]
    impl SignalValidator for FailingValidator {
        async fn validate(&self, _payload: &serde_json::Value) -> GatewayResult<MlValidation> {
            Err(GatewayError::internal("ml", "timeout"))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        venue: Arc<MockVenue>,
        tracker: Arc<PositionTracker>,
        executor: TradeExecutor,
    }

    fn harness_with(venue: MockVenue, validator: Option<Arc<dyn SignalValidator>>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let venue = Arc::new(venue);
        let tracker = Arc::new(PositionTracker::new());
        let settings = Arc::new(SettingsService::new(store.clone()));
        let risk = Arc::new(RiskLimitEngine::new(store.clone(), None));
        let notifier = Arc::new(Notifier::new(store.clone()));
        let executor = TradeExecutor::new(
            store.clone(),
            Arc::new(FixedAdapters(venue.clone())),
            tracker.clone(),
            settings,
            risk,
            notifier,
            validator,
            ExecutorConfig {
                default_position_size_usd: Some(dec!(1000)),
                fractional_threshold_usd: dec!(200),
                reversal_pause_ms: 0,
            },
        );
        Harness {
            store,
            venue,
            tracker,
            executor,
        }
    }

    fn harness() -> Harness {
        harness_with(MockVenue::new(), None)
    }

    fn intent(action: Action) -> TradingIntent {
        TradingIntent {
            user_id: "u1".to_string(),
            venue: "aster".to_string(),
            action,
            symbol: "BTCUSDT".to_string(),
            order_kind: OrderKind::Market,
            limit_price: None,
            position_size_usd: None,
            stop_loss_percent: None,
            take_profit_percent: None,
            trailing_distance: None,
            trailing_percent: None,
            use_bracket: false,
            use_oco: false,
            use_oto: false,
            stop_limit_offset: None,
            extended_hours: false,
            sell_percentage: dec!(100),
            strategy_id: None,
            signal_id: "sig-1".to_string(),
            source: "webhook".to_string(),
            option_right: None,
            option_strike: None,
            option_expiration: None,
            contract_side: None,
        }
    }

    fn long_snapshot(qty: Decimal) -> PositionSnapshot {
        PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty,
            entry_price: dec!(50000),
            mark_price: Some(dec!(50500)),
        }
    }

    fn tracked_long(qty: Decimal) -> TrackedPosition {
        TrackedPosition {
            user_id: "u1".to_string(),
            venue: "aster".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty,
            entry_price: dec!(50000),
            entry_time: Utc::now(),
            position_size_usd: dec!(1000),
            entry_order_id: Some("e1".to_string()),
            stop_loss_order_id: Some("sl1".to_string()),
            take_profit_order_id: Some("tp1".to_string()),
            stop_loss_price: Some(dec!(49000)),
            take_profit_price: Some(dec!(52000)),
            stop_kind: StopKind::Regular,
            trailing: None,
            asset_class: "crypto".to_string(),
            strategy_id: None,
        }
    }

    // ---- open: basic entry -------------------------------------------------

    #[tokio::test]
    async fn opens_new_position_with_separate_legs() {
        let h = harness();
        let mut signal = intent(Action::Buy);
        signal.position_size_usd = Some(dec!(1000));
        signal.stop_loss_percent = Some(dec!(1.5));
        signal.take_profit_percent = Some(dec!(3));

        let report = h.executor.execute(&signal).await.unwrap();
        assert!(report.success);
        assert_eq!(report.action, "opened");
        // 1000 USD at 50 000 = 0.02 BTC.
        assert_eq!(report.qty, Some(dec!(0.02)));

        let calls = h.venue.calls();
        assert!(calls.iter().any(|c| c.starts_with("market_order BTCUSDT buy 0.02")));
        assert!(calls.iter().any(|c| c.starts_with("take_profit BTCUSDT sell")));
        assert!(calls.iter().any(|c| c.starts_with("stop_loss BTCUSDT sell")));

        let tracked = h.tracker.get("u1", "aster", "BTCUSDT").unwrap();
        assert_eq!(tracked.side, Side::Long);
        assert!(tracked.stop_loss_order_id.is_some());
        assert!(tracked.take_profit_order_id.is_some());
        assert_eq!(h.store.positions_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn refuses_without_any_position_size() {
        let store = Arc::new(MemoryStore::new());
        let venue = Arc::new(MockVenue::new());
        let executor = TradeExecutor::new(
            store.clone(),
            Arc::new(FixedAdapters(venue)),
            Arc::new(PositionTracker::new()),
            Arc::new(SettingsService::new(store.clone())),
            Arc::new(RiskLimitEngine::new(store.clone(), None)),
            Arc::new(Notifier::new(store)),
            None,
            ExecutorConfig {
                default_position_size_usd: None,
                ..ExecutorConfig::default()
            },
        );
        let err = executor.execute(&intent(Action::Buy)).await.unwrap_err();
        assert!(err.to_string().contains("position_size_usd"));
    }

    // ---- idempotent skip ---------------------------------------------------

    #[tokio::test]
    async fn same_side_signal_is_idempotent_skip() {
        let h = harness();
        h.tracker.add(tracked_long(dec!(0.023)));
        h.venue.set_positions(vec![long_snapshot(dec!(0.023))]);

        let report = h.executor.execute(&intent(Action::Buy)).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.action, "skipped");

        // No venue calls beyond the position-check read.
        let calls = h.venue.calls();
        assert_eq!(calls, vec!["get_position BTCUSDT".to_string()]);
        assert!(h.store.trades_snapshot().is_empty());
    }

    // ---- auto-heal ---------------------------------------------------------

    #[tokio::test]
    async fn clears_tracker_when_venue_denies_position() {
        let h = harness();
        h.tracker.add(tracked_long(dec!(0.02)));
        // Venue has no position; tracker is stale.

        let mut signal = intent(Action::Buy);
        signal.stop_loss_percent = Some(dec!(1));
        let report = h.executor.execute(&signal).await.unwrap();
        assert!(report.success);
        assert_eq!(report.action, "opened");
        assert!(h.venue.calls().iter().any(|c| c.starts_with("market_order")));
    }

    // ---- reversal ----------------------------------------------------------

    #[tokio::test]
    async fn opposite_side_signal_reverses() {
        let h = harness();
        h.tracker.add(tracked_long(dec!(0.023)));
        h.venue.set_positions(vec![long_snapshot(dec!(0.023))]);

        let mut signal = intent(Action::Sell);
        signal.stop_loss_percent = Some(dec!(1.5));
        signal.take_profit_percent = Some(dec!(3));
        let report = h.executor.execute(&signal).await.unwrap();
        assert!(report.success);
        assert_eq!(report.action, "opened");

        let calls = h.venue.calls();
        // Reduce-only close of the old long...
        assert!(calls.iter().any(|c| c.starts_with("close_position BTCUSDT sell 0.023")));
        // ...then a fresh short entry with protective legs on the buy side.
        assert!(calls.iter().any(|c| c.starts_with("market_order BTCUSDT sell 0.02")));
        assert!(calls.iter().any(|c| c.starts_with("take_profit BTCUSDT buy")));
        assert!(calls.iter().any(|c| c.starts_with("stop_loss BTCUSDT buy")));

        let trades = h.store.trades_snapshot();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::Reversal);
        assert_eq!(trades[0].qty, dec!(0.023));

        let tracked = h.tracker.get("u1", "aster", "BTCUSDT").unwrap();
        assert_eq!(tracked.side, Side::Short);
    }

    // ---- partial close -----------------------------------------------------

    #[tokio::test]
    async fn partial_close_floors_to_lot_and_keeps_position() {
        let h = harness();
        h.tracker.add(tracked_long(dec!(0.020)));
        h.venue.set_positions(vec![long_snapshot(dec!(0.020))]);

        let mut signal = intent(Action::Close);
        signal.sell_percentage = dec!(25);
        let report = h.executor.execute(&signal).await.unwrap();
        assert!(report.success);
        assert_eq!(report.action, "partially_closed");
        assert_eq!(report.qty, Some(dec!(0.005)));

        let tracked = h.tracker.get("u1", "aster", "BTCUSDT").unwrap();
        assert_eq!(tracked.qty, dec!(0.015));
        assert_eq!(h.store.trades_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn full_close_removes_position_and_cancels_protection() {
        let h = harness();
        h.tracker.add(tracked_long(dec!(0.02)));
        h.venue.set_positions(vec![long_snapshot(dec!(0.02))]);

        let report = h.executor.execute(&intent(Action::Close)).await.unwrap();
        assert!(report.success);
        assert_eq!(report.action, "closed");
        assert!(!h.tracker.has("u1", "aster", "BTCUSDT"));

        // CancelAll-capable venue gets the single sweep.
        assert!(h.venue.calls().iter().any(|c| c == "cancel_all BTCUSDT"));

        let trades = h.store.trades_snapshot();
        assert_eq!(trades.len(), 1);
        // Close fill at mock ticker 50 000, entry 50 000 → flat PnL.
        assert_eq!(trades[0].pnl_usd, dec!(0));
    }

    #[tokio::test]
    async fn close_without_any_position_is_benign() {
        let h = harness();
        let report = h.executor.execute(&intent(Action::Close)).await.unwrap();
        assert!(report.success);
        assert_eq!(report.action, "nothing_to_close");
        assert!(h.store.trades_snapshot().is_empty());
    }

    #[tokio::test]
    async fn close_heals_stale_tracker_entry() {
        let h = harness();
        h.tracker.add(tracked_long(dec!(0.02)));
        // Venue reports nothing for the symbol.

        let report = h.executor.execute(&intent(Action::Close)).await.unwrap();
        assert!(report.success);
        assert_eq!(report.action, "nothing_to_close");
        assert!(!h.tracker.has("u1", "aster", "BTCUSDT"));
        assert!(!h
            .venue
            .calls()
            .iter()
            .any(|c| c.starts_with("close_position")));
    }

    #[tokio::test]
    async fn close_reconciles_untracked_venue_position() {
        let h = harness();
        h.venue.set_positions(vec![long_snapshot(dec!(0.02))]);

        let report = h.executor.execute(&intent(Action::Close)).await.unwrap();
        assert!(report.success);
        assert_eq!(report.action, "closed");
        assert_eq!(h.store.trades_snapshot().len(), 1);
    }

    // ---- protective leg failure --------------------------------------------

    #[tokio::test]
    async fn failed_stop_leg_keeps_position_with_null_id() {
        let h = harness();
        h.venue.fail_on("stop_loss");

        let mut signal = intent(Action::Buy);
        signal.stop_loss_percent = Some(dec!(1.5));
        signal.take_profit_percent = Some(dec!(3));
        let report = h.executor.execute(&signal).await.unwrap();
        assert!(report.success, "entry must not be rolled back");

        let tracked = h.tracker.get("u1", "aster", "BTCUSDT").unwrap();
        assert!(tracked.stop_loss_order_id.is_none());
        assert!(tracked.take_profit_order_id.is_some());
    }

    // ---- compound planning -------------------------------------------------

    #[tokio::test]
    async fn bracket_capable_venue_takes_one_compound_call() {
        let h = harness_with(
            MockVenue::with_caps(&[
                Capability::MarketOrder,
                Capability::LimitOrder,
                Capability::StopLoss,
                Capability::TakeProfit,
                Capability::Bracket,
            ]),
            None,
        );
        let mut signal = intent(Action::Buy);
        signal.use_bracket = true;
        signal.stop_loss_percent = Some(dec!(1));
        signal.take_profit_percent = Some(dec!(2));

        let report = h.executor.execute(&signal).await.unwrap();
        assert!(report.success);
        let calls = h.venue.calls();
        assert!(calls.iter().any(|c| c.starts_with("bracket BTCUSDT")));
        assert!(!calls.iter().any(|c| c.starts_with("market_order")));
        assert!(!calls.iter().any(|c| c.starts_with("stop_loss ")));
    }

    #[tokio::test]
    async fn atomic_batch_preferred_when_available() {
        let h = harness_with(
            MockVenue::with_caps(&[
                Capability::MarketOrder,
                Capability::StopLoss,
                Capability::TakeProfit,
                Capability::EntryWithProtection,
            ]),
            None,
        );
        let mut signal = intent(Action::Buy);
        signal.stop_loss_percent = Some(dec!(1));
        signal.take_profit_percent = Some(dec!(2));

        h.executor.execute(&signal).await.unwrap();
        let calls = h.venue.calls();
        assert!(calls.iter().any(|c| c.starts_with("batch BTCUSDT")));
        assert!(!calls.iter().any(|c| c.starts_with("market_order")));
    }

    #[tokio::test]
    async fn impossible_stop_refused_up_front() {
        let h = harness_with(
            MockVenue::with_caps(&[Capability::MarketOrder, Capability::LimitOrder]),
            None,
        );
        let mut signal = intent(Action::Buy);
        signal.stop_loss_percent = Some(dec!(1));

        let err = h.executor.execute(&signal).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported { .. }));
        // Nothing was placed.
        assert!(!h.venue.calls().iter().any(|c| c.starts_with("market_order")));
    }

    #[tokio::test]
    async fn small_notional_uses_fractional_path() {
        let h = harness_with(
            MockVenue::with_caps(&[Capability::MarketOrder, Capability::Fractional]),
            None,
        );
        let mut signal = intent(Action::Buy);
        signal.position_size_usd = Some(dec!(50));

        // 50 USD at 50 000 rounds to 0.001 — above min lot, but under the
        // fractional threshold, so the notional path wins.
        let report = h.executor.execute(&signal).await.unwrap();
        assert!(report.success);
        assert!(h
            .venue
            .calls()
            .iter()
            .any(|c| c.starts_with("fractional BTCUSDT buy $50")));
    }

    // ---- risk and window gates ---------------------------------------------

    #[tokio::test]
    async fn risk_denial_terminates_with_over_limit_and_notifies_once() {
        let h = harness();
        h.store.seed_settings(ExchangeSettingsRecord {
            user_id: "u1".to_string(),
            exchange: "aster".to_string(),
            trading_hours_preset: "custom".to_string(),
            window_timezone: "UTC".to_string(),
            window_start_minute: 0,
            window_end_minute: 1440,
            auto_close_outside_window: false,
            max_trades_per_week: 5,
            max_loss_per_week_usd: dec!(0),
            default_position_size_usd: None,
        });
        for _ in 0..5 {
            let now = Utc::now();
            h.store.seed_trade(TradeRecord {
                user_id: "u1".to_string(),
                exchange: "aster".to_string(),
                symbol: "BTCUSDT".to_string(),
                side: Side::Long,
                entry_price: dec!(100),
                entry_time: now,
                exit_price: dec!(101),
                exit_time: now,
                qty: dec!(1),
                position_size_usd: dec!(100),
                pnl_usd: dec!(1),
                pnl_percent: dec!(1),
                is_winner: true,
                exit_reason: ExitReason::TakeProfit,
                order_id: None,
                asset_class: "crypto".to_string(),
                strategy_id: None,
            });
        }

        let err = h.executor.execute(&intent(Action::Buy)).await.unwrap_err();
        match err {
            GatewayError::OverLimit { limit, current, cap } => {
                assert_eq!(limit, "max_trades_per_week");
                assert_eq!(current, dec!(5));
                assert_eq!(cap, dec!(5));
            }
            other => panic!("expected OverLimit, got {other}"),
        }
        let notifications = h.store.notifications_snapshot();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].title, "Weekly Trade Limit Reached");

        // A second denied attempt does not duplicate the notification.
        let _ = h.executor.execute(&intent(Action::Buy)).await.unwrap_err();
        assert_eq!(h.store.notifications_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn entry_outside_window_rejected() {
        let h = harness();
        h.store.seed_settings(ExchangeSettingsRecord {
            user_id: "u1".to_string(),
            exchange: "aster".to_string(),
            trading_hours_preset: "weekend".to_string(),
            window_timezone: "UTC".to_string(),
            window_start_minute: 0,
            window_end_minute: 1440,
            auto_close_outside_window: false,
            max_trades_per_week: 0,
            max_loss_per_week_usd: dec!(0),
            default_position_size_usd: None,
        });

        // Run only when today is a weekday; a weekend preset then rejects.
        use chrono::Datelike;
        if !matches!(Utc::now().weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
            let err = h.executor.execute(&intent(Action::Buy)).await.unwrap_err();
            assert!(matches!(err, GatewayError::OutsideWindow(_)));
        }
    }

    // ---- ML gate -----------------------------------------------------------

    fn ml_strategy() -> StrategyRecord {
        StrategyRecord {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            name: "breakout".to_string(),
            status: crate::store::StrategyStatus::Active,
            asset_class: "crypto".to_string(),
            order_config: serde_json::Value::Null,
            ml_validation_enabled: true,
            ml_confidence_threshold: 70,
        }
    }

    #[tokio::test]
    async fn low_confidence_blocks_with_validation_log() {
        let h = harness_with(MockVenue::new(), Some(Arc::new(FixedValidator(55))));
        h.store.seed_strategy(ml_strategy());

        let mut signal = intent(Action::Buy);
        signal.strategy_id = Some("s1".to_string());
        let report = h.executor.execute(&signal).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.blocked_by_ml, Some(true));
        assert_eq!(report.confidence, Some(55));
        assert_eq!(report.threshold, Some(70));
        assert!(h.venue.calls().is_empty(), "no venue call on ML block");

        let log = h.store.validation_log_snapshot();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].validation_result, "blocked");

        let notifications = h.store.notifications_snapshot();
        assert_eq!(notifications[0].kind, "ai_trade_blocked");
    }

    #[tokio::test]
    async fn high_confidence_passes_gate() {
        let h = harness_with(MockVenue::new(), Some(Arc::new(FixedValidator(88))));
        h.store.seed_strategy(ml_strategy());

        let mut signal = intent(Action::Buy);
        signal.strategy_id = Some("s1".to_string());
        let report = h.executor.execute(&signal).await.unwrap();
        assert!(report.success);
        assert_eq!(h.store.validation_log_snapshot()[0].validation_result, "approved");
    }

    #[tokio::test]
    async fn ml_transport_failure_fails_open() {
        let h = harness_with(MockVenue::new(), Some(Arc::new(FailingValidator)));
        h.store.seed_strategy(ml_strategy());

        let mut signal = intent(Action::Buy);
        signal.strategy_id = Some("s1".to_string());
        let report = h.executor.execute(&signal).await.unwrap();
        assert!(report.success, "ML outage must not block trading");
    }

    // ---- pure helpers ------------------------------------------------------

    fn rules() -> SymbolRules {
        SymbolRules {
            lot_size: dec!(0.001),
            tick_size: dec!(0.1),
            min_qty: dec!(0.001),
        }
    }

    #[test]
    fn protective_prices_respect_side_sign() {
        let (sl, tp) = protective_prices(
            Side::Long,
            dec!(50000),
            Some(dec!(1.5)),
            Some(dec!(3)),
            &rules(),
        );
        assert_eq!(sl, Some(dec!(49250.0)));
        assert_eq!(tp, Some(dec!(51500.0)));

        let (sl, tp) = protective_prices(
            Side::Short,
            dec!(50000),
            Some(dec!(1.5)),
            Some(dec!(3)),
            &rules(),
        );
        assert_eq!(sl, Some(dec!(50750.0)));
        assert_eq!(tp, Some(dec!(48500.0)));
    }

    #[test]
    fn close_quantity_floors_with_one_lot_minimum() {
        let r = rules();
        assert_eq!(close_quantity(dec!(0.020), dec!(25), &r), dec!(0.005));
        assert_eq!(close_quantity(dec!(0.020), dec!(100), &r), dec!(0.020));
        // 10% of 0.005 = 0.0005 floors to zero → bumped to one lot.
        assert_eq!(close_quantity(dec!(0.005), dec!(10), &r), dec!(0.001));
        // Never above the position.
        let tiny = SymbolRules {
            lot_size: dec!(1),
            tick_size: dec!(1),
            min_qty: dec!(1),
        };
        assert_eq!(close_quantity(dec!(0.5), dec!(10), &tiny), dec!(0.5));
    }

    #[test]
    fn pnl_matches_contract() {
        assert_eq!(pnl_usd(Side::Long, dec!(100), dec!(110), dec!(2)), dec!(20));
        assert_eq!(pnl_usd(Side::Short, dec!(100), dec!(110), dec!(2)), dec!(-20));
        assert_eq!(pnl_usd(Side::Short, dec!(100), dec!(90), dec!(2)), dec!(20));
    }

    #[test]
    fn option_intents_encode_to_occ() {
        let mut signal = intent(Action::Buy);
        signal.symbol = "AAPL".to_string();
        signal.option_right = Some(crate::intent::OptionRight::Call);
        signal.option_strike = Some(dec!(200));
        signal.option_expiration = chrono::NaiveDate::from_ymd_opt(2026, 9, 18);
        assert_eq!(order_symbol(&signal), "AAPL260918C00200000");
    }
}
