// =============================================================================
// AI signal worker — periodic strategy evaluation feeding the executor
// =============================================================================
//
// Every tick (≈45 s) the worker walks the running AI strategies, computes the
// feature vector per target symbol, and asks the hybrid decision stack for an
// action: the ML predictor first, the LLM when ML confidence is under the
// strategy threshold. Every decision — HOLDs included — is persisted with its
// market snapshot and model ids.
//
// Non-HOLD decisions synthesise an intent (`source = ai_engine`) and submit
// it through the SAME executor as external webhooks, so risk limits, the ML
// guard, trading windows, and reconciliation apply uniformly.
//
// Per-strategy work is bounded by a timeout so one stuck strategy cannot
// block the fleet, and consecutive failures quarantine a strategy by pausing
// it. Shutdown is cooperative via a watch channel checked between strategies.
// =============================================================================

pub mod features;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::GatewayResult;
use crate::executor::TradeExecutor;
use crate::intent::TradingIntent;
use crate::ml::{LlmClient, LlmDecision, MlClient, MlPrediction, WorkerAction};
use crate::settings::SettingsService;
use crate::store::{AiDecisionRecord, AiStrategyRecord, AiStrategyStatus, Store};
use crate::tracker::PositionTracker;
use crate::types::{Action, ExitReason, OrderKind};
use crate::venues::registry::AdapterSource;

use features::FeatureVector;

// ---------------------------------------------------------------------------
// Decision seams (ML / LLM, mockable in tests)
// ---------------------------------------------------------------------------

/// The slice of the ML service the worker needs.
#[async_trait]
pub trait StrategyPredictor: Send + Sync {
    async fn predict(&self, payload: &serde_json::Value) -> GatewayResult<MlPrediction>;
    fn model_id(&self) -> String;
}

#[async_trait]
impl StrategyPredictor for MlClient {
    async fn predict(&self, payload: &serde_json::Value) -> GatewayResult<MlPrediction> {
        self.predict_strategy(payload).await
    }
    fn model_id(&self) -> String {
        "ml-predictor".to_string()
    }
}

/// The slice of the LLM service the worker needs.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, context: &serde_json::Value) -> GatewayResult<LlmDecision>;
    fn model_id(&self) -> String;
}

#[async_trait]
impl DecisionProvider for LlmClient {
    async fn decide(&self, context: &serde_json::Value) -> GatewayResult<LlmDecision> {
        LlmClient::decide(self, context).await
    }
    fn model_id(&self) -> String {
        self.model().to_string()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub interval_secs: u64,
    /// Budget for one strategy's full evaluation.
    pub strategy_timeout_secs: u64,
    pub candle_limit: u32,
    /// Consecutive failed ticks before a strategy is paused.
    pub max_consecutive_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 45,
            strategy_timeout_secs: 30,
            candle_limit: 100,
            max_consecutive_failures: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct AiSignalWorker {
    store: Arc<dyn Store>,
    adapters: Arc<dyn AdapterSource>,
    executor: Arc<TradeExecutor>,
    tracker: Arc<PositionTracker>,
    predictor: Option<Arc<dyn StrategyPredictor>>,
    llm: Option<Arc<dyn DecisionProvider>>,
    config: WorkerConfig,
}

impl AiSignalWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        adapters: Arc<dyn AdapterSource>,
        executor: Arc<TradeExecutor>,
        tracker: Arc<PositionTracker>,
        predictor: Option<Arc<dyn StrategyPredictor>>,
        llm: Option<Arc<dyn DecisionProvider>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            executor,
            tracker,
            predictor,
            llm,
            config,
        }
    }

    /// Run until the shutdown signal flips true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            "AI signal worker starting"
        );
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                info!("AI signal worker stopping");
                return;
            }
            self.tick(&shutdown).await;
        }
    }

    /// One pass over the running strategies.
    pub async fn tick(&self, shutdown: &watch::Receiver<bool>) {
        let strategies = match self.store.list_running_ai_strategies().await {
            Ok(strategies) => strategies,
            Err(e) => {
                warn!(error = %e, "could not list AI strategies — skipping tick");
                return;
            }
        };
        debug!(count = strategies.len(), "AI worker tick");

        for strategy in strategies {
            if *shutdown.borrow() {
                return;
            }
            let budget = Duration::from_secs(self.config.strategy_timeout_secs);
            let outcome = tokio::time::timeout(budget, self.evaluate_strategy(&strategy)).await;
            match outcome {
                Ok(Ok(())) => {
                    if strategy.consecutive_failures > 0 {
                        let _ = self
                            .store
                            .set_ai_strategy_failures(&strategy.id, 0)
                            .await;
                    }
                }
                Ok(Err(e)) => {
                    warn!(strategy_id = %strategy.id, error = %e, "strategy tick failed");
                    self.record_failure(&strategy).await;
                }
                Err(_) => {
                    warn!(
                        strategy_id = %strategy.id,
                        budget_secs = self.config.strategy_timeout_secs,
                        "strategy tick exceeded its budget — moving on"
                    );
                    self.record_failure(&strategy).await;
                }
            }
        }
    }

    /// Consecutive-failure quarantine: pause the strategy at the threshold.
    async fn record_failure(&self, strategy: &AiStrategyRecord) {
        let failures = strategy.consecutive_failures + 1;
        if let Err(e) = self
            .store
            .set_ai_strategy_failures(&strategy.id, failures)
            .await
        {
            warn!(strategy_id = %strategy.id, error = %e, "failure counter update failed");
            return;
        }
        if failures >= self.config.max_consecutive_failures {
            warn!(
                strategy_id = %strategy.id,
                failures,
                "strategy quarantined after repeated failures — pausing"
            );
            if let Err(e) = self
                .store
                .update_ai_strategy_status(&strategy.id, AiStrategyStatus::Paused)
                .await
            {
                warn!(strategy_id = %strategy.id, error = %e, "strategy pause failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Per-strategy evaluation
    // -------------------------------------------------------------------------

    async fn evaluate_strategy(&self, strategy: &AiStrategyRecord) -> GatewayResult<()> {
        let adapter = self
            .adapters
            .adapter_for(&strategy.user_id, &strategy.exchange)
            .await?;

        for symbol in &strategy.target_assets {
            if !symbol_allowed(symbol, &strategy.symbol_blacklist, &strategy.symbol_whitelist) {
                debug!(strategy_id = %strategy.id, symbol, "symbol filtered out");
                continue;
            }

            let candles = adapter
                .get_candles(symbol, self.config.candle_limit)
                .await?;
            let features = match FeatureVector::compute(&candles) {
                Some(features) => features,
                None => {
                    debug!(
                        strategy_id = %strategy.id,
                        symbol,
                        bars = candles.len(),
                        "not enough bars for a feature vector"
                    );
                    continue;
                }
            };

            let positions: Vec<serde_json::Value> = self
                .tracker
                .summary()
                .into_iter()
                .filter(|p| p.user_id == strategy.user_id)
                .map(|p| {
                    serde_json::json!({
                        "symbol": p.symbol,
                        "venue": p.venue,
                        "side": p.side,
                        "qty": p.qty,
                        "entry_price": p.entry_price,
                    })
                })
                .collect();

            let (action, confidence, reasoning, model_ids) = self
                .decide(strategy, symbol, &features, &positions)
                .await;

            let decision_row = AiDecisionRecord {
                user_id: strategy.user_id.clone(),
                strategy_id: strategy.id.clone(),
                symbol: symbol.clone(),
                decided_at: Utc::now(),
                market_snapshot: serde_json::json!({
                    "last_close": features.last_close,
                    "positions": positions,
                }),
                technical_indicators: features.to_json(),
                parsed_decision: serde_json::json!({
                    "action": action.to_string(),
                    "reasoning": reasoning,
                }),
                confidence_final: confidence,
                model_ids: model_ids.clone(),
                pnl_1h: None,
                pnl_24h: None,
            };
            if let Err(e) = self.store.insert_ai_decision(&decision_row).await {
                warn!(strategy_id = %strategy.id, symbol, error = %e, "decision write failed");
            }

            match action {
                WorkerAction::Hold => {
                    debug!(strategy_id = %strategy.id, symbol, confidence, "HOLD");
                    continue;
                }
                WorkerAction::Close => {
                    let report = self
                        .executor
                        .close_tracked(
                            &strategy.user_id,
                            &strategy.exchange,
                            symbol,
                            ExitReason::TimeExit,
                        )
                        .await?;
                    info!(
                        strategy_id = %strategy.id,
                        symbol,
                        action = %report.action,
                        "AI close submitted"
                    );
                }
                WorkerAction::Buy | WorkerAction::Sell => {
                    let intent = self.synthesise_intent(strategy, symbol, action);
                    match self.executor.execute(&intent).await {
                        Ok(report) => info!(
                            strategy_id = %strategy.id,
                            symbol,
                            action = %report.action,
                            success = report.success,
                            "AI intent executed"
                        ),
                        Err(e) => warn!(
                            strategy_id = %strategy.id,
                            symbol,
                            error = %e,
                            "AI intent rejected by the execution pipeline"
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    /// Hybrid routing: ML first; LLM when ML confidence is under the
    /// strategy threshold. `ml_weight` pins the mix at its extremes
    /// (0 = always LLM, 100 = never consult the LLM).
    async fn decide(
        &self,
        strategy: &AiStrategyRecord,
        symbol: &str,
        features: &FeatureVector,
        positions: &[serde_json::Value],
    ) -> (WorkerAction, u8, String, Vec<String>) {
        let context = serde_json::json!({
            "strategy_id": strategy.id,
            "risk_profile": strategy.risk_profile,
            "symbol": symbol,
            "features": features.to_json(),
            "positions": positions,
        });

        let mut model_ids = Vec::new();

        let ml_result = if strategy.ml_weight == 0 {
            None
        } else {
            match &self.predictor {
                Some(predictor) => match predictor.predict(&context).await {
                    Ok(prediction) => {
                        model_ids.push(predictor.model_id());
                        Some(prediction)
                    }
                    Err(e) => {
                        warn!(symbol, error = %e, "ML prediction failed — falling back");
                        None
                    }
                },
                None => None,
            }
        };

        if let Some(prediction) = &ml_result {
            if prediction.confidence >= strategy.confidence_threshold
                || strategy.ml_weight >= 100
            {
                let action =
                    WorkerAction::parse(&prediction.action).unwrap_or(WorkerAction::Hold);
                return (
                    action,
                    prediction.confidence,
                    "ml confidence above threshold".to_string(),
                    model_ids,
                );
            }
        }

        if let Some(llm) = &self.llm {
            match llm.decide(&context).await {
                Ok(decision) => {
                    model_ids.push(llm.model_id());
                    let confidence = ml_result.map(|p| p.confidence).unwrap_or(0);
                    return (decision.action, confidence, decision.reasoning, model_ids);
                }
                Err(e) => {
                    warn!(symbol, error = %e, "LLM decision failed — holding");
                }
            }
        }

        let confidence = ml_result.map(|p| p.confidence).unwrap_or(0);
        (
            WorkerAction::Hold,
            confidence,
            "no decision provider available".to_string(),
            model_ids,
        )
    }

    fn synthesise_intent(
        &self,
        strategy: &AiStrategyRecord,
        symbol: &str,
        action: WorkerAction,
    ) -> TradingIntent {
        TradingIntent {
            user_id: strategy.user_id.clone(),
            venue: strategy.exchange.clone(),
            action: match action {
                WorkerAction::Sell => Action::Sell,
                _ => Action::Buy,
            },
            symbol: symbol.to_string(),
            order_kind: OrderKind::Market,
            limit_price: None,
            position_size_usd: Some(strategy.position_size_usd),
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
            strategy_id: Some(strategy.id.clone()),
            signal_id: uuid::Uuid::new_v4().to_string(),
            source: "ai_engine".to_string(),
            option_right: None,
            option_strike: None,
            option_expiration: None,
            contract_side: None,
        }
    }
}

/// Blacklist always wins; an empty whitelist means no restriction.
fn symbol_allowed(symbol: &str, blacklist: &[String], whitelist: &[String]) -> bool {
    if blacklist.iter().any(|s| s.eq_ignore_ascii_case(symbol)) {
        return false;
    }
    whitelist.is_empty() || whitelist.iter().any(|s| s.eq_ignore_ascii_case(symbol))
}

// =============================================================================
// Auto-close sweeper
// =============================================================================

/// Close tracked positions whose `(user, venue)` policy demands it once the
/// trading window shuts. Runs every minute until shutdown.
pub async fn run_window_sweeper(
    tracker: Arc<PositionTracker>,
    settings: Arc<SettingsService>,
    executor: Arc<TradeExecutor>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("auto-close window sweeper starting");
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            info!("auto-close window sweeper stopping");
            return;
        }

        for position in tracker.summary() {
            let policy = settings.policy(&position.user_id, &position.venue).await;
            if !policy.auto_close_outside_window || policy.window.is_open_at(Utc::now()) {
                continue;
            }
            info!(
                user_id = %position.user_id,
                venue = %position.venue,
                symbol = %position.symbol,
                "window closed — auto-closing position"
            );
            if let Err(e) = executor
                .close_tracked(
                    &position.user_id,
                    &position.venue,
                    &position.symbol,
                    ExitReason::AutoCloseWindow,
                )
                .await
            {
                warn!(
                    user_id = %position.user_id,
                    symbol = %position.symbol,
                    error = %e,
                    "auto-close failed — will retry next sweep"
                );
            }
        }
    }
}
