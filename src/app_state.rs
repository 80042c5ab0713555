// =============================================================================
// Central application state — Meridian execution gateway
// =============================================================================
//
// The single wiring point for the gateway: every subsystem is constructed
// here and shared through Arc. Handlers receive Arc<AppState>; background
// tasks clone the pieces they need.
//
// Credentials never live here — they stay inside adapter instances owned by
// the registry's bounded cache.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use crate::api::secret::WebhookRateLimiter;
use crate::config::GatewayConfig;
use crate::executor::{ExecutorConfig, TradeExecutor};
use crate::ml::{LlmClient, MlClient};
use crate::notify::Notifier;
use crate::risk::RiskLimitEngine;
use crate::settings::SettingsService;
use crate::store::Store;
use crate::tracker::PositionTracker;
use crate::venues::registry::AdapterRegistry;
use crate::worker::{AiSignalWorker, WorkerConfig};

/// Shared state for all HTTP handlers and background tasks.
pub struct AppState {
    pub config: GatewayConfig,
    /// Operator token for the authenticated probes.
    pub admin_token: String,
    pub store: Arc<dyn Store>,
    pub tracker: Arc<PositionTracker>,
    pub settings: Arc<SettingsService>,
    pub risk: Arc<RiskLimitEngine>,
    pub registry: Arc<AdapterRegistry>,
    pub notifier: Arc<Notifier>,
    pub executor: Arc<TradeExecutor>,
    pub rate_limiter: WebhookRateLimiter,
    pub start_time: Instant,
}

impl AppState {
    /// Wire up every subsystem from the config, store, and optional shared
    /// cache connection.
    pub fn new(
        config: GatewayConfig,
        admin_token: String,
        store: Arc<dyn Store>,
        redis: Option<redis::aio::ConnectionManager>,
    ) -> Self {
        let tracker = Arc::new(PositionTracker::new());
        let settings = Arc::new(SettingsService::new(store.clone()));
        let risk = Arc::new(RiskLimitEngine::new(store.clone(), redis));
        let registry = Arc::new(AdapterRegistry::new(store.clone()));
        let notifier = Arc::new(Notifier::new(store.clone()));

        let ml = config
            .ml_base_url
            .as_ref()
            .map(|url| Arc::new(MlClient::new(url.clone())));

        let executor = Arc::new(TradeExecutor::new(
            store.clone(),
            registry.clone(),
            tracker.clone(),
            settings.clone(),
            risk.clone(),
            notifier.clone(),
            ml.clone()
                .map(|client| client as Arc<dyn crate::executor::SignalValidator>),
            ExecutorConfig {
                default_position_size_usd: config.default_position_size_usd,
                fractional_threshold_usd: config.fractional_threshold_usd,
                reversal_pause_ms: config.reversal_pause_ms,
            },
        ));

        let rate_limiter = WebhookRateLimiter::new(config.webhook_rate_limit_per_min);

        Self {
            config,
            admin_token,
            store,
            tracker,
            settings,
            risk,
            registry,
            notifier,
            executor,
            rate_limiter,
            start_time: Instant::now(),
        }
    }

    /// Build the AI worker wired against this state, or `None` when the
    /// worker is disabled.
    pub fn build_worker(self: &Arc<Self>) -> Option<Arc<AiSignalWorker>> {
        if !self.config.worker_enabled {
            return None;
        }
        let predictor = self.config.ml_base_url.as_ref().map(|url| {
            Arc::new(MlClient::new(url.clone())) as Arc<dyn crate::worker::StrategyPredictor>
        });
        let llm = self.config.llm_endpoint.as_ref().map(|endpoint| {
            Arc::new(LlmClient::new(endpoint.clone(), self.config.llm_model.clone()))
                as Arc<dyn crate::worker::DecisionProvider>
        });

        Some(Arc::new(AiSignalWorker::new(
            self.store.clone(),
            self.registry.clone(),
            self.executor.clone(),
            self.tracker.clone(),
            predictor,
            llm,
            WorkerConfig {
                interval_secs: self.config.worker_interval_secs,
                strategy_timeout_secs: self.config.worker_strategy_timeout_secs,
                candle_limit: self.config.worker_candle_limit,
                max_consecutive_failures: self.config.worker_max_consecutive_failures,
            },
        )))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("admin_token", &"<redacted>")
            .field("open_positions", &self.tracker.count())
            .field("uptime_secs", &self.uptime_secs())
            .finish()
    }
}
