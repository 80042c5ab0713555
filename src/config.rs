// =============================================================================
// Gateway configuration — JSON file with serde defaults, atomic save
// =============================================================================
//
// Non-secret tunables live in a JSON file so operators can adjust them
// without rebuilding; every field carries a serde default so older files
// keep loading as fields are added. Secrets (store key, admin token, redis
// URL) come exclusively from the environment and never touch this file.
//
// Persistence uses the tmp + rename pattern to prevent corruption on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_fractional_threshold() -> Decimal {
    Decimal::new(200, 0)
}

fn default_reversal_pause_ms() -> u64 {
    500
}

fn default_rate_limit_per_min() -> u32 {
    120
}

fn default_worker_interval() -> u64 {
    45
}

fn default_strategy_timeout() -> u64 {
    30
}

fn default_candle_limit() -> u32 {
    100
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listen address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Execution ----------------------------------------------------------

    /// Static fallback at the tail of the position-sizing chain.
    #[serde(default)]
    pub default_position_size_usd: Option<Decimal>,

    /// Below this notional, fractional-capable venues take the notional
    /// order path.
    #[serde(default = "default_fractional_threshold")]
    pub fractional_threshold_usd: Decimal,

    /// Pause between the close and the re-open legs of a reversal.
    #[serde(default = "default_reversal_pause_ms")]
    pub reversal_pause_ms: u64,

    // --- Intake -------------------------------------------------------------

    /// Per-process webhook ceiling per minute.
    #[serde(default = "default_rate_limit_per_min")]
    pub webhook_rate_limit_per_min: u32,

    // --- AI worker ----------------------------------------------------------

    #[serde(default = "default_true")]
    pub worker_enabled: bool,

    #[serde(default = "default_worker_interval")]
    pub worker_interval_secs: u64,

    #[serde(default = "default_strategy_timeout")]
    pub worker_strategy_timeout_secs: u64,

    #[serde(default = "default_candle_limit")]
    pub worker_candle_limit: u32,

    #[serde(default = "default_max_consecutive_failures")]
    pub worker_max_consecutive_failures: u32,

    // --- External decision services ------------------------------------------

    /// Base URL of the ML prediction service; absent disables both the
    /// validation gate and the worker's ML routing.
    #[serde(default)]
    pub ml_base_url: Option<String>,

    /// LLM decision endpoint; absent disables the LLM fallback.
    #[serde(default)]
    pub llm_endpoint: Option<String>,

    #[serde(default = "default_llm_model")]
    pub llm_model: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            default_position_size_usd: None,
            fractional_threshold_usd: default_fractional_threshold(),
            reversal_pause_ms: default_reversal_pause_ms(),
            webhook_rate_limit_per_min: default_rate_limit_per_min(),
            worker_enabled: true,
            worker_interval_secs: default_worker_interval(),
            worker_strategy_timeout_secs: default_strategy_timeout(),
            worker_candle_limit: default_candle_limit(),
            worker_max_consecutive_failures: default_max_consecutive_failures(),
            ml_base_url: None,
            llm_endpoint: None,
            llm_model: default_llm_model(),
        }
    }
}

impl GatewayConfig {
    /// Load from a JSON file at `path`; errors let the caller fall back to
    /// defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read gateway config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse gateway config from {}", path.display()))?;

        info!(
            path = %path.display(),
            bind_addr = %config.bind_addr,
            worker_enabled = config.worker_enabled,
            "gateway config loaded"
        );
        Ok(config)
    }

    /// Persist with an atomic tmp + rename write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise gateway config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "gateway config saved");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.webhook_rate_limit_per_min, 120);
        assert_eq!(config.worker_interval_secs, 45);
        assert!(config.worker_enabled);
        assert!(config.ml_base_url.is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{ "bind_addr": "127.0.0.1:9000", "worker_enabled": false }"#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert!(!config.worker_enabled);
        assert_eq!(config.worker_candle_limit, 100);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway_config.json");

        let mut config = GatewayConfig::default();
        config.bind_addr = "127.0.0.1:1234".to_string();
        config.ml_base_url = Some("http://ml.internal".to_string());
        config.save(&path).unwrap();

        let loaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(loaded.bind_addr, "127.0.0.1:1234");
        assert_eq!(loaded.ml_base_url.as_deref(), Some("http://ml.internal"));
        // The tmp file is gone after the atomic rename.
        assert!(!dir.path().join("gateway_config.json.tmp").exists());
    }

    #[test]
    fn load_missing_file_errors() {
        assert!(GatewayConfig::load("/nonexistent/gateway.json").is_err());
    }
}
