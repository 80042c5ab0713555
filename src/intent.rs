// =============================================================================
// Trading intent — canonical form of an inbound alert
// =============================================================================
//
// Chart platforms send a mix of camelCase and snake_case field names, plus
// deprecated aliases (`stopLoss` for `stop_loss_percent`, `long`/`short` for
// `buy`/`sell`). All of that is folded together exactly once, here, at the
// intake boundary. Downstream code only ever sees `TradingIntent` with
// canonical names.
//
// The webhook secret travels in `RawAlert` but is stripped before the payload
// is persisted to the request log; `redacted_payload` is the only serialised
// form that leaves this module.
// =============================================================================

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};
use crate::types::{Action, ContractSide, OrderKind};

/// Hundred percent, the default and ceiling for `sell_percentage`.
const FULL_CLOSE: Decimal = Decimal::ONE_HUNDRED;

// ---------------------------------------------------------------------------
// Raw wire payload
// ---------------------------------------------------------------------------

/// Option contract right carried on options intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

/// The webhook body as received, before normalisation. Field aliases cover
/// both casing conventions seen in the wild.
#[derive(Clone, Deserialize)]
pub struct RawAlert {
    pub secret: Option<String>,
    pub exchange: Option<String>,
    pub action: Option<String>,
    pub symbol: Option<String>,

    #[serde(alias = "orderType")]
    pub order_type: Option<String>,
    #[serde(alias = "limitPrice")]
    pub limit_price: Option<Decimal>,
    #[serde(alias = "positionSizeUsd", alias = "position_size")]
    pub position_size_usd: Option<Decimal>,

    #[serde(alias = "stopLoss")]
    pub stop_loss_percent: Option<Decimal>,
    #[serde(alias = "takeProfit")]
    pub take_profit_percent: Option<Decimal>,
    #[serde(alias = "trailingDistance")]
    pub trailing_distance: Option<Decimal>,
    #[serde(alias = "trailingPercent")]
    pub trailing_percent: Option<Decimal>,

    #[serde(alias = "useBracket", default)]
    pub use_bracket: bool,
    #[serde(alias = "useOco", default)]
    pub use_oco: bool,
    #[serde(alias = "useOto", default)]
    pub use_oto: bool,
    #[serde(alias = "stopLimitOffset")]
    pub stop_limit_offset: Option<Decimal>,
    #[serde(alias = "extendedHours", default)]
    pub extended_hours: bool,

    #[serde(alias = "sellPercentage")]
    pub sell_percentage: Option<Decimal>,

    #[serde(alias = "strategyId")]
    pub strategy_id: Option<String>,
    #[serde(alias = "signalId")]
    pub signal_id: Option<String>,
    pub source: Option<String>,

    // Options extras
    pub right: Option<OptionRight>,
    pub strike: Option<Decimal>,
    pub expiration: Option<NaiveDate>,

    // Prediction-market extras
    pub side: Option<ContractSide>,
}

impl std::fmt::Debug for RawAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawAlert")
            .field("exchange", &self.exchange)
            .field("action", &self.action)
            .field("symbol", &self.symbol)
            .field("secret", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl RawAlert {
    /// Serialise the payload for the request log with the secret replaced.
    pub fn redacted_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "exchange": self.exchange,
            "action": self.action,
            "symbol": self.symbol,
            "order_type": self.order_type,
            "limit_price": self.limit_price,
            "position_size_usd": self.position_size_usd,
            "stop_loss_percent": self.stop_loss_percent,
            "take_profit_percent": self.take_profit_percent,
            "trailing_distance": self.trailing_distance,
            "trailing_percent": self.trailing_percent,
            "use_bracket": self.use_bracket,
            "use_oco": self.use_oco,
            "use_oto": self.use_oto,
            "stop_limit_offset": self.stop_limit_offset,
            "extended_hours": self.extended_hours,
            "sell_percentage": self.sell_percentage,
            "strategy_id": self.strategy_id,
            "signal_id": self.signal_id,
            "source": self.source,
            "secret": "[redacted]",
        })
    }
}

// ---------------------------------------------------------------------------
// Canonical intent
// ---------------------------------------------------------------------------

/// A fully normalised trading instruction, whether it arrived as an external
/// webhook or was synthesised by the AI signal worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingIntent {
    pub user_id: String,
    pub venue: String,
    pub action: Action,
    pub symbol: String,
    pub order_kind: OrderKind,
    pub limit_price: Option<Decimal>,
    pub position_size_usd: Option<Decimal>,
    pub stop_loss_percent: Option<Decimal>,
    pub take_profit_percent: Option<Decimal>,
    pub trailing_distance: Option<Decimal>,
    pub trailing_percent: Option<Decimal>,
    pub use_bracket: bool,
    pub use_oco: bool,
    pub use_oto: bool,
    pub stop_limit_offset: Option<Decimal>,
    pub extended_hours: bool,
    /// Fraction of the position to close, percent in (0, 100]. Always 100
    /// for entry actions.
    pub sell_percentage: Decimal,
    pub strategy_id: Option<String>,
    pub signal_id: String,
    pub source: String,
    pub option_right: Option<OptionRight>,
    pub option_strike: Option<Decimal>,
    pub option_expiration: Option<NaiveDate>,
    pub contract_side: Option<ContractSide>,
}

impl TradingIntent {
    /// The per-key lock and tracker key for this intent.
    pub fn position_key(&self) -> (String, String, String) {
        (
            self.user_id.clone(),
            self.venue.clone(),
            self.symbol.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Fold a raw alert into a canonical intent for `user_id`.
///
/// # Errors
/// `Input` for any missing required field or unrecognised enumerated value.
pub fn normalise(raw: &RawAlert, user_id: &str) -> GatewayResult<TradingIntent> {
    let venue = raw
        .exchange
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::input("exchange", "required field is missing"))?
        .to_lowercase();

    let symbol = raw
        .symbol
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::input("symbol", "required field is missing"))?
        .to_uppercase();

    let action = parse_action(
        raw.action
            .as_deref()
            .ok_or_else(|| GatewayError::input("action", "required field is missing"))?,
    )?;

    let order_kind = match raw.order_type.as_deref() {
        None => OrderKind::Market,
        Some(s) => match s.to_lowercase().as_str() {
            "market" => OrderKind::Market,
            "limit" => OrderKind::Limit,
            other => {
                return Err(GatewayError::input(
                    "order_type",
                    format!("expected 'market' or 'limit', got '{other}'"),
                ))
            }
        },
    };

    if order_kind == OrderKind::Limit && raw.limit_price.is_none() {
        return Err(GatewayError::input(
            "limit_price",
            "required when order_type is 'limit'",
        ));
    }

    let sell_percentage = coerce_sell_percentage(raw.sell_percentage, &symbol);

    let signal_id = raw
        .signal_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Ok(TradingIntent {
        user_id: user_id.to_string(),
        venue,
        action,
        symbol,
        order_kind,
        limit_price: raw.limit_price,
        position_size_usd: raw.position_size_usd,
        stop_loss_percent: raw.stop_loss_percent,
        take_profit_percent: raw.take_profit_percent,
        trailing_distance: raw.trailing_distance,
        trailing_percent: raw.trailing_percent,
        use_bracket: raw.use_bracket,
        use_oco: raw.use_oco,
        use_oto: raw.use_oto,
        stop_limit_offset: raw.stop_limit_offset,
        extended_hours: raw.extended_hours,
        sell_percentage,
        strategy_id: raw.strategy_id.clone(),
        signal_id,
        source: raw.source.clone().unwrap_or_else(|| "webhook".to_string()),
        option_right: raw.right,
        option_strike: raw.strike,
        option_expiration: raw.expiration,
        contract_side: raw.side,
    })
}

/// Map wire actions onto the canonical three, expanding the deprecated
/// `long` / `short` aliases.
fn parse_action(s: &str) -> GatewayResult<Action> {
    match s.to_lowercase().as_str() {
        "buy" | "long" => Ok(Action::Buy),
        "sell" | "short" => Ok(Action::Sell),
        "close" => Ok(Action::Close),
        other => Err(GatewayError::input(
            "action",
            format!("expected buy|sell|close|long|short, got '{other}'"),
        )),
    }
}

/// Clamp `sell_percentage` into (0, 100]. Out-of-range values coerce to a
/// full close with a warning rather than rejecting the alert.
fn coerce_sell_percentage(value: Option<Decimal>, symbol: &str) -> Decimal {
    match value {
        None => FULL_CLOSE,
        Some(p) if p > Decimal::ZERO && p <= FULL_CLOSE => p,
        Some(p) => {
            warn!(
                symbol,
                sell_percentage = %p,
                "sell_percentage outside (0, 100] — coercing to 100"
            );
            FULL_CLOSE
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw(body: &str) -> RawAlert {
        serde_json::from_str(body).expect("raw alert parses")
    }

    #[test]
    fn minimal_buy_normalises() {
        let alert = raw(r#"{"secret":"s","exchange":"Aster","action":"buy","symbol":"btcusdt"}"#);
        let intent = normalise(&alert, "u1").unwrap();
        assert_eq!(intent.venue, "aster");
        assert_eq!(intent.symbol, "BTCUSDT");
        assert_eq!(intent.action, Action::Buy);
        assert_eq!(intent.order_kind, OrderKind::Market);
        assert_eq!(intent.sell_percentage, dec!(100));
        assert_eq!(intent.source, "webhook");
        assert!(!intent.signal_id.is_empty());
    }

    #[test]
    fn long_short_aliases_fold() {
        let long = raw(r#"{"exchange":"aster","action":"long","symbol":"BTCUSDT"}"#);
        assert_eq!(normalise(&long, "u1").unwrap().action, Action::Buy);
        let short = raw(r#"{"exchange":"aster","action":"SHORT","symbol":"BTCUSDT"}"#);
        assert_eq!(normalise(&short, "u1").unwrap().action, Action::Sell);
    }

    #[test]
    fn camel_case_aliases_accepted() {
        let alert = raw(
            r#"{"exchange":"alpaca","action":"buy","symbol":"AAPL",
                "orderType":"limit","limitPrice":"190.5",
                "stopLoss":"1.5","takeProfit":"3","extendedHours":true}"#,
        );
        let intent = normalise(&alert, "u1").unwrap();
        assert_eq!(intent.order_kind, OrderKind::Limit);
        assert_eq!(intent.limit_price, Some(dec!(190.5)));
        assert_eq!(intent.stop_loss_percent, Some(dec!(1.5)));
        assert_eq!(intent.take_profit_percent, Some(dec!(3)));
        assert!(intent.extended_hours);
    }

    #[test]
    fn missing_required_fields_rejected() {
        let no_symbol = raw(r#"{"exchange":"aster","action":"buy"}"#);
        let err = normalise(&no_symbol, "u1").unwrap_err();
        assert!(err.to_string().contains("symbol"));

        let no_action = raw(r#"{"exchange":"aster","symbol":"BTCUSDT"}"#);
        assert!(normalise(&no_action, "u1").is_err());

        let no_exchange = raw(r#"{"action":"buy","symbol":"BTCUSDT"}"#);
        assert!(normalise(&no_exchange, "u1").is_err());
    }

    #[test]
    fn unknown_action_rejected() {
        let alert = raw(r#"{"exchange":"aster","action":"hodl","symbol":"BTCUSDT"}"#);
        let err = normalise(&alert, "u1").unwrap_err();
        assert!(err.to_string().contains("hodl"));
    }

    #[test]
    fn limit_without_price_rejected() {
        let alert =
            raw(r#"{"exchange":"aster","action":"buy","symbol":"BTCUSDT","order_type":"limit"}"#);
        let err = normalise(&alert, "u1").unwrap_err();
        assert!(err.to_string().contains("limit_price"));
    }

    #[test]
    fn sell_percentage_in_range_kept() {
        let alert = raw(
            r#"{"exchange":"aster","action":"close","symbol":"BTCUSDT","sell_percentage":25}"#,
        );
        assert_eq!(normalise(&alert, "u1").unwrap().sell_percentage, dec!(25));
    }

    #[test]
    fn sell_percentage_out_of_range_coerces_to_full() {
        for body in [
            r#"{"exchange":"aster","action":"close","symbol":"BTCUSDT","sell_percentage":0}"#,
            r#"{"exchange":"aster","action":"close","symbol":"BTCUSDT","sell_percentage":150}"#,
            r#"{"exchange":"aster","action":"close","symbol":"BTCUSDT","sell_percentage":-5}"#,
        ] {
            let intent = normalise(&raw(body), "u1").unwrap();
            assert_eq!(intent.sell_percentage, dec!(100), "body: {body}");
        }
    }

    #[test]
    fn debug_never_prints_secret() {
        let alert =
            raw(r#"{"secret":"hunter2","exchange":"aster","action":"buy","symbol":"BTCUSDT"}"#);
        let dbg = format!("{alert:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn redacted_payload_hides_secret() {
        let alert =
            raw(r#"{"secret":"hunter2","exchange":"aster","action":"buy","symbol":"BTCUSDT"}"#);
        let payload = alert.redacted_payload();
        let text = payload.to_string();
        assert!(!text.contains("hunter2"));
        assert_eq!(payload["secret"], "[redacted]");
    }

    #[test]
    fn prediction_market_side_parses() {
        let alert = raw(
            r#"{"exchange":"kalshi","action":"buy","symbol":"FED-25DEC","side":"yes"}"#,
        );
        let intent = normalise(&alert, "u1").unwrap();
        assert_eq!(intent.contract_side, Some(crate::types::ContractSide::Yes));
    }

    #[test]
    fn options_extras_parse() {
        let alert = raw(
            r#"{"exchange":"alpaca","action":"buy","symbol":"AAPL",
                "right":"call","strike":"200","expiration":"2026-09-18"}"#,
        );
        let intent = normalise(&alert, "u1").unwrap();
        assert_eq!(intent.option_right, Some(OptionRight::Call));
        assert_eq!(intent.option_strike, Some(dec!(200)));
        assert!(intent.option_expiration.is_some());
    }
}
