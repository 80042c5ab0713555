// =============================================================================
// Alpaca adapter — US equities and options, key + secret header pair
// =============================================================================
//
// Alpaca authenticates with two static headers (APCA-API-KEY-ID and
// APCA-API-SECRET-KEY) and is the richest venue in the fleet for compound
// orders: bracket, OCO, and OTO order classes, fractional notional orders,
// extended-hours flags, and trailing stops. Options trade under OCC symbols,
// which the executor encodes before the intent reaches this adapter.
//
// Trading and market data live on different hosts; both share the same
// credential headers.
// =============================================================================

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::error::{GatewayError, GatewayResult};
use crate::types::Side;

use super::transport::Transport;
use super::{
    BalanceEntry, BracketAck, BracketSpec, Candle, Capabilities, Capability, OrderAck, OrderSide,
    PositionSnapshot, SymbolRules, Ticker, TrailSpec, VenueAdapter,
};

const LIVE_URL: &str = "https://api.alpaca.markets";
const PAPER_URL: &str = "https://paper-api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";

/// Alpaca adapter for a single user's key pair.
pub struct AlpacaAdapter {
    key_id: String,
    secret_key: String,
    base_url: String,
    data_url: String,
    transport: Transport,
    capabilities: Capabilities,
}

impl AlpacaAdapter {
    pub fn new(key_id: impl Into<String>, secret_key: impl Into<String>, paper: bool) -> Self {
        Self {
            key_id: key_id.into(),
            secret_key: secret_key.into(),
            base_url: if paper { PAPER_URL } else { LIVE_URL }.to_string(),
            data_url: DATA_URL.to_string(),
            transport: Transport::new("alpaca"),
            capabilities: Capabilities::of(&[
                Capability::MarketOrder,
                Capability::LimitOrder,
                Capability::StopLoss,
                Capability::StopLimit,
                Capability::TakeProfit,
                Capability::TrailingStop,
                Capability::CancelAll,
                Capability::Bracket,
                Capability::Oco,
                Capability::Oto,
                Capability::Fractional,
                Capability::ExtendedHours,
            ]),
        }
    }

    async fn call(
        &self,
        operation: &str,
        method: reqwest::Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> GatewayResult<serde_json::Value> {
        let resp = self
            .transport
            .execute(
                operation,
                |client| {
                    let mut req = client
                        .request(method.clone(), &url)
                        .header("APCA-API-KEY-ID", &self.key_id)
                        .header("APCA-API-SECRET-KEY", &self.secret_key);
                    if let Some(body) = &body {
                        req = req.json(body);
                    }
                    req
                },
                None,
            )
            .await?;
        Ok(resp.body)
    }

    fn permanent(&self, operation: &str, message: impl Into<String>) -> GatewayError {
        GatewayError::VenuePermanent {
            venue: "alpaca".to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    fn order_ack(&self, body: &serde_json::Value) -> GatewayResult<OrderAck> {
        let id = body["id"]
            .as_str()
            .ok_or_else(|| self.permanent("order", "no order id in response"))?;
        Ok(OrderAck {
            order_id: id.to_string(),
            status: body["status"].as_str().unwrap_or("accepted").to_string(),
            fill_price: body["filled_avg_price"]
                .as_str()
                .and_then(|p| p.parse().ok()),
        })
    }

    async fn submit_order(&self, order: serde_json::Value) -> GatewayResult<OrderAck> {
        let body = self
            .call(
                "alpaca::place_order",
                reqwest::Method::POST,
                format!("{}/v2/orders", self.base_url),
                Some(order),
            )
            .await?;
        self.order_ack(&body)
    }

    fn base_order(
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        order_type: &str,
        extended_hours: bool,
    ) -> serde_json::Value {
        serde_json::json!({
            "symbol": symbol,
            "qty": qty.normalize().to_string(),
            "side": side.to_string(),
            "type": order_type,
            "time_in_force": if extended_hours { "day" } else { "gtc" },
            "extended_hours": extended_hours,
        })
    }
}

#[async_trait]
impl VenueAdapter for AlpacaAdapter {
    fn name(&self) -> &'static str {
        "alpaca"
    }

    fn asset_class(&self) -> &'static str {
        "equity"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn probe(&self) -> GatewayResult<()> {
        self.call(
            "alpaca::account",
            reqwest::Method::GET,
            format!("{}/v2/account", self.base_url),
            None,
        )
        .await?;
        Ok(())
    }

    // -- account ------------------------------------------------------------

    #[instrument(skip(self), name = "alpaca::get_balance")]
    async fn get_balance(&self) -> GatewayResult<Vec<BalanceEntry>> {
        let body = self
            .call(
                "alpaca::account",
                reqwest::Method::GET,
                format!("{}/v2/account", self.base_url),
                None,
            )
            .await?;
        let parse = |key: &str| -> Decimal {
            body[key]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO)
        };
        Ok(vec![BalanceEntry {
            asset: body["currency"].as_str().unwrap_or("USD").to_string(),
            available: parse("cash"),
            total: parse("equity"),
        }])
    }

    async fn get_available_margin(&self) -> GatewayResult<Decimal> {
        let body = self
            .call(
                "alpaca::account",
                reqwest::Method::GET,
                format!("{}/v2/account", self.base_url),
                None,
            )
            .await?;
        Ok(body["buying_power"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO))
    }

    // -- positions ----------------------------------------------------------

    #[instrument(skip(self), name = "alpaca::get_positions")]
    async fn get_positions(&self) -> GatewayResult<Vec<PositionSnapshot>> {
        let body = self
            .call(
                "alpaca::positions",
                reqwest::Method::GET,
                format!("{}/v2/positions", self.base_url),
                None,
            )
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| self.permanent("positions", "expected array response"))?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let qty: Decimal = row["qty"].as_str()?.parse().ok()?;
                if qty.is_zero() {
                    return None;
                }
                Some(PositionSnapshot {
                    symbol: row["symbol"].as_str()?.to_string(),
                    side: if row["side"].as_str() == Some("short") {
                        Side::Short
                    } else {
                        Side::Long
                    },
                    qty: qty.abs(),
                    entry_price: row["avg_entry_price"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(Decimal::ZERO),
                    mark_price: row["current_price"].as_str().and_then(|s| s.parse().ok()),
                })
            })
            .collect())
    }

    async fn get_position(&self, symbol: &str) -> GatewayResult<Option<PositionSnapshot>> {
        Ok(self
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol))
    }

    // -- market data --------------------------------------------------------

    #[instrument(skip(self), name = "alpaca::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        let body = self
            .call(
                "alpaca::latest_trade",
                reqwest::Method::GET,
                format!("{}/v2/stocks/{symbol}/trades/latest", self.data_url),
                None,
            )
            .await?;
        let last = body["trade"]["p"]
            .as_f64()
            .map(|p| p.to_string())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.permanent("latest_trade", "no price in response"))?;

        // Quote is best-effort; the last trade already anchors sizing.
        let quote = self
            .call(
                "alpaca::latest_quote",
                reqwest::Method::GET,
                format!("{}/v2/stocks/{symbol}/quotes/latest", self.data_url),
                None,
            )
            .await
            .ok();
        let (bid, ask) = quote
            .map(|q| {
                let parse = |v: &serde_json::Value| {
                    v.as_f64().map(|p| p.to_string()).and_then(|s| s.parse().ok())
                };
                (parse(&q["quote"]["bp"]), parse(&q["quote"]["ap"]))
            })
            .unwrap_or((None, None));

        Ok(Ticker { last, bid, ask })
    }

    async fn symbol_rules(&self, _symbol: &str) -> GatewayResult<SymbolRules> {
        // Whole shares on the standard path; sub-share sizing goes through
        // the fractional notional order instead.
        Ok(SymbolRules {
            lot_size: Decimal::ONE,
            tick_size: Decimal::new(1, 2),
            min_qty: Decimal::ONE,
        })
    }

    async fn get_candles(&self, symbol: &str, limit: u32) -> GatewayResult<Vec<Candle>> {
        let body = self
            .call(
                "alpaca::bars",
                reqwest::Method::GET,
                format!(
                    "{}/v2/stocks/{symbol}/bars?timeframe=1Min&limit={limit}",
                    self.data_url
                ),
                None,
            )
            .await?;
        let rows = body["bars"].as_array().cloned().unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let parse = |v: &serde_json::Value| -> Decimal {
                v.as_f64()
                    .map(|p| p.to_string())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Decimal::ZERO)
            };
            let open_time = row["t"]
                .as_str()
                .and_then(|t| t.parse::<chrono::DateTime<chrono::Utc>>().ok())
                .map(|t| t.timestamp_millis())
                .unwrap_or(0);
            out.push(Candle {
                open_time,
                open: parse(&row["o"]),
                high: parse(&row["h"]),
                low: parse(&row["l"]),
                close: parse(&row["c"]),
                volume: parse(&row["v"]),
            });
        }
        Ok(out)
    }

    // -- orders -------------------------------------------------------------

    #[instrument(skip(self), name = "alpaca::market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        let rules = self.symbol_rules(symbol).await?;
        let qty = rules.round_qty(qty).max(rules.min_qty);
        self.submit_order(Self::base_order(symbol, side, qty, "market", false))
            .await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck> {
        let rules = self.symbol_rules(symbol).await?;
        let mut order = Self::base_order(symbol, side, rules.round_qty(qty).max(rules.min_qty), "limit", false);
        order["limit_price"] = rules.round_price(price).normalize().to_string().into();
        self.submit_order(order).await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Option<Decimal>,
    ) -> GatewayResult<OrderAck> {
        let rules = self.symbol_rules(symbol).await?;
        let order_type = if limit_price.is_some() { "stop_limit" } else { "stop" };
        let mut order = Self::base_order(
            symbol,
            side,
            rules.round_qty(qty).max(rules.min_qty),
            order_type,
            false,
        );
        order["stop_price"] = rules.round_price(stop_price).normalize().to_string().into();
        if let Some(limit) = limit_price {
            order["limit_price"] = rules.round_price(limit).normalize().to_string().into();
        }
        self.submit_order(order).await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.place_limit_order(symbol, side, qty, price).await
    }

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        trail: TrailSpec,
    ) -> GatewayResult<OrderAck> {
        let rules = self.symbol_rules(symbol).await?;
        let mut order = Self::base_order(
            symbol,
            side,
            rules.round_qty(qty).max(rules.min_qty),
            "trailing_stop",
            false,
        );
        match trail {
            TrailSpec::CallbackRatePercent(pct) => {
                order["trail_percent"] = pct.normalize().to_string().into();
            }
            TrailSpec::PriceDistance(d) => {
                order["trail_price"] = d.normalize().to_string().into();
            }
        }
        self.submit_order(order).await
    }

    #[instrument(skip(self), name = "alpaca::close_position")]
    async fn close_position(
        &self,
        symbol: &str,
        _side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        // DELETE /v2/positions can only reduce the held position, which is
        // this venue's reduce-only form.
        let body = self
            .call(
                "alpaca::close",
                reqwest::Method::DELETE,
                format!(
                    "{}/v2/positions/{symbol}?qty={}",
                    self.base_url,
                    qty.normalize()
                ),
                None,
            )
            .await?;
        self.order_ack(&body)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GatewayResult<()> {
        self.call(
            "alpaca::cancel_order",
            reqwest::Method::DELETE,
            format!("{}/v2/orders/{order_id}", self.base_url),
            None,
        )
        .await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<()> {
        let body = self
            .call(
                "alpaca::open_orders",
                reqwest::Method::GET,
                format!("{}/v2/orders?status=open&symbols={symbol}", self.base_url),
                None,
            )
            .await?;
        let ids: Vec<String> = body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|o| o["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        debug!(symbol, count = ids.len(), "cancelling open orders");
        for id in ids {
            self.cancel_order(symbol, &id).await?;
        }
        Ok(())
    }

    // -- compound order classes ----------------------------------------------

    async fn place_bracket_order(&self, spec: &BracketSpec) -> GatewayResult<BracketAck> {
        let rules = self.symbol_rules(&spec.symbol).await?;
        let mut order = Self::base_order(
            &spec.symbol,
            spec.side,
            rules.round_qty(spec.qty).max(rules.min_qty),
            if spec.entry_limit_price.is_some() { "limit" } else { "market" },
            spec.extended_hours,
        );
        order["order_class"] = "bracket".into();
        if let Some(price) = spec.entry_limit_price {
            order["limit_price"] = rules.round_price(price).normalize().to_string().into();
        }
        if let Some(tp) = spec.take_profit_price {
            order["take_profit"] = serde_json::json!({
                "limit_price": rules.round_price(tp).normalize().to_string(),
            });
        }
        if let Some(sl) = spec.stop_loss_price {
            let mut leg = serde_json::json!({
                "stop_price": rules.round_price(sl).normalize().to_string(),
            });
            if let Some(limit) = spec.stop_limit_price {
                leg["limit_price"] = rules.round_price(limit).normalize().to_string().into();
            }
            order["stop_loss"] = leg;
        }

        let body = self
            .call(
                "alpaca::bracket",
                reqwest::Method::POST,
                format!("{}/v2/orders", self.base_url),
                Some(order),
            )
            .await?;
        let entry = self.order_ack(&body)?;

        // Legs come back nested on the entry order.
        let legs = body["legs"].as_array().cloned().unwrap_or_default();
        let leg_id = |order_type: &str| -> Option<String> {
            legs.iter()
                .find(|l| l["type"].as_str() == Some(order_type))
                .and_then(|l| l["id"].as_str().map(str::to_string))
        };
        Ok(BracketAck {
            entry_order_id: entry.order_id,
            take_profit_order_id: leg_id("limit"),
            stop_loss_order_id: leg_id("stop").or_else(|| leg_id("stop_limit")),
        })
    }

    async fn place_oco_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        take_profit_price: Decimal,
        stop_price: Decimal,
    ) -> GatewayResult<BracketAck> {
        let rules = self.symbol_rules(symbol).await?;
        let mut order = Self::base_order(
            symbol,
            side,
            rules.round_qty(qty).max(rules.min_qty),
            "limit",
            false,
        );
        order["order_class"] = "oco".into();
        order["limit_price"] = rules
            .round_price(take_profit_price)
            .normalize()
            .to_string()
            .into();
        order["stop_loss"] = serde_json::json!({
            "stop_price": rules.round_price(stop_price).normalize().to_string(),
        });

        let body = self
            .call(
                "alpaca::oco",
                reqwest::Method::POST,
                format!("{}/v2/orders", self.base_url),
                Some(order),
            )
            .await?;
        let ack = self.order_ack(&body)?;
        let stop_id = body["legs"]
            .as_array()
            .and_then(|legs| legs.first())
            .and_then(|l| l["id"].as_str().map(str::to_string));
        Ok(BracketAck {
            entry_order_id: ack.order_id.clone(),
            take_profit_order_id: Some(ack.order_id),
            stop_loss_order_id: stop_id,
        })
    }

    async fn place_oto_order(&self, spec: &BracketSpec) -> GatewayResult<BracketAck> {
        let rules = self.symbol_rules(&spec.symbol).await?;
        let mut order = Self::base_order(
            &spec.symbol,
            spec.side,
            rules.round_qty(spec.qty).max(rules.min_qty),
            if spec.entry_limit_price.is_some() { "limit" } else { "market" },
            spec.extended_hours,
        );
        order["order_class"] = "oto".into();
        if let Some(price) = spec.entry_limit_price {
            order["limit_price"] = rules.round_price(price).normalize().to_string().into();
        }
        // OTO carries exactly one dependent exit; prefer the stop.
        if let Some(sl) = spec.stop_loss_price {
            order["stop_loss"] = serde_json::json!({
                "stop_price": rules.round_price(sl).normalize().to_string(),
            });
        } else if let Some(tp) = spec.take_profit_price {
            order["take_profit"] = serde_json::json!({
                "limit_price": rules.round_price(tp).normalize().to_string(),
            });
        }

        let body = self
            .call(
                "alpaca::oto",
                reqwest::Method::POST,
                format!("{}/v2/orders", self.base_url),
                Some(order),
            )
            .await?;
        let entry = self.order_ack(&body)?;
        let dependent = body["legs"]
            .as_array()
            .and_then(|legs| legs.first())
            .and_then(|l| l["id"].as_str().map(str::to_string));
        let is_stop = spec.stop_loss_price.is_some();
        Ok(BracketAck {
            entry_order_id: entry.order_id,
            take_profit_order_id: if is_stop { None } else { dependent.clone() },
            stop_loss_order_id: if is_stop { dependent } else { None },
        })
    }

    async fn place_fractional_order(
        &self,
        symbol: &str,
        side: OrderSide,
        notional: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.submit_order(serde_json::json!({
            "symbol": symbol,
            "notional": notional.round_dp(2).normalize().to_string(),
            "side": side.to_string(),
            "type": "market",
            "time_in_force": "day",
        }))
        .await
    }
}

impl std::fmt::Debug for AlpacaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaAdapter")
            .field("key_id", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn adapter() -> AlpacaAdapter {
        AlpacaAdapter::new("key", "secret", true)
    }

    #[test]
    fn base_order_shape() {
        let order = AlpacaAdapter::base_order("AAPL", OrderSide::Buy, dec!(10), "market", false);
        assert_eq!(order["symbol"], "AAPL");
        assert_eq!(order["qty"], "10");
        assert_eq!(order["side"], "buy");
        assert_eq!(order["time_in_force"], "gtc");
        assert_eq!(order["extended_hours"], false);
    }

    #[test]
    fn extended_hours_forces_day_tif() {
        let order = AlpacaAdapter::base_order("AAPL", OrderSide::Sell, dec!(5), "limit", true);
        assert_eq!(order["time_in_force"], "day");
        assert_eq!(order["extended_hours"], true);
    }

    #[test]
    fn capabilities_cover_all_compounds() {
        let a = adapter();
        for cap in [
            Capability::Bracket,
            Capability::Oco,
            Capability::Oto,
            Capability::Fractional,
            Capability::ExtendedHours,
            Capability::TrailingStop,
            Capability::CancelAll,
        ] {
            assert!(a.capabilities().supports(cap), "missing {cap:?}");
        }
        assert!(!a.capabilities().supports(Capability::EntryWithProtection));
        assert!(!a.capabilities().supports(Capability::ReduceOnly));
    }

    #[test]
    fn debug_redacts_key_pair() {
        let adapter = AlpacaAdapter::new("PKVISIBLE123", "shh-dont-tell", true);
        let dbg = format!("{adapter:?}");
        assert!(!dbg.contains("shh-dont-tell"));
        assert!(!dbg.contains("PKVISIBLE123"));
        assert!(dbg.contains("<redacted>"));
    }
}
