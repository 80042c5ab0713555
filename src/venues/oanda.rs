// =============================================================================
// OANDA adapter — spot FX over the v20 REST API, static bearer token
// =============================================================================
//
// OANDA models direction through signed unit counts rather than a side field,
// and attaches protective orders to the entry itself (`takeProfitOnFill`,
// `stopLossOnFill`, `trailingStopLossOnFill`) — that on-fill form is this
// venue's bracket capability.
//
// The account id is not part of the credential; it is discovered from
// /v3/accounts on first use and cached for the adapter's lifetime.
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::error::{GatewayError, GatewayResult};
use crate::types::Side;

use super::transport::Transport;
use super::{
    BalanceEntry, BracketAck, BracketSpec, Candle, Capabilities, Capability, OrderAck, OrderSide,
    PositionSnapshot, SymbolRules, Ticker, TrailSpec, VenueAdapter,
};

const LIVE_URL: &str = "https://api-fxtrade.oanda.com";
const PAPER_URL: &str = "https://api-fxpractice.oanda.com";

/// OANDA v20 adapter for a single user's token.
pub struct OandaAdapter {
    token: String,
    base_url: String,
    transport: Transport,
    capabilities: Capabilities,
    /// Discovered account id, cached after the first lookup.
    account_id: RwLock<Option<String>>,
}

impl OandaAdapter {
    pub fn new(token: impl Into<String>, account_id: Option<String>, paper: bool) -> Self {
        Self {
            token: token.into(),
            base_url: if paper { PAPER_URL } else { LIVE_URL }.to_string(),
            transport: Transport::new("oanda"),
            capabilities: Capabilities::of(&[
                Capability::MarketOrder,
                Capability::LimitOrder,
                Capability::StopLoss,
                Capability::TakeProfit,
                Capability::TrailingStop,
                Capability::Bracket,
            ]),
            account_id: RwLock::new(account_id),
        }
    }

    // -------------------------------------------------------------------------
    // Symbol mapping
    // -------------------------------------------------------------------------

    /// Map the intent symbol (`EURUSD`) to OANDA's instrument form
    /// (`EUR_USD`). Already-underscored symbols pass through.
    fn instrument(symbol: &str) -> String {
        if symbol.contains('_') {
            return symbol.to_uppercase();
        }
        let upper = symbol.to_uppercase();
        if upper.len() == 6 {
            format!("{}_{}", &upper[..3], &upper[3..])
        } else {
            upper
        }
    }

    /// Map an OANDA instrument back to the intent form.
    fn intent_symbol(instrument: &str) -> String {
        instrument.replace('_', "")
    }

    // -------------------------------------------------------------------------
    // HTTP helpers
    // -------------------------------------------------------------------------

    async fn call(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> GatewayResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .transport
            .execute(
                operation,
                |client| {
                    let mut req = client
                        .request(method.clone(), &url)
                        .bearer_auth(&self.token);
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

    async fn account(&self) -> GatewayResult<String> {
        if let Some(id) = self.account_id.read().clone() {
            return Ok(id);
        }
        let body = self
            .call("oanda::accounts", reqwest::Method::GET, "/v3/accounts", None)
            .await?;
        let id = body["accounts"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|a| a["id"].as_str())
            .ok_or_else(|| self.permanent("accounts", "no account on token"))?
            .to_string();
        debug!(account_id = %id, "oanda account discovered");
        *self.account_id.write() = Some(id.clone());
        Ok(id)
    }

    fn permanent(&self, operation: &str, message: impl Into<String>) -> GatewayError {
        GatewayError::VenuePermanent {
            venue: "oanda".to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// OANDA encodes direction in the sign of `units`.
    fn signed_units(side: OrderSide, qty: Decimal) -> String {
        let units = qty.round();
        match side {
            OrderSide::Buy => units.normalize().to_string(),
            OrderSide::Sell => (-units).normalize().to_string(),
        }
    }

    fn order_ack(&self, body: &serde_json::Value) -> GatewayResult<OrderAck> {
        let fill = &body["orderFillTransaction"];
        if let Some(id) = fill["orderID"].as_str() {
            return Ok(OrderAck {
                order_id: id.to_string(),
                status: "FILLED".to_string(),
                fill_price: fill["price"].as_str().and_then(|p| p.parse().ok()),
            });
        }
        let create = &body["orderCreateTransaction"];
        let id = create["id"]
            .as_str()
            .ok_or_else(|| self.permanent("order", "no transaction id in response"))?;
        Ok(OrderAck {
            order_id: id.to_string(),
            status: "PENDING".to_string(),
            fill_price: None,
        })
    }

    async fn submit_order(&self, order: serde_json::Value) -> GatewayResult<OrderAck> {
        let account = self.account().await?;
        let body = self
            .call(
                "oanda::place_order",
                reqwest::Method::POST,
                &format!("/v3/accounts/{account}/orders"),
                Some(serde_json::json!({ "order": order })),
            )
            .await?;
        self.order_ack(&body)
    }
}

#[async_trait]
impl VenueAdapter for OandaAdapter {
    fn name(&self) -> &'static str {
        "oanda"
    }

    fn asset_class(&self) -> &'static str {
        "forex"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn probe(&self) -> GatewayResult<()> {
        self.account().await?;
        Ok(())
    }

    // -- account ------------------------------------------------------------

    #[instrument(skip(self), name = "oanda::get_balance")]
    async fn get_balance(&self) -> GatewayResult<Vec<BalanceEntry>> {
        let account = self.account().await?;
        let body = self
            .call(
                "oanda::summary",
                reqwest::Method::GET,
                &format!("/v3/accounts/{account}/summary"),
                None,
            )
            .await?;
        let summary = &body["account"];
        let currency = summary["currency"].as_str().unwrap_or("USD").to_string();
        let balance: Decimal = summary["balance"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO);
        let available: Decimal = summary["marginAvailable"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(balance);
        Ok(vec![BalanceEntry {
            asset: currency,
            available,
            total: balance,
        }])
    }

    async fn get_available_margin(&self) -> GatewayResult<Decimal> {
        Ok(self
            .get_balance()
            .await?
            .first()
            .map(|b| b.available)
            .unwrap_or(Decimal::ZERO))
    }

    // -- positions ----------------------------------------------------------

    #[instrument(skip(self), name = "oanda::get_positions")]
    async fn get_positions(&self) -> GatewayResult<Vec<PositionSnapshot>> {
        let account = self.account().await?;
        let body = self
            .call(
                "oanda::open_positions",
                reqwest::Method::GET,
                &format!("/v3/accounts/{account}/openPositions"),
                None,
            )
            .await?;
        let rows = body["positions"].as_array().cloned().unwrap_or_default();

        let mut out = Vec::new();
        for row in rows {
            let instrument = match row["instrument"].as_str() {
                Some(i) => i,
                None => continue,
            };
            for (bucket, side) in [("long", Side::Long), ("short", Side::Short)] {
                let units: Decimal = row[bucket]["units"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Decimal::ZERO);
                if units.is_zero() {
                    continue;
                }
                let entry: Decimal = row[bucket]["averagePrice"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Decimal::ZERO);
                out.push(PositionSnapshot {
                    symbol: Self::intent_symbol(instrument),
                    side,
                    qty: units.abs(),
                    entry_price: entry,
                    mark_price: None,
                });
            }
        }
        Ok(out)
    }

    async fn get_position(&self, symbol: &str) -> GatewayResult<Option<PositionSnapshot>> {
        let wanted = Self::intent_symbol(&Self::instrument(symbol));
        Ok(self
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == wanted))
    }

    // -- market data --------------------------------------------------------

    #[instrument(skip(self), name = "oanda::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        let account = self.account().await?;
        let instrument = Self::instrument(symbol);
        let body = self
            .call(
                "oanda::pricing",
                reqwest::Method::GET,
                &format!("/v3/accounts/{account}/pricing?instruments={instrument}"),
                None,
            )
            .await?;
        let price = body["prices"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| self.permanent("pricing", "no price for instrument"))?;

        let bid: Option<Decimal> = price["bids"]
            .as_array()
            .and_then(|b| b.first())
            .and_then(|b| b["price"].as_str())
            .and_then(|s| s.parse().ok());
        let ask: Option<Decimal> = price["asks"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|a| a["price"].as_str())
            .and_then(|s| s.parse().ok());
        let last = match (bid, ask) {
            (Some(b), Some(a)) => (b + a) / Decimal::TWO,
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return Err(self.permanent("pricing", "empty bid/ask")),
        };
        Ok(Ticker { last, bid, ask })
    }

    async fn symbol_rules(&self, _symbol: &str) -> GatewayResult<SymbolRules> {
        // FX trades in whole units with five-decimal pricing on majors.
        Ok(SymbolRules {
            lot_size: Decimal::ONE,
            tick_size: Decimal::new(1, 5),
            min_qty: Decimal::ONE,
        })
    }

    async fn get_candles(&self, symbol: &str, limit: u32) -> GatewayResult<Vec<Candle>> {
        let instrument = Self::instrument(symbol);
        let body = self
            .call(
                "oanda::candles",
                reqwest::Method::GET,
                &format!("/v3/instruments/{instrument}/candles?granularity=M1&count={limit}&price=M"),
                None,
            )
            .await?;
        let rows = body["candles"].as_array().cloned().unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mid = &row["mid"];
            let parse = |v: &serde_json::Value| -> Decimal {
                v.as_str().and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO)
            };
            let open_time = row["time"]
                .as_str()
                .and_then(|t| t.parse::<chrono::DateTime<chrono::Utc>>().ok())
                .map(|t| t.timestamp_millis())
                .unwrap_or(0);
            out.push(Candle {
                open_time,
                open: parse(&mid["o"]),
                high: parse(&mid["h"]),
                low: parse(&mid["l"]),
                close: parse(&mid["c"]),
                volume: Decimal::from(row["volume"].as_u64().unwrap_or(0)),
            });
        }
        Ok(out)
    }

    // -- orders -------------------------------------------------------------

    #[instrument(skip(self), name = "oanda::market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.submit_order(serde_json::json!({
            "type": "MARKET",
            "instrument": Self::instrument(symbol),
            "units": Self::signed_units(side, qty),
            "timeInForce": "FOK",
            "positionFill": "DEFAULT",
        }))
        .await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.submit_order(serde_json::json!({
            "type": "LIMIT",
            "instrument": Self::instrument(symbol),
            "units": Self::signed_units(side, qty),
            "price": price.normalize().to_string(),
            "timeInForce": "GTC",
        }))
        .await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Option<Decimal>,
    ) -> GatewayResult<OrderAck> {
        if limit_price.is_some() {
            return Err(self.permanent(
                "place_stop_loss",
                "stop-limit legs are not offered on this venue",
            ));
        }
        self.submit_order(serde_json::json!({
            "type": "STOP",
            "instrument": Self::instrument(symbol),
            "units": Self::signed_units(side, qty),
            "price": stop_price.normalize().to_string(),
            "timeInForce": "GTC",
        }))
        .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.submit_order(serde_json::json!({
            "type": "LIMIT",
            "instrument": Self::instrument(symbol),
            "units": Self::signed_units(side, qty),
            "price": price.normalize().to_string(),
            "timeInForce": "GTC",
        }))
        .await
    }

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        trail: TrailSpec,
    ) -> GatewayResult<OrderAck> {
        let distance = match trail {
            TrailSpec::PriceDistance(d) => d,
            TrailSpec::CallbackRatePercent(_) => {
                return Err(self.permanent(
                    "trailing_stop",
                    "venue takes a price distance, not a callback rate",
                ))
            }
        };
        self.submit_order(serde_json::json!({
            "type": "TRAILING_STOP_LOSS",
            "instrument": Self::instrument(symbol),
            "units": Self::signed_units(side, qty),
            "distance": distance.normalize().to_string(),
            "timeInForce": "GTC",
        }))
        .await
    }

    #[instrument(skip(self), name = "oanda::close_position")]
    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        let account = self.account().await?;
        let instrument = Self::instrument(symbol);
        // The close endpoint reduces the named side; it can never flip the
        // position, which is this venue's reduce-only form.
        let body = match side {
            OrderSide::Sell => serde_json::json!({ "longUnits": qty.round().normalize().to_string() }),
            OrderSide::Buy => serde_json::json!({ "shortUnits": qty.round().normalize().to_string() }),
        };
        let resp = self
            .call(
                "oanda::close",
                reqwest::Method::PUT,
                &format!("/v3/accounts/{account}/positions/{instrument}/close"),
                Some(body),
            )
            .await?;

        let fill = resp
            .get("longOrderFillTransaction")
            .filter(|v| !v.is_null())
            .or_else(|| resp.get("shortOrderFillTransaction").filter(|v| !v.is_null()));
        let (order_id, fill_price) = match fill {
            Some(tx) => (
                tx["id"].as_str().unwrap_or("0").to_string(),
                tx["price"].as_str().and_then(|p| p.parse().ok()),
            ),
            None => ("0".to_string(), None),
        };
        Ok(OrderAck {
            order_id,
            status: "FILLED".to_string(),
            fill_price,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GatewayResult<()> {
        let account = self.account().await?;
        self.call(
            "oanda::cancel_order",
            reqwest::Method::PUT,
            &format!("/v3/accounts/{account}/orders/{order_id}/cancel"),
            None,
        )
        .await?;
        Ok(())
    }

    /// On-fill bracket: protective legs ride on the entry order itself, so
    /// all legs are atomic from the gateway's point of view.
    async fn place_bracket_order(&self, spec: &BracketSpec) -> GatewayResult<BracketAck> {
        let mut order = match spec.entry_limit_price {
            Some(price) => serde_json::json!({
                "type": "LIMIT",
                "instrument": Self::instrument(&spec.symbol),
                "units": Self::signed_units(spec.side, spec.qty),
                "price": price.normalize().to_string(),
                "timeInForce": "GTC",
            }),
            None => serde_json::json!({
                "type": "MARKET",
                "instrument": Self::instrument(&spec.symbol),
                "units": Self::signed_units(spec.side, spec.qty),
                "timeInForce": "FOK",
            }),
        };
        if let Some(tp) = spec.take_profit_price {
            order["takeProfitOnFill"] =
                serde_json::json!({ "price": tp.normalize().to_string() });
        }
        if let Some(sl) = spec.stop_loss_price {
            order["stopLossOnFill"] = serde_json::json!({ "price": sl.normalize().to_string() });
        }
        if let Some(TrailSpec::PriceDistance(d)) = spec.trailing {
            order["trailingStopLossOnFill"] =
                serde_json::json!({ "distance": d.normalize().to_string() });
        }

        let ack = self.submit_order(order).await?;
        // Dependent orders are venue-managed; only the entry id comes back.
        Ok(BracketAck {
            entry_order_id: ack.order_id,
            take_profit_order_id: None,
            stop_loss_order_id: None,
        })
    }
}

impl std::fmt::Debug for OandaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OandaAdapter")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("account_id", &self.account_id.read().clone())
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

    #[test]
    fn instrument_mapping_inserts_underscore() {
        assert_eq!(OandaAdapter::instrument("EURUSD"), "EUR_USD");
        assert_eq!(OandaAdapter::instrument("eurusd"), "EUR_USD");
        assert_eq!(OandaAdapter::instrument("EUR_USD"), "EUR_USD");
        assert_eq!(OandaAdapter::instrument("XAUUSD"), "XAU_USD");
    }

    #[test]
    fn intent_symbol_strips_underscore() {
        assert_eq!(OandaAdapter::intent_symbol("EUR_USD"), "EURUSD");
    }

    #[test]
    fn units_carry_direction_sign() {
        assert_eq!(OandaAdapter::signed_units(OrderSide::Buy, dec!(100)), "100");
        assert_eq!(
            OandaAdapter::signed_units(OrderSide::Sell, dec!(100)),
            "-100"
        );
        // Fractional unit counts round to whole units.
        assert_eq!(
            OandaAdapter::signed_units(OrderSide::Buy, dec!(99.6)),
            "100"
        );
    }

    #[test]
    fn capabilities_declare_bracket_not_batch() {
        let adapter = OandaAdapter::new("token", None, true);
        assert!(adapter.capabilities().supports(Capability::Bracket));
        assert!(!adapter
            .capabilities()
            .supports(Capability::EntryWithProtection));
        assert!(!adapter.capabilities().supports(Capability::CancelAll));
    }

    #[test]
    fn debug_redacts_token() {
        let adapter = OandaAdapter::new("sekrit-token", None, true);
        assert!(!format!("{adapter:?}").contains("sekrit"));
    }
}
