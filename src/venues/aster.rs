// =============================================================================
// Aster adapter — USDⓈ-margined perpetuals, HMAC-SHA256 signed requests
// =============================================================================
//
// Aster speaks a Binance-futures-style REST dialect: signed endpoints take a
// canonical query string with `timestamp` and `recvWindow`, signed with
// HMAC-SHA256 of the secret, and the API key travels in the X-MBX-APIKEY
// header.
//
// SECURITY: the secret key is used exclusively for signing and never leaves
// this module; the Debug impl redacts both credential fields.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::types::Side;

use super::transport::Transport;
use super::{
    BalanceEntry, BracketAck, BracketSpec, Candle, Capabilities, Capability, OrderAck, OrderSide,
    PositionSnapshot, SymbolRules, Ticker, TrailSpec, VenueAdapter,
};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const LIVE_URL: &str = "https://fapi.asterdex.com";
const PAPER_URL: &str = "https://testnet.asterdex.com";

/// Aster perpetuals adapter for a single user's credentials.
pub struct AsterAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    transport: Transport,
    capabilities: Capabilities,
    /// Lot/tick rules cached per symbol; exchange metadata changes rarely.
    rules: RwLock<HashMap<String, SymbolRules>>,
}

impl AsterAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, paper: bool) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: if paper { PAPER_URL } else { LIVE_URL }.to_string(),
            transport: Transport::new("aster"),
            capabilities: Capabilities::of(&[
                Capability::MarketOrder,
                Capability::LimitOrder,
                Capability::StopLoss,
                Capability::StopLimit,
                Capability::TakeProfit,
                Capability::TrailingStop,
                Capability::ReduceOnly,
                Capability::CancelAll,
                Capability::EntryWithProtection,
            ]),
            rules: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Append timestamp, recvWindow, and the signature to `params`.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn signed_call(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        params: String,
    ) -> GatewayResult<serde_json::Value> {
        let resp = self
            .transport
            .execute(
                operation,
                |client| {
                    let qs = self.signed_query(&params);
                    let url = format!("{}{}?{}", self.base_url, path, qs);
                    client
                        .request(method.clone(), &url)
                        .header("X-MBX-APIKEY", &self.api_key)
                },
                None,
            )
            .await?;
        Ok(resp.body)
    }

    async fn public_call(&self, operation: &str, path_and_query: &str) -> GatewayResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let resp = self
            .transport
            .execute(operation, |client| client.get(&url), None)
            .await?;
        Ok(resp.body)
    }

    // -------------------------------------------------------------------------
    // Rounding rules
    // -------------------------------------------------------------------------

    async fn rules_for(&self, symbol: &str) -> GatewayResult<SymbolRules> {
        if let Some(rules) = self.rules.read().get(symbol) {
            return Ok(rules.clone());
        }

        let info = self
            .public_call(
                "aster::exchange_info",
                &format!("/fapi/v1/exchangeInfo?symbol={symbol}"),
            )
            .await?;

        let entry = info["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| self.permanent("exchange_info", "symbol not found"))?;

        let mut rules = SymbolRules {
            lot_size: Decimal::ONE,
            tick_size: Decimal::ZERO,
            min_qty: Decimal::ZERO,
        };
        if let Some(filters) = entry["filters"].as_array() {
            for filter in filters {
                match filter["filterType"].as_str() {
                    Some("LOT_SIZE") => {
                        rules.lot_size = json_decimal(&filter["stepSize"]).unwrap_or(Decimal::ONE);
                        rules.min_qty = json_decimal(&filter["minQty"]).unwrap_or(Decimal::ZERO);
                    }
                    Some("PRICE_FILTER") => {
                        rules.tick_size = json_decimal(&filter["tickSize"]).unwrap_or(Decimal::ZERO);
                    }
                    _ => {}
                }
            }
        }

        self.rules
            .write()
            .insert(symbol.to_string(), rules.clone());
        debug!(symbol, lot = %rules.lot_size, tick = %rules.tick_size, "symbol rules cached");
        Ok(rules)
    }

    fn permanent(&self, operation: &str, message: impl Into<String>) -> GatewayError {
        GatewayError::VenuePermanent {
            venue: "aster".to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    fn order_ack(&self, body: &serde_json::Value) -> OrderAck {
        OrderAck {
            order_id: body["orderId"]
                .as_u64()
                .map(|id| id.to_string())
                .unwrap_or_else(|| body["orderId"].to_string()),
            status: body["status"].as_str().unwrap_or("NEW").to_string(),
            fill_price: json_decimal(&body["avgPrice"]).filter(|p| !p.is_zero()),
        }
    }

    /// Build one order's parameter string, rounding qty/price per the
    /// venue's lot and tick rules.
    async fn order_params(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: &str,
        qty: Option<Decimal>,
        price: Option<Decimal>,
        stop_price: Option<Decimal>,
        callback_rate: Option<Decimal>,
        reduce_only: bool,
    ) -> GatewayResult<String> {
        let rules = self.rules_for(symbol).await?;
        let mut params = format!(
            "symbol={symbol}&side={}&type={order_type}",
            wire_side(side)
        );
        if let Some(qty) = qty {
            let rounded = rules.round_qty(qty);
            if rounded < rules.min_qty || rounded.is_zero() {
                return Err(self.permanent(
                    "order",
                    format!("quantity {qty} rounds below the venue minimum"),
                ));
            }
            params.push_str(&format!("&quantity={}", rounded.normalize()));
        }
        if let Some(price) = price {
            params.push_str(&format!(
                "&price={}&timeInForce=GTC",
                rules.round_price(price).normalize()
            ));
        }
        if let Some(stop) = stop_price {
            params.push_str(&format!("&stopPrice={}", rules.round_price(stop).normalize()));
        }
        if let Some(rate) = callback_rate {
            params.push_str(&format!("&callbackRate={}", rate.normalize()));
        }
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }
        Ok(params)
    }
}

#[async_trait]
impl VenueAdapter for AsterAdapter {
    fn name(&self) -> &'static str {
        "aster"
    }

    fn asset_class(&self) -> &'static str {
        "crypto"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn probe(&self) -> GatewayResult<()> {
        self.public_call("aster::ping", "/fapi/v1/ping").await?;
        Ok(())
    }

    // -- account ------------------------------------------------------------

    #[instrument(skip(self), name = "aster::get_balance")]
    async fn get_balance(&self) -> GatewayResult<Vec<BalanceEntry>> {
        let body = self
            .signed_call("aster::balance", reqwest::Method::GET, "/fapi/v2/balance", String::new())
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| self.permanent("balance", "expected array response"))?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let asset = row["asset"].as_str()?.to_string();
                let total = json_decimal(&row["balance"])?;
                let available = json_decimal(&row["availableBalance"]).unwrap_or(total);
                Some(BalanceEntry {
                    asset,
                    available,
                    total,
                })
            })
            .collect())
    }

    async fn get_available_margin(&self) -> GatewayResult<Decimal> {
        let balances = self.get_balance().await?;
        Ok(balances
            .iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.available)
            .unwrap_or(Decimal::ZERO))
    }

    // -- positions ----------------------------------------------------------

    #[instrument(skip(self), name = "aster::get_positions")]
    async fn get_positions(&self) -> GatewayResult<Vec<PositionSnapshot>> {
        let body = self
            .signed_call(
                "aster::position_risk",
                reqwest::Method::GET,
                "/fapi/v2/positionRisk",
                String::new(),
            )
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| self.permanent("position_risk", "expected array response"))?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let amt = json_decimal(&row["positionAmt"])?;
                if amt.is_zero() {
                    return None;
                }
                Some(PositionSnapshot {
                    symbol: row["symbol"].as_str()?.to_string(),
                    side: if amt > Decimal::ZERO {
                        Side::Long
                    } else {
                        Side::Short
                    },
                    qty: amt.abs(),
                    entry_price: json_decimal(&row["entryPrice"]).unwrap_or(Decimal::ZERO),
                    mark_price: json_decimal(&row["markPrice"]),
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

    #[instrument(skip(self), name = "aster::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        let body = self
            .public_call(
                "aster::book_ticker",
                &format!("/fapi/v1/ticker/bookTicker?symbol={symbol}"),
            )
            .await?;
        let bid = json_decimal(&body["bidPrice"]);
        let ask = json_decimal(&body["askPrice"]);
        let last = match (bid, ask) {
            (Some(b), Some(a)) => (b + a) / Decimal::TWO,
            _ => {
                let px = self
                    .public_call(
                        "aster::ticker_price",
                        &format!("/fapi/v1/ticker/price?symbol={symbol}"),
                    )
                    .await?;
                json_decimal(&px["price"])
                    .ok_or_else(|| self.permanent("ticker", "no price in response"))?
            }
        };
        Ok(Ticker { last, bid, ask })
    }

    async fn symbol_rules(&self, symbol: &str) -> GatewayResult<SymbolRules> {
        self.rules_for(symbol).await
    }

    async fn get_candles(&self, symbol: &str, limit: u32) -> GatewayResult<Vec<Candle>> {
        let body = self
            .public_call(
                "aster::klines",
                &format!("/fapi/v1/klines?symbol={symbol}&interval=1m&limit={limit}"),
            )
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| self.permanent("klines", "expected array response"))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let arr = match row.as_array() {
                Some(arr) if arr.len() >= 6 => arr,
                _ => {
                    warn!(symbol, "skipping malformed kline entry");
                    continue;
                }
            };
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: json_decimal(&arr[1]).unwrap_or(Decimal::ZERO),
                high: json_decimal(&arr[2]).unwrap_or(Decimal::ZERO),
                low: json_decimal(&arr[3]).unwrap_or(Decimal::ZERO),
                close: json_decimal(&arr[4]).unwrap_or(Decimal::ZERO),
                volume: json_decimal(&arr[5]).unwrap_or(Decimal::ZERO),
            });
        }
        Ok(candles)
    }

    // -- orders -------------------------------------------------------------

    #[instrument(skip(self), name = "aster::market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        let params = self
            .order_params(symbol, side, "MARKET", Some(qty), None, None, None, false)
            .await?;
        let body = self
            .signed_call("aster::place_order", reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(self.order_ack(&body))
    }

    #[instrument(skip(self), name = "aster::limit_order")]
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck> {
        let params = self
            .order_params(symbol, side, "LIMIT", Some(qty), Some(price), None, None, false)
            .await?;
        let body = self
            .signed_call("aster::place_order", reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(self.order_ack(&body))
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Option<Decimal>,
    ) -> GatewayResult<OrderAck> {
        // STOP = stop-limit, STOP_MARKET = plain stop.
        let (order_type, price) = match limit_price {
            Some(limit) => ("STOP", Some(limit)),
            None => ("STOP_MARKET", None),
        };
        let params = self
            .order_params(
                symbol,
                side,
                order_type,
                Some(qty),
                price,
                Some(stop_price),
                None,
                true,
            )
            .await?;
        let body = self
            .signed_call("aster::place_stop", reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(self.order_ack(&body))
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck> {
        let params = self
            .order_params(
                symbol,
                side,
                "TAKE_PROFIT_MARKET",
                Some(qty),
                None,
                Some(price),
                None,
                true,
            )
            .await?;
        let body = self
            .signed_call("aster::place_tp", reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(self.order_ack(&body))
    }

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        trail: TrailSpec,
    ) -> GatewayResult<OrderAck> {
        let rate = match trail {
            TrailSpec::CallbackRatePercent(rate) => rate,
            TrailSpec::PriceDistance(_) => {
                return Err(self.permanent(
                    "trailing_stop",
                    "venue takes a callback rate, not a price distance",
                ))
            }
        };
        let params = self
            .order_params(
                symbol,
                side,
                "TRAILING_STOP_MARKET",
                Some(qty),
                None,
                None,
                Some(rate),
                true,
            )
            .await?;
        let body = self
            .signed_call("aster::place_trailing", reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(self.order_ack(&body))
    }

    #[instrument(skip(self), name = "aster::close_position")]
    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        let params = self
            .order_params(symbol, side, "MARKET", Some(qty), None, None, None, true)
            .await?;
        let body = self
            .signed_call("aster::close", reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(self.order_ack(&body))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GatewayResult<()> {
        self.signed_call(
            "aster::cancel_order",
            reqwest::Method::DELETE,
            "/fapi/v1/order",
            format!("symbol={symbol}&orderId={order_id}"),
        )
        .await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<()> {
        self.signed_call(
            "aster::cancel_all",
            reqwest::Method::DELETE,
            "/fapi/v1/allOpenOrders",
            format!("symbol={symbol}"),
        )
        .await?;
        Ok(())
    }

    /// Atomic entry + TP + SL via the batch-orders endpoint: all three legs
    /// land in one signed request.
    async fn place_entry_with_protection(&self, spec: &BracketSpec) -> GatewayResult<BracketAck> {
        let rules = self.rules_for(&spec.symbol).await?;
        let qty = rules.round_qty(spec.qty);
        if qty.is_zero() {
            return Err(self.permanent("batch", "quantity rounds to zero"));
        }
        let exit_side = spec.side.opposite();

        let mut legs = Vec::new();
        let entry = match spec.entry_limit_price {
            Some(price) => serde_json::json!({
                "symbol": spec.symbol,
                "side": wire_side(spec.side),
                "type": "LIMIT",
                "quantity": qty.normalize().to_string(),
                "price": rules.round_price(price).normalize().to_string(),
                "timeInForce": "GTC",
            }),
            None => serde_json::json!({
                "symbol": spec.symbol,
                "side": wire_side(spec.side),
                "type": "MARKET",
                "quantity": qty.normalize().to_string(),
            }),
        };
        legs.push(entry);

        if let Some(tp) = spec.take_profit_price {
            legs.push(serde_json::json!({
                "symbol": spec.symbol,
                "side": wire_side(exit_side),
                "type": "TAKE_PROFIT_MARKET",
                "quantity": qty.normalize().to_string(),
                "stopPrice": rules.round_price(tp).normalize().to_string(),
                "reduceOnly": "true",
            }));
        }
        if let Some(sl) = spec.stop_loss_price {
            let mut leg = serde_json::json!({
                "symbol": spec.symbol,
                "side": wire_side(exit_side),
                "type": "STOP_MARKET",
                "quantity": qty.normalize().to_string(),
                "stopPrice": rules.round_price(sl).normalize().to_string(),
                "reduceOnly": "true",
            });
            if let Some(limit) = spec.stop_limit_price {
                leg["type"] = "STOP".into();
                leg["price"] = rules.round_price(limit).normalize().to_string().into();
                leg["timeInForce"] = "GTC".into();
            }
            legs.push(leg);
        }

        let batch = serde_json::to_string(&legs)
            .map_err(|e| self.permanent("batch", format!("encode failed: {e}")))?;
        let params = format!("batchOrders={}", batch_encode(&batch));
        let body = self
            .signed_call(
                "aster::batch_orders",
                reqwest::Method::POST,
                "/fapi/v1/batchOrders",
                params,
            )
            .await?;

        let acks = body
            .as_array()
            .ok_or_else(|| self.permanent("batch", "expected array response"))?;
        let mut ids = acks.iter().map(|a| self.order_ack(a).order_id);

        let entry_order_id = ids
            .next()
            .ok_or_else(|| self.permanent("batch", "empty batch response"))?;
        let take_profit_order_id = spec.take_profit_price.and_then(|_| ids.next());
        let stop_loss_order_id = spec.stop_loss_price.and_then(|_| ids.next());

        Ok(BracketAck {
            entry_order_id,
            take_profit_order_id,
            stop_loss_order_id,
        })
    }
}

fn wire_side(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

/// Percent-encode a batch payload for the query string.
fn batch_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 2);
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Parse a JSON value that may be either a string or a number into `Decimal`.
fn json_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

impl std::fmt::Debug for AsterAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsterAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
