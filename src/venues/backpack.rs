// =============================================================================
// Backpack adapter — crypto perpetuals, Ed25519 request signing
// =============================================================================
//
// Backpack authenticates asymmetrically: every request carries a detached
// Ed25519 signature over `timestamp ‖ method ‖ path ‖ body`, the base64
// public key in X-API-KEY, and the signature in X-SIGNATURE. The private key
// arrives in the credential record as a base64-encoded 32-byte seed and never
// leaves this module.
//
// Stops and take-profits ride on trigger prices; trailing stops and compound
// order classes are not offered and fail loudly.
// =============================================================================

use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rust_decimal::Decimal;
use tracing::instrument;

use crate::error::{GatewayError, GatewayResult};
use crate::types::Side;

use super::transport::Transport;
use super::{
    BalanceEntry, Candle, Capabilities, Capability, OrderAck, OrderSide, PositionSnapshot,
    SymbolRules, Ticker, TrailSpec, UnsupportedExt, VenueAdapter,
};

const API_URL: &str = "https://api.backpack.exchange";

/// Quote currencies recognised when mapping intent symbols.
const QUOTES: [&str; 4] = ["USDC", "USDT", "BTC", "USD"];

/// Backpack adapter for a single user's signing key.
pub struct BackpackAdapter {
    signing_key: SigningKey,
    public_key_b64: String,
    base_url: String,
    transport: Transport,
    capabilities: Capabilities,
}

impl BackpackAdapter {
    /// Build from the base64-encoded 32-byte Ed25519 seed.
    pub fn new(private_key_b64: &str) -> GatewayResult<Self> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(private_key_b64.trim())
            .map_err(|_| GatewayError::input("private_key", "not valid base64"))?;
        let seed: [u8; 32] = raw
            .try_into()
            .map_err(|_| GatewayError::input("private_key", "expected a 32-byte Ed25519 seed"))?;
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key_b64 = base64::engine::general_purpose::STANDARD
            .encode(signing_key.verifying_key().as_bytes());

        Ok(Self {
            signing_key,
            public_key_b64,
            base_url: API_URL.to_string(),
            transport: Transport::new("backpack"),
            capabilities: Capabilities::of(&[
                Capability::MarketOrder,
                Capability::LimitOrder,
                Capability::StopLoss,
                Capability::TakeProfit,
                Capability::ReduceOnly,
                Capability::CancelAll,
            ]),
        })
    }

    // -------------------------------------------------------------------------
    // Symbol mapping
    // -------------------------------------------------------------------------

    /// Map the intent symbol (`SOLUSDC`) to the venue form (`SOL_USDC`).
    fn venue_symbol(symbol: &str) -> String {
        if symbol.contains('_') {
            return symbol.to_uppercase();
        }
        let upper = symbol.to_uppercase();
        for quote in QUOTES {
            if upper.len() > quote.len() && upper.ends_with(quote) {
                let base = &upper[..upper.len() - quote.len()];
                return format!("{base}_{quote}");
            }
        }
        upper
    }

    fn intent_symbol(venue_symbol: &str) -> String {
        venue_symbol.replace('_', "")
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// Detached signature over `timestamp ‖ method ‖ path ‖ body`, base64.
    fn sign(&self, timestamp: u64, method: &str, path: &str, body: &str) -> String {
        let message = format!("{timestamp}{method}{path}{body}");
        let signature = self.signing_key.sign(message.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    }

    fn timestamp_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    async fn call(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> GatewayResult<serde_json::Value> {
        let body_text = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .transport
            .execute(
                operation,
                |client| {
                    let ts = Self::timestamp_ms();
                    let signature = self.sign(ts, method.as_str(), path, &body_text);
                    let mut req = client
                        .request(method.clone(), &url)
                        .header("X-API-KEY", &self.public_key_b64)
                        .header("X-SIGNATURE", signature)
                        .header("X-TIMESTAMP", ts.to_string());
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
            venue: "backpack".to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    fn venue_side(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Buy => "Bid",
            OrderSide::Sell => "Ask",
        }
    }

    fn order_ack(&self, body: &serde_json::Value) -> OrderAck {
        OrderAck {
            order_id: body["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| body["id"].to_string()),
            status: body["status"].as_str().unwrap_or("New").to_string(),
            fill_price: body["avgFillPrice"].as_str().and_then(|p| p.parse().ok()),
        }
    }

    async fn submit_order(&self, order: serde_json::Value) -> GatewayResult<OrderAck> {
        let body = self
            .call(
                "backpack::place_order",
                reqwest::Method::POST,
                "/api/v1/order",
                Some(order),
            )
            .await?;
        Ok(self.order_ack(&body))
    }

    fn json_decimal(value: &serde_json::Value) -> Option<Decimal> {
        match value {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.to_string().parse().ok(),
            _ => None,
        }
    }
}

#[async_trait]
impl VenueAdapter for BackpackAdapter {
    fn name(&self) -> &'static str {
        "backpack"
    }

    fn asset_class(&self) -> &'static str {
        "crypto"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn probe(&self) -> GatewayResult<()> {
        let url = format!("{}/api/v1/status", self.base_url);
        self.transport
            .execute("backpack::status", |client| client.get(&url), None)
            .await?;
        Ok(())
    }

    // -- account ------------------------------------------------------------

    #[instrument(skip(self), name = "backpack::get_balance")]
    async fn get_balance(&self) -> GatewayResult<Vec<BalanceEntry>> {
        let body = self
            .call("backpack::capital", reqwest::Method::GET, "/api/v1/capital", None)
            .await?;
        let map = body
            .as_object()
            .ok_or_else(|| self.permanent("capital", "expected object response"))?;

        Ok(map
            .iter()
            .filter_map(|(asset, row)| {
                let available = Self::json_decimal(&row["available"])?;
                let locked = Self::json_decimal(&row["locked"]).unwrap_or(Decimal::ZERO);
                Some(BalanceEntry {
                    asset: asset.clone(),
                    available,
                    total: available + locked,
                })
            })
            .collect())
    }

    async fn get_available_margin(&self) -> GatewayResult<Decimal> {
        Ok(self
            .get_balance()
            .await?
            .iter()
            .find(|b| b.asset == "USDC")
            .map(|b| b.available)
            .unwrap_or(Decimal::ZERO))
    }

    // -- positions ----------------------------------------------------------

    #[instrument(skip(self), name = "backpack::get_positions")]
    async fn get_positions(&self) -> GatewayResult<Vec<PositionSnapshot>> {
        let body = self
            .call("backpack::positions", reqwest::Method::GET, "/api/v1/position", None)
            .await?;
        let rows = body.as_array().cloned().unwrap_or_default();

        Ok(rows
            .iter()
            .filter_map(|row| {
                let net = Self::json_decimal(&row["netQuantity"])?;
                if net.is_zero() {
                    return None;
                }
                Some(PositionSnapshot {
                    symbol: Self::intent_symbol(row["symbol"].as_str()?),
                    side: if net > Decimal::ZERO {
                        Side::Long
                    } else {
                        Side::Short
                    },
                    qty: net.abs(),
                    entry_price: Self::json_decimal(&row["entryPrice"]).unwrap_or(Decimal::ZERO),
                    mark_price: Self::json_decimal(&row["markPrice"]),
                })
            })
            .collect())
    }

    async fn get_position(&self, symbol: &str) -> GatewayResult<Option<PositionSnapshot>> {
        let wanted = Self::intent_symbol(&Self::venue_symbol(symbol));
        Ok(self
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == wanted))
    }

    // -- market data --------------------------------------------------------

    #[instrument(skip(self), name = "backpack::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        let venue_symbol = Self::venue_symbol(symbol);
        let url = format!("{}/api/v1/ticker?symbol={venue_symbol}", self.base_url);
        let resp = self
            .transport
            .execute("backpack::ticker", |client| client.get(&url), None)
            .await?;
        let last = Self::json_decimal(&resp.body["lastPrice"])
            .ok_or_else(|| self.permanent("ticker", "no price in response"))?;
        Ok(Ticker {
            last,
            bid: None,
            ask: None,
        })
    }

    async fn symbol_rules(&self, symbol: &str) -> GatewayResult<SymbolRules> {
        let venue_symbol = Self::venue_symbol(symbol);
        let url = format!("{}/api/v1/market?symbol={venue_symbol}", self.base_url);
        let resp = self
            .transport
            .execute("backpack::market", |client| client.get(&url), None)
            .await?;
        let filters = &resp.body["filters"];
        Ok(SymbolRules {
            lot_size: Self::json_decimal(&filters["quantity"]["stepSize"])
                .unwrap_or(Decimal::new(1, 2)),
            tick_size: Self::json_decimal(&filters["price"]["tickSize"])
                .unwrap_or(Decimal::new(1, 2)),
            min_qty: Self::json_decimal(&filters["quantity"]["minQuantity"])
                .unwrap_or(Decimal::ZERO),
        })
    }

    async fn get_candles(&self, symbol: &str, limit: u32) -> GatewayResult<Vec<Candle>> {
        let venue_symbol = Self::venue_symbol(symbol);
        let url = format!(
            "{}/api/v1/klines?symbol={venue_symbol}&interval=1m&limit={limit}",
            self.base_url
        );
        let resp = self
            .transport
            .execute("backpack::klines", |client| client.get(&url), None)
            .await?;
        let rows = resp.body.as_array().cloned().unwrap_or_default();

        Ok(rows
            .iter()
            .map(|row| Candle {
                open_time: row["start"]
                    .as_str()
                    .and_then(|t| t.parse::<chrono::DateTime<chrono::Utc>>().ok())
                    .map(|t| t.timestamp_millis())
                    .unwrap_or_else(|| row["start"].as_i64().unwrap_or(0)),
                open: Self::json_decimal(&row["open"]).unwrap_or(Decimal::ZERO),
                high: Self::json_decimal(&row["high"]).unwrap_or(Decimal::ZERO),
                low: Self::json_decimal(&row["low"]).unwrap_or(Decimal::ZERO),
                close: Self::json_decimal(&row["close"]).unwrap_or(Decimal::ZERO),
                volume: Self::json_decimal(&row["volume"]).unwrap_or(Decimal::ZERO),
            })
            .collect())
    }

    // -- orders -------------------------------------------------------------

    #[instrument(skip(self), name = "backpack::market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        let rules = self.symbol_rules(symbol).await?;
        self.submit_order(serde_json::json!({
            "symbol": Self::venue_symbol(symbol),
            "side": Self::venue_side(side),
            "orderType": "Market",
            "quantity": rules.round_qty(qty).normalize().to_string(),
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
        let rules = self.symbol_rules(symbol).await?;
        self.submit_order(serde_json::json!({
            "symbol": Self::venue_symbol(symbol),
            "side": Self::venue_side(side),
            "orderType": "Limit",
            "quantity": rules.round_qty(qty).normalize().to_string(),
            "price": rules.round_price(price).normalize().to_string(),
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
        let rules = self.symbol_rules(symbol).await?;
        self.submit_order(serde_json::json!({
            "symbol": Self::venue_symbol(symbol),
            "side": Self::venue_side(side),
            "orderType": "Market",
            "quantity": rules.round_qty(qty).normalize().to_string(),
            "triggerPrice": rules.round_price(stop_price).normalize().to_string(),
            "reduceOnly": true,
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
        let rules = self.symbol_rules(symbol).await?;
        self.submit_order(serde_json::json!({
            "symbol": Self::venue_symbol(symbol),
            "side": Self::venue_side(side),
            "orderType": "Limit",
            "quantity": rules.round_qty(qty).normalize().to_string(),
            "price": rules.round_price(price).normalize().to_string(),
            "reduceOnly": true,
            "timeInForce": "GTC",
        }))
        .await
    }

    async fn place_trailing_stop(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _qty: Decimal,
        _trail: TrailSpec,
    ) -> GatewayResult<OrderAck> {
        Err(self.unsupported("place_trailing_stop"))
    }

    #[instrument(skip(self), name = "backpack::close_position")]
    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        let rules = self.symbol_rules(symbol).await?;
        self.submit_order(serde_json::json!({
            "symbol": Self::venue_symbol(symbol),
            "side": Self::venue_side(side),
            "orderType": "Market",
            "quantity": rules.round_qty(qty).normalize().to_string(),
            "reduceOnly": true,
        }))
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GatewayResult<()> {
        self.call(
            "backpack::cancel_order",
            reqwest::Method::DELETE,
            "/api/v1/order",
            Some(serde_json::json!({
                "symbol": Self::venue_symbol(symbol),
                "orderId": order_id,
            })),
        )
        .await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<()> {
        self.call(
            "backpack::cancel_all",
            reqwest::Method::DELETE,
            "/api/v1/orders",
            Some(serde_json::json!({ "symbol": Self::venue_symbol(symbol) })),
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for BackpackAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpackAdapter")
            .field("signing_key", &"<redacted>")
            .field("public_key", &self.public_key_b64)
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
    use ed25519_dalek::Verifier;

    fn adapter() -> BackpackAdapter {
        // Deterministic test seed (32 bytes of 0x01).
        let seed_b64 = base64::engine::general_purpose::STANDARD.encode([1u8; 32]);
        BackpackAdapter::new(&seed_b64).unwrap()
    }

    #[test]
    fn symbol_mapping_splits_on_quote() {
        assert_eq!(BackpackAdapter::venue_symbol("SOLUSDC"), "SOL_USDC");
        assert_eq!(BackpackAdapter::venue_symbol("BTCUSDT"), "BTC_USDT");
        assert_eq!(BackpackAdapter::venue_symbol("SOL_USDC"), "SOL_USDC");
        assert_eq!(BackpackAdapter::intent_symbol("SOL_USDC"), "SOLUSDC");
    }

    #[test]
    fn signature_verifies_against_public_key() {
        let a = adapter();
        let sig_b64 = a.sign(1700000000000, "POST", "/api/v1/order", "{\"q\":1}");
        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(sig_b64)
            .unwrap();
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes.try_into().unwrap());
        let message = format!("{}{}{}{}", 1700000000000u64, "POST", "/api/v1/order", "{\"q\":1}");
        a.signing_key
            .verifying_key()
            .verify(message.as_bytes(), &signature)
            .expect("signature must verify");
    }

    #[test]
    fn signature_binds_method_and_path() {
        let a = adapter();
        let sig_get = a.sign(1, "GET", "/api/v1/capital", "");
        let sig_post = a.sign(1, "POST", "/api/v1/capital", "");
        let sig_other = a.sign(1, "GET", "/api/v1/position", "");
        assert_ne!(sig_get, sig_post);
        assert_ne!(sig_get, sig_other);
    }

    #[test]
    fn rejects_bad_seed() {
        assert!(BackpackAdapter::new("not base64 !!!").is_err());
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(BackpackAdapter::new(&short).is_err());
    }

    #[test]
    fn venue_side_mapping() {
        assert_eq!(BackpackAdapter::venue_side(OrderSide::Buy), "Bid");
        assert_eq!(BackpackAdapter::venue_side(OrderSide::Sell), "Ask");
    }

    #[test]
    fn debug_shows_public_key_only() {
        let dbg = format!("{:?}", adapter());
        assert!(dbg.contains("<redacted>"));
        assert!(dbg.contains("public_key"));
    }
}
