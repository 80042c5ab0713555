// =============================================================================
// Kalshi adapter — event contracts, session-token authentication
// =============================================================================
//
// Kalshi authenticates with a short-lived session token acquired through an
// email/password login exchange. The adapter refreshes the token ahead of its
// deadline and, via the transport's renewal hook, performs one forced
// re-login when a request comes back 401.
//
// Direction maps onto contract sides: a long intent buys YES contracts, a
// short intent buys NO contracts; closing sells the held side. Prices are
// quoted in cents on the wire and exposed as dollars here.
//
// Protective orders (stops, take-profits, trailing, brackets) do not exist
// on this venue and fail loudly as unsupported.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::error::{GatewayError, GatewayResult};
use crate::types::Side;

use super::transport::{AuthRenewer, Transport};
use super::{
    BalanceEntry, Candle, Capabilities, Capability, OrderAck, OrderSide, PositionSnapshot,
    SymbolRules, Ticker, TrailSpec, UnsupportedExt, VenueAdapter,
};

const LIVE_URL: &str = "https://trading-api.kalshi.com/trade-api/v2";
const PAPER_URL: &str = "https://demo-api.kalshi.co/trade-api/v2";

/// Session tokens live about half an hour; renew one minute early.
const SESSION_TTL_MINUTES: i64 = 30;
const RENEW_MARGIN_SECONDS: i64 = 60;

struct Session {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Kalshi adapter for a single user's login credentials.
pub struct KalshiAdapter {
    email: String,
    password: String,
    base_url: String,
    transport: Transport,
    capabilities: Capabilities,
    session: RwLock<Option<Session>>,
}

impl KalshiAdapter {
    pub fn new(email: impl Into<String>, password: impl Into<String>, paper: bool) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            base_url: if paper { PAPER_URL } else { LIVE_URL }.to_string(),
            transport: Transport::new("kalshi"),
            capabilities: Capabilities::of(&[
                Capability::MarketOrder,
                Capability::LimitOrder,
            ]),
            session: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------------------

    async fn login(&self) -> GatewayResult<()> {
        let url = format!("{}/login", self.base_url);
        let email = self.email.clone();
        let password = self.password.clone();
        let resp = self
            .transport
            .execute(
                "kalshi::login",
                |client| {
                    client.post(&url).json(&serde_json::json!({
                        "email": email,
                        "password": password,
                    }))
                },
                None,
            )
            .await?;

        let token = resp.body["token"]
            .as_str()
            .ok_or_else(|| self.permanent("login", "no token in login response"))?
            .to_string();

        *self.session.write() = Some(Session {
            token,
            expires_at: Utc::now() + ChronoDuration::minutes(SESSION_TTL_MINUTES),
        });
        debug!("kalshi session established");
        Ok(())
    }

    /// Refresh the session if missing or within the renewal margin of its
    /// deadline, then return the current token.
    async fn ensure_session(&self) -> GatewayResult<String> {
        let fresh = {
            let session = self.session.read();
            match session.as_ref() {
                Some(s)
                    if s.expires_at - Utc::now()
                        > ChronoDuration::seconds(RENEW_MARGIN_SECONDS) =>
                {
                    Some(s.token.clone())
                }
                _ => None,
            }
        };
        if let Some(token) = fresh {
            return Ok(token);
        }

        self.login().await?;
        Ok(self
            .session
            .read()
            .as_ref()
            .map(|s| s.token.clone())
            .unwrap_or_default())
    }

    async fn call(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> GatewayResult<serde_json::Value> {
        let fallback = self.ensure_session().await?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .transport
            .execute(
                operation,
                |client| {
                    // Re-read the token on every attempt — a forced renewal
                    // between attempts replaces the session.
                    let current = self
                        .session
                        .read()
                        .as_ref()
                        .map(|s| s.token.clone())
                        .unwrap_or_else(|| fallback.clone());
                    let mut req = client
                        .request(method.clone(), &url)
                        .header("Authorization", format!("Bearer {current}"));
                    if let Some(body) = &body {
                        req = req.json(body);
                    }
                    req
                },
                Some(self),
            )
            .await?;
        Ok(resp.body)
    }

    fn permanent(&self, operation: &str, message: impl Into<String>) -> GatewayError {
        GatewayError::VenuePermanent {
            venue: "kalshi".to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Contract side implied by an order direction: long buys YES, short
    /// buys NO.
    fn contract_side(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Buy => "yes",
            OrderSide::Sell => "no",
        }
    }

    /// Dollars → integer cents in [1, 99].
    fn to_cents(price: Decimal) -> GatewayResult<i64> {
        let cents = (price * Decimal::ONE_HUNDRED).round();
        let cents: i64 = cents
            .to_string()
            .parse()
            .map_err(|_| GatewayError::input("price", "not representable in cents"))?;
        if !(1..=99).contains(&cents) {
            return Err(GatewayError::input(
                "price",
                format!("contract price {price} outside (0.00, 1.00)"),
            ));
        }
        Ok(cents)
    }

    fn count(qty: Decimal) -> GatewayResult<u64> {
        let rounded = qty.floor();
        let count: u64 = rounded
            .to_string()
            .parse()
            .map_err(|_| GatewayError::input("qty", "contract count must be a whole number"))?;
        if count == 0 {
            return Err(GatewayError::input("qty", "contract count rounds to zero"));
        }
        Ok(count)
    }

    async fn submit_order(
        &self,
        ticker: &str,
        action: &str,
        side: &str,
        count: u64,
        order_type: &str,
        price_cents: Option<i64>,
    ) -> GatewayResult<OrderAck> {
        let mut order = serde_json::json!({
            "ticker": ticker,
            "action": action,
            "side": side,
            "count": count,
            "type": order_type,
            "client_order_id": uuid::Uuid::new_v4().to_string(),
        });
        if let Some(cents) = price_cents {
            let key = if side == "yes" { "yes_price" } else { "no_price" };
            order[key] = cents.into();
        }

        let body = self
            .call(
                "kalshi::place_order",
                reqwest::Method::POST,
                "/portfolio/orders",
                Some(order),
            )
            .await?;
        let order = &body["order"];
        Ok(OrderAck {
            order_id: order["order_id"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            status: order["status"].as_str().unwrap_or("resting").to_string(),
            fill_price: None,
        })
    }
}

#[async_trait]
impl AuthRenewer for KalshiAdapter {
    async fn renew(&self) -> GatewayResult<()> {
        debug!("kalshi forced re-login");
        *self.session.write() = None;
        self.login().await
    }
}

#[async_trait]
impl VenueAdapter for KalshiAdapter {
    fn name(&self) -> &'static str {
        "kalshi"
    }

    fn asset_class(&self) -> &'static str {
        "prediction"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn probe(&self) -> GatewayResult<()> {
        self.ensure_session().await?;
        Ok(())
    }

    // -- account ------------------------------------------------------------

    #[instrument(skip(self), name = "kalshi::get_balance")]
    async fn get_balance(&self) -> GatewayResult<Vec<BalanceEntry>> {
        let body = self
            .call(
                "kalshi::balance",
                reqwest::Method::GET,
                "/portfolio/balance",
                None,
            )
            .await?;
        let cents = body["balance"].as_i64().unwrap_or(0);
        let dollars = Decimal::new(cents, 2);
        Ok(vec![BalanceEntry {
            asset: "USD".to_string(),
            available: dollars,
            total: dollars,
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

    #[instrument(skip(self), name = "kalshi::get_positions")]
    async fn get_positions(&self) -> GatewayResult<Vec<PositionSnapshot>> {
        let body = self
            .call(
                "kalshi::positions",
                reqwest::Method::GET,
                "/portfolio/positions",
                None,
            )
            .await?;
        let rows = body["market_positions"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        Ok(rows
            .iter()
            .filter_map(|row| {
                let position = row["position"].as_i64()?;
                if position == 0 {
                    return None;
                }
                let qty = Decimal::from(position.unsigned_abs());
                // Exposure is total cost in cents; derive an average entry.
                let exposure_cents = row["market_exposure"].as_i64().unwrap_or(0).abs();
                let entry_price = if qty.is_zero() {
                    Decimal::ZERO
                } else {
                    Decimal::new(exposure_cents, 2) / qty
                };
                Some(PositionSnapshot {
                    symbol: row["ticker"].as_str()?.to_string(),
                    // Positive = YES holdings (long), negative = NO (short).
                    side: if position > 0 { Side::Long } else { Side::Short },
                    qty,
                    entry_price,
                    mark_price: None,
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

    #[instrument(skip(self), name = "kalshi::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        let body = self
            .call(
                "kalshi::market",
                reqwest::Method::GET,
                &format!("/markets/{symbol}"),
                None,
            )
            .await?;
        let market = &body["market"];
        let cents = |key: &str| market[key].as_i64().map(|c| Decimal::new(c, 2));
        let last = cents("last_price")
            .or_else(|| cents("yes_bid"))
            .ok_or_else(|| self.permanent("market", "no price in response"))?;
        Ok(Ticker {
            last,
            bid: cents("yes_bid"),
            ask: cents("yes_ask"),
        })
    }

    async fn symbol_rules(&self, _symbol: &str) -> GatewayResult<SymbolRules> {
        // Whole contracts, one-cent price grid.
        Ok(SymbolRules {
            lot_size: Decimal::ONE,
            tick_size: Decimal::new(1, 2),
            min_qty: Decimal::ONE,
        })
    }

    async fn get_candles(&self, _symbol: &str, _limit: u32) -> GatewayResult<Vec<Candle>> {
        Err(self.unsupported("get_candles"))
    }

    // -- orders -------------------------------------------------------------

    #[instrument(skip(self), name = "kalshi::market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.submit_order(
            symbol,
            "buy",
            Self::contract_side(side),
            Self::count(qty)?,
            "market",
            None,
        )
        .await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.submit_order(
            symbol,
            "buy",
            Self::contract_side(side),
            Self::count(qty)?,
            "limit",
            Some(Self::to_cents(price)?),
        )
        .await
    }

    async fn place_stop_loss(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _qty: Decimal,
        _stop_price: Decimal,
        _limit_price: Option<Decimal>,
    ) -> GatewayResult<OrderAck> {
        Err(self.unsupported("place_stop_loss"))
    }

    async fn place_take_profit(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _qty: Decimal,
        _price: Decimal,
    ) -> GatewayResult<OrderAck> {
        Err(self.unsupported("place_take_profit"))
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

    /// Closing sells the held side back to the book.
    #[instrument(skip(self), name = "kalshi::close_position")]
    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        // `side` arrives as the exit direction (opposite of the held side);
        // the held contracts are therefore the opposite side's.
        let held = Self::contract_side(side.opposite());
        self.submit_order(symbol, "sell", held, Self::count(qty)?, "market", None)
            .await
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GatewayResult<()> {
        self.call(
            "kalshi::cancel_order",
            reqwest::Method::DELETE,
            &format!("/portfolio/orders/{order_id}"),
            None,
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for KalshiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalshiAdapter")
            .field("email", &"<redacted>")
            .field("password", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("session_active", &self.session.read().is_some())
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
    fn direction_maps_to_contract_side() {
        assert_eq!(KalshiAdapter::contract_side(OrderSide::Buy), "yes");
        assert_eq!(KalshiAdapter::contract_side(OrderSide::Sell), "no");
    }

    #[test]
    fn cents_conversion_bounds() {
        assert_eq!(KalshiAdapter::to_cents(dec!(0.42)).unwrap(), 42);
        assert_eq!(KalshiAdapter::to_cents(dec!(0.99)).unwrap(), 99);
        assert_eq!(KalshiAdapter::to_cents(dec!(0.01)).unwrap(), 1);
        assert!(KalshiAdapter::to_cents(dec!(0)).is_err());
        assert!(KalshiAdapter::to_cents(dec!(1.00)).is_err());
        assert!(KalshiAdapter::to_cents(dec!(1.50)).is_err());
    }

    #[test]
    fn count_floors_and_rejects_zero() {
        assert_eq!(KalshiAdapter::count(dec!(5)).unwrap(), 5);
        assert_eq!(KalshiAdapter::count(dec!(5.9)).unwrap(), 5);
        assert!(KalshiAdapter::count(dec!(0.4)).is_err());
    }

    #[test]
    fn protective_orders_are_unsupported() {
        let adapter = KalshiAdapter::new("a@b.c", "pw", true);
        assert!(!adapter.capabilities().supports(Capability::StopLoss));
        assert!(!adapter.capabilities().supports(Capability::TakeProfit));
        assert!(!adapter.capabilities().supports(Capability::Bracket));
    }

    #[tokio::test]
    async fn stop_loss_fails_loudly() {
        let adapter = KalshiAdapter::new("a@b.c", "pw", true);
        let err = adapter
            .place_stop_loss("FED-25DEC", OrderSide::Sell, dec!(10), dec!(0.40), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported { .. }));
    }

    #[test]
    fn debug_redacts_login() {
        let adapter = KalshiAdapter::new("user@example.com", "hunter2", true);
        let dbg = format!("{adapter:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("example.com"));
    }
}
