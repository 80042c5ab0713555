// =============================================================================
// Schwab adapter — US equities, OAuth refresh-token authentication
// =============================================================================
//
// The credential record holds a long-lived refresh token plus the OAuth
// client pair. The adapter exchanges it for a short-lived access token,
// refreshes within five minutes of expiry, and performs one forced refresh
// when a request comes back 401.
//
// Order ids are not returned in the placement body; the venue answers 201
// with the id at the tail of the Location header.
//
// Instruction grammar: entries map Sell onto SELL_SHORT, while protective
// and closing legs map Sell onto SELL and Buy onto BUY_TO_COVER.
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
    SymbolRules, Ticker, TrailSpec, VenueAdapter,
};

const API_URL: &str = "https://api.schwabapi.com";

/// Refresh this far ahead of the access token's deadline.
const REFRESH_MARGIN_MINUTES: i64 = 5;

struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Schwab adapter for a single user's OAuth credential.
pub struct SchwabAdapter {
    refresh_token: String,
    client_id: String,
    client_secret: String,
    base_url: String,
    transport: Transport,
    capabilities: Capabilities,
    access: RwLock<Option<AccessToken>>,
    /// Hashed account id, discovered on first use.
    account_hash: RwLock<Option<String>>,
}

impl SchwabAdapter {
    pub fn new(
        refresh_token: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            base_url: API_URL.to_string(),
            transport: Transport::new("schwab"),
            capabilities: Capabilities::of(&[
                Capability::MarketOrder,
                Capability::LimitOrder,
                Capability::StopLoss,
                Capability::StopLimit,
                Capability::TakeProfit,
                Capability::TrailingStop,
            ]),
            access: RwLock::new(None),
            account_hash: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // OAuth lifecycle
    // -------------------------------------------------------------------------

    async fn refresh_access_token(&self) -> GatewayResult<()> {
        let url = format!("{}/v1/oauth/token", self.base_url);
        let resp = self
            .transport
            .execute(
                "schwab::token",
                |client| {
                    client
                        .post(&url)
                        .basic_auth(&self.client_id, Some(&self.client_secret))
                        .form(&[
                            ("grant_type", "refresh_token"),
                            ("refresh_token", self.refresh_token.as_str()),
                        ])
                },
                None,
            )
            .await?;

        let token = resp.body["access_token"]
            .as_str()
            .ok_or_else(|| self.permanent("token", "no access_token in response"))?
            .to_string();
        let expires_in = resp.body["expires_in"].as_i64().unwrap_or(1800);

        *self.access.write() = Some(AccessToken {
            token,
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in),
        });
        debug!(expires_in, "schwab access token refreshed");
        Ok(())
    }

    /// Return a live access token, refreshing inside the margin window.
    async fn ensure_token(&self) -> GatewayResult<String> {
        let fresh = {
            let access = self.access.read();
            match access.as_ref() {
                Some(t)
                    if t.expires_at - Utc::now()
                        > ChronoDuration::minutes(REFRESH_MARGIN_MINUTES) =>
                {
                    Some(t.token.clone())
                }
                _ => None,
            }
        };
        if let Some(token) = fresh {
            return Ok(token);
        }
        self.refresh_access_token().await?;
        Ok(self
            .access
            .read()
            .as_ref()
            .map(|t| t.token.clone())
            .unwrap_or_default())
    }

    async fn call(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> GatewayResult<super::transport::VenueResponse> {
        let fallback = self.ensure_token().await?;
        let url = format!("{}{}", self.base_url, path);
        self.transport
            .execute(
                operation,
                |client| {
                    let current = self
                        .access
                        .read()
                        .as_ref()
                        .map(|t| t.token.clone())
                        .unwrap_or_else(|| fallback.clone());
                    let mut req = client
                        .request(method.clone(), &url)
                        .bearer_auth(current);
                    if let Some(body) = &body {
                        req = req.json(body);
                    }
                    req
                },
                Some(self),
            )
            .await
    }

    async fn account(&self) -> GatewayResult<String> {
        if let Some(hash) = self.account_hash.read().clone() {
            return Ok(hash);
        }
        let resp = self
            .call(
                "schwab::account_numbers",
                reqwest::Method::GET,
                "/trader/v1/accounts/accountNumbers",
                None,
            )
            .await?;
        let hash = resp.body
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|a| a["hashValue"].as_str())
            .ok_or_else(|| self.permanent("account_numbers", "no account on token"))?
            .to_string();
        debug!("schwab account hash discovered");
        *self.account_hash.write() = Some(hash.clone());
        Ok(hash)
    }

    fn permanent(&self, operation: &str, message: impl Into<String>) -> GatewayError {
        GatewayError::VenuePermanent {
            venue: "schwab".to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// The order id is the final path segment of the Location header.
    fn order_id_from_location(location: Option<&str>) -> Option<String> {
        location
            .and_then(|l| l.rsplit('/').next())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn entry_instruction(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL_SHORT",
        }
    }

    fn exit_instruction(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Sell => "SELL",
            OrderSide::Buy => "BUY_TO_COVER",
        }
    }

    fn order_body(
        symbol: &str,
        instruction: &str,
        qty: Decimal,
        order_type: &str,
        price: Option<Decimal>,
        stop_price: Option<Decimal>,
    ) -> serde_json::Value {
        let mut order = serde_json::json!({
            "orderType": order_type,
            "session": "NORMAL",
            "duration": "GOOD_TILL_CANCEL",
            "orderStrategyType": "SINGLE",
            "orderLegCollection": [{
                "instruction": instruction,
                "quantity": qty.round().normalize().to_string(),
                "instrument": { "symbol": symbol, "assetType": "EQUITY" },
            }],
        });
        if let Some(price) = price {
            order["price"] = price.round_dp(2).normalize().to_string().into();
        }
        if let Some(stop) = stop_price {
            order["stopPrice"] = stop.round_dp(2).normalize().to_string().into();
        }
        order
    }

    async fn submit_order(&self, order: serde_json::Value) -> GatewayResult<OrderAck> {
        let account = self.account().await?;
        let resp = self
            .call(
                "schwab::place_order",
                reqwest::Method::POST,
                &format!("/trader/v1/accounts/{account}/orders"),
                Some(order),
            )
            .await?;
        let order_id = Self::order_id_from_location(resp.location.as_deref())
            .ok_or_else(|| self.permanent("place_order", "no order id in Location header"))?;
        Ok(OrderAck {
            order_id,
            status: "accepted".to_string(),
            fill_price: None,
        })
    }
}

#[async_trait]
impl AuthRenewer for SchwabAdapter {
    async fn renew(&self) -> GatewayResult<()> {
        debug!("schwab forced token refresh");
        *self.access.write() = None;
        self.refresh_access_token().await
    }
}

#[async_trait]
impl VenueAdapter for SchwabAdapter {
    fn name(&self) -> &'static str {
        "schwab"
    }

    fn asset_class(&self) -> &'static str {
        "equity"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn probe(&self) -> GatewayResult<()> {
        self.account().await?;
        Ok(())
    }

    // -- account ------------------------------------------------------------

    #[instrument(skip(self), name = "schwab::get_balance")]
    async fn get_balance(&self) -> GatewayResult<Vec<BalanceEntry>> {
        let account = self.account().await?;
        let resp = self
            .call(
                "schwab::account",
                reqwest::Method::GET,
                &format!("/trader/v1/accounts/{account}"),
                None,
            )
            .await?;
        let balances = &resp.body["securitiesAccount"]["currentBalances"];
        let get = |key: &str| -> Decimal {
            balances[key]
                .as_f64()
                .map(|v| v.to_string())
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO)
        };
        Ok(vec![BalanceEntry {
            asset: "USD".to_string(),
            available: get("cashBalance"),
            total: get("liquidationValue"),
        }])
    }

    async fn get_available_margin(&self) -> GatewayResult<Decimal> {
        let account = self.account().await?;
        let resp = self
            .call(
                "schwab::account",
                reqwest::Method::GET,
                &format!("/trader/v1/accounts/{account}"),
                None,
            )
            .await?;
        Ok(resp.body["securitiesAccount"]["currentBalances"]["buyingPower"]
            .as_f64()
            .map(|v| v.to_string())
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO))
    }

    // -- positions ----------------------------------------------------------

    #[instrument(skip(self), name = "schwab::get_positions")]
    async fn get_positions(&self) -> GatewayResult<Vec<PositionSnapshot>> {
        let account = self.account().await?;
        let resp = self
            .call(
                "schwab::positions",
                reqwest::Method::GET,
                &format!("/trader/v1/accounts/{account}?fields=positions"),
                None,
            )
            .await?;
        let rows = resp.body["securitiesAccount"]["positions"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        Ok(rows
            .iter()
            .filter_map(|row| {
                let long_qty = row["longQuantity"].as_f64().unwrap_or(0.0);
                let short_qty = row["shortQuantity"].as_f64().unwrap_or(0.0);
                let (side, qty) = if long_qty > 0.0 {
                    (Side::Long, long_qty)
                } else if short_qty > 0.0 {
                    (Side::Short, short_qty)
                } else {
                    return None;
                };
                Some(PositionSnapshot {
                    symbol: row["instrument"]["symbol"].as_str()?.to_string(),
                    side,
                    qty: qty.to_string().parse().ok()?,
                    entry_price: row["averagePrice"]
                        .as_f64()
                        .map(|v| v.to_string())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(Decimal::ZERO),
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

    #[instrument(skip(self), name = "schwab::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        let resp = self
            .call(
                "schwab::quotes",
                reqwest::Method::GET,
                &format!("/marketdata/v1/quotes?symbols={symbol}"),
                None,
            )
            .await?;
        let quote = &resp.body[symbol]["quote"];
        let get = |key: &str| -> Option<Decimal> {
            quote[key]
                .as_f64()
                .map(|v| v.to_string())
                .and_then(|s| s.parse().ok())
        };
        let last = get("lastPrice")
            .ok_or_else(|| self.permanent("quotes", "no last price in response"))?;
        Ok(Ticker {
            last,
            bid: get("bidPrice"),
            ask: get("askPrice"),
        })
    }

    async fn symbol_rules(&self, _symbol: &str) -> GatewayResult<SymbolRules> {
        Ok(SymbolRules {
            lot_size: Decimal::ONE,
            tick_size: Decimal::new(1, 2),
            min_qty: Decimal::ONE,
        })
    }

    async fn get_candles(&self, symbol: &str, limit: u32) -> GatewayResult<Vec<Candle>> {
        let resp = self
            .call(
                "schwab::price_history",
                reqwest::Method::GET,
                &format!(
                    "/marketdata/v1/pricehistory?symbol={symbol}&periodType=day&period=1&frequencyType=minute&frequency=1"
                ),
                None,
            )
            .await?;
        let rows = resp.body["candles"].as_array().cloned().unwrap_or_default();

        let mut out: Vec<Candle> = rows
            .iter()
            .map(|row| {
                let get = |key: &str| -> Decimal {
                    row[key]
                        .as_f64()
                        .map(|v| v.to_string())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(Decimal::ZERO)
                };
                Candle {
                    open_time: row["datetime"].as_i64().unwrap_or(0),
                    open: get("open"),
                    high: get("high"),
                    low: get("low"),
                    close: get("close"),
                    volume: get("volume"),
                }
            })
            .collect();
        if out.len() > limit as usize {
            out.drain(..out.len() - limit as usize);
        }
        Ok(out)
    }

    // -- orders -------------------------------------------------------------

    #[instrument(skip(self), name = "schwab::market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.submit_order(Self::order_body(
            symbol,
            Self::entry_instruction(side),
            qty,
            "MARKET",
            None,
            None,
        ))
        .await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.submit_order(Self::order_body(
            symbol,
            Self::entry_instruction(side),
            qty,
            "LIMIT",
            Some(price),
            None,
        ))
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
        let (order_type, price) = match limit_price {
            Some(limit) => ("STOP_LIMIT", Some(limit)),
            None => ("STOP", None),
        };
        self.submit_order(Self::order_body(
            symbol,
            Self::exit_instruction(side),
            qty,
            order_type,
            price,
            Some(stop_price),
        ))
        .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.submit_order(Self::order_body(
            symbol,
            Self::exit_instruction(side),
            qty,
            "LIMIT",
            Some(price),
            None,
        ))
        .await
    }

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        trail: TrailSpec,
    ) -> GatewayResult<OrderAck> {
        let mut order = Self::order_body(
            symbol,
            Self::exit_instruction(side),
            qty,
            "TRAILING_STOP",
            None,
            None,
        );
        match trail {
            TrailSpec::CallbackRatePercent(pct) => {
                order["stopPriceLinkBasis"] = "MARK".into();
                order["stopPriceLinkType"] = "PERCENT".into();
                order["stopPriceOffset"] = pct.normalize().to_string().into();
            }
            TrailSpec::PriceDistance(d) => {
                order["stopPriceLinkBasis"] = "MARK".into();
                order["stopPriceLinkType"] = "VALUE".into();
                order["stopPriceOffset"] = d.normalize().to_string().into();
            }
        }
        self.submit_order(order).await
    }

    #[instrument(skip(self), name = "schwab::close_position")]
    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck> {
        self.submit_order(Self::order_body(
            symbol,
            Self::exit_instruction(side),
            qty,
            "MARKET",
            None,
            None,
        ))
        .await
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GatewayResult<()> {
        let account = self.account().await?;
        self.call(
            "schwab::cancel_order",
            reqwest::Method::DELETE,
            &format!("/trader/v1/accounts/{account}/orders/{order_id}"),
            None,
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for SchwabAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchwabAdapter")
            .field("refresh_token", &"<redacted>")
            .field("client_id", &"<redacted>")
            .field("client_secret", &"<redacted>")
            .field("token_cached", &self.access.read().is_some())
            .finish()
    }
}
