// =============================================================================
// Venue adapters — one uniform contract over heterogeneous broker APIs
// =============================================================================
//
// Every venue implements `VenueAdapter` and declares a capability set. The
// executor plans against capabilities, never against venue names. Operations
// a venue cannot perform natively fail loudly with `Unsupported`; nothing is
// silently simulated.
//
// Adapters own three things the rest of the gateway never sees:
//   1. The authentication scheme (HMAC, bearer, session, OAuth, Ed25519)
//      including renewal.
//   2. Symbol mapping between the intent form (`BTCUSDT`, `EURUSD`, `AAPL`)
//      and the venue-native form.
//   3. Lot/tick rounding: the executor passes unrounded values, the adapter
//      sends the rounded ones.
// =============================================================================

pub mod alpaca;
pub mod aster;
pub mod backpack;
pub mod kalshi;
pub mod oanda;
pub mod registry;
pub mod schwab;
pub mod transport;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::types::Side;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// A single venue capability the executor may branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    MarketOrder,
    LimitOrder,
    StopLoss,
    StopLimit,
    TakeProfit,
    TrailingStop,
    ReduceOnly,
    CancelAll,
    Bracket,
    Oco,
    Oto,
    Fractional,
    /// Atomic entry + take-profit + stop-loss in one venue call.
    EntryWithProtection,
    ExtendedHours,
}

/// The declared capability set of an adapter.
#[derive(Debug, Clone, Default)]
pub struct Capabilities(std::collections::HashSet<Capability>);

impl Capabilities {
    pub fn of(caps: &[Capability]) -> Self {
        Self(caps.iter().copied().collect())
    }

    pub fn supports(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }
}

// ---------------------------------------------------------------------------
// Wire types shared by all adapters
// ---------------------------------------------------------------------------

/// Direction of an individual order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl From<Side> for OrderSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Long => Self::Buy,
            Side::Short => Self::Sell,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// One asset's balance on the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub asset: String,
    pub available: Decimal,
    pub total: Decimal,
}

/// A venue-reported open position, in intent symbol form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Option<Decimal>,
}

/// Latest quote for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub last: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
}

/// Acknowledgement of a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
    /// Fill price when the venue reports one synchronously.
    pub fill_price: Option<Decimal>,
}

/// Trailing-stop parameterisation. Venues take either a callback rate in
/// percent or an absolute price distance; the adapter rejects the form it
/// does not speak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrailSpec {
    CallbackRatePercent(Decimal),
    PriceDistance(Decimal),
}

/// Entry-plus-exits specification consumed by the compound primitives
/// (bracket, atomic batch, OTO).
#[derive(Debug, Clone)]
pub struct BracketSpec {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    /// None = market entry.
    pub entry_limit_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    /// Turns the stop leg into a stop-limit where supported.
    pub stop_limit_price: Option<Decimal>,
    pub trailing: Option<TrailSpec>,
    pub extended_hours: bool,
}

/// Order ids returned by a compound placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketAck {
    pub entry_order_id: String,
    pub take_profit_order_id: Option<String>,
    pub stop_loss_order_id: Option<String>,
}

/// Venue-reported rounding rules for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRules {
    pub lot_size: Decimal,
    pub tick_size: Decimal,
    pub min_qty: Decimal,
}

impl SymbolRules {
    /// Round `qty` down to the venue lot grid.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        round_to_step_floor(qty, self.lot_size)
    }

    /// Round `price` to the nearest tick.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size.is_zero() {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }
}

/// Floor `value` onto a grid of `step`; zero step returns the value as-is.
pub fn round_to_step_floor(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

// ---------------------------------------------------------------------------
// The adapter trait
// ---------------------------------------------------------------------------

/// Uniform operations over one venue for one user's credentials. All calls
/// are network I/O carrying per-call deadlines; transient faults retry with
/// exponential backoff inside the shared transport.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// The venue's wire name (`aster`, `oanda`, …).
    fn name(&self) -> &'static str;

    /// Asset class persisted on positions and trades.
    fn asset_class(&self) -> &'static str;

    fn capabilities(&self) -> &Capabilities;

    /// Cheap reachability check for the health probe.
    async fn probe(&self) -> GatewayResult<()>;

    // -- account ------------------------------------------------------------

    async fn get_balance(&self) -> GatewayResult<Vec<BalanceEntry>>;

    async fn get_available_margin(&self) -> GatewayResult<Decimal>;

    // -- positions ----------------------------------------------------------

    async fn get_positions(&self) -> GatewayResult<Vec<PositionSnapshot>>;

    async fn get_position(&self, symbol: &str) -> GatewayResult<Option<PositionSnapshot>>;

    async fn has_open_position(&self, symbol: &str) -> GatewayResult<bool> {
        Ok(self.get_position(symbol).await?.is_some())
    }

    // -- market data --------------------------------------------------------

    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker>;

    /// Lot/tick rules for `symbol`; used by the executor via the rounding
    /// the adapter applies internally.
    async fn symbol_rules(&self, symbol: &str) -> GatewayResult<SymbolRules>;

    /// Recent one-minute candles, oldest first (AI worker feature input).
    async fn get_candles(&self, symbol: &str, limit: u32) -> GatewayResult<Vec<Candle>>;

    // -- orders -------------------------------------------------------------

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck>;

    /// `limit_price` turns the stop into a stop-limit on venues that
    /// support it; others reject the combination.
    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Option<Decimal>,
    ) -> GatewayResult<OrderAck>;

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<OrderAck>;

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        trail: TrailSpec,
    ) -> GatewayResult<OrderAck>;

    /// Reduce-only where the venue has such a flag.
    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> GatewayResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GatewayResult<()>;

    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<()> {
        let _ = symbol;
        Err(self.unsupported("cancel_all_orders"))
    }

    // -- compound primitives (optional per venue) ----------------------------

    async fn place_bracket_order(&self, spec: &BracketSpec) -> GatewayResult<BracketAck> {
        let _ = spec;
        Err(self.unsupported("place_bracket_order"))
    }

    /// Atomic entry + TP + SL batch, where the venue distinguishes it from
    /// a bracket.
    async fn place_entry_with_protection(&self, spec: &BracketSpec) -> GatewayResult<BracketAck> {
        let _ = spec;
        Err(self.unsupported("place_entry_with_protection"))
    }

    /// One-cancels-other pair of exits for an existing position.
    async fn place_oco_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        take_profit_price: Decimal,
        stop_price: Decimal,
    ) -> GatewayResult<BracketAck> {
        let _ = (symbol, side, qty, take_profit_price, stop_price);
        Err(self.unsupported("place_oco_order"))
    }

    /// Entry that triggers a single exit on fill.
    async fn place_oto_order(&self, spec: &BracketSpec) -> GatewayResult<BracketAck> {
        let _ = spec;
        Err(self.unsupported("place_oto_order"))
    }

    /// Notional-denominated order for venues with fractional support.
    async fn place_fractional_order(
        &self,
        symbol: &str,
        side: OrderSide,
        notional: Decimal,
    ) -> GatewayResult<OrderAck> {
        let _ = (symbol, side, notional);
        Err(self.unsupported("place_fractional_order"))
    }
}

impl std::fmt::Debug for dyn VenueAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueAdapter")
            .field("name", &self.name())
            .finish()
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Encode an option contract in OCC symbology, the form equities venues
/// accept for options orders: `{root}{YYMMDD}{C|P}{strike × 1000, 8 digits}`.
pub fn occ_symbol(
    underlying: &str,
    expiration: chrono::NaiveDate,
    right: crate::intent::OptionRight,
    strike: Decimal,
) -> String {
    use chrono::Datelike;
    let right_char = match right {
        crate::intent::OptionRight::Call => 'C',
        crate::intent::OptionRight::Put => 'P',
    };
    let strike_milli = (strike * Decimal::new(1000, 0))
        .round()
        .mantissa()
        .unsigned_abs();
    format!(
        "{}{:02}{:02}{:02}{}{:08}",
        underlying.to_uppercase(),
        expiration.year() % 100,
        expiration.month(),
        expiration.day(),
        right_char,
        strike_milli
    )
}

/// Blanket helper: build the distinguished unsupported error for `self`.
pub trait UnsupportedExt {
    fn unsupported(&self, operation: &str) -> GatewayError;
}

impl<T: VenueAdapter + ?Sized> UnsupportedExt for T {
    fn unsupported(&self, operation: &str) -> GatewayError {
        GatewayError::Unsupported {
            venue: self.name().to_string(),
            operation: operation.to_string(),
        }
    }
}

// =============================================================================
// Test double
// =============================================================================

/// Scriptable in-memory venue used across the executor, tracker, and worker
/// tests: positions, ticker, and candles are set by the test; every call is
/// recorded; named operations can be made to fail.
#[cfg(test)]
pub mod testing {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;

    use super::*;

    pub struct MockVenue {
        capabilities: Capabilities,
        positions: Mutex<Vec<PositionSnapshot>>,
        ticker: Mutex<Ticker>,
        rules: Mutex<SymbolRules>,
        candles: Mutex<Vec<Candle>>,
        calls: Mutex<Vec<String>>,
        failing: Mutex<HashSet<String>>,
        next_id: AtomicU64,
    }

    impl MockVenue {
        pub fn new() -> Self {
            Self::with_caps(&[
                Capability::MarketOrder,
                Capability::LimitOrder,
                Capability::StopLoss,
                Capability::StopLimit,
                Capability::TakeProfit,
                Capability::TrailingStop,
                Capability::ReduceOnly,
                Capability::CancelAll,
            ])
        }

        pub fn with_caps(caps: &[Capability]) -> Self {
            Self {
                capabilities: Capabilities::of(caps),
                positions: Mutex::new(Vec::new()),
                ticker: Mutex::new(Ticker {
                    last: Decimal::new(50_000, 0),
                    bid: None,
                    ask: None,
                }),
                rules: Mutex::new(SymbolRules {
                    lot_size: Decimal::new(1, 3),
                    tick_size: Decimal::new(1, 1),
                    min_qty: Decimal::new(1, 3),
                }),
                candles: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                failing: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
            }
        }

        pub fn set_positions(&self, positions: Vec<PositionSnapshot>) {
            *self.positions.lock() = positions;
        }

        pub fn set_ticker(&self, last: Decimal) {
            *self.ticker.lock() = Ticker {
                last,
                bid: None,
                ask: None,
            };
        }

        pub fn set_rules(&self, rules: SymbolRules) {
            *self.rules.lock() = rules;
        }

        pub fn set_candles(&self, candles: Vec<Candle>) {
            *self.candles.lock() = candles;
        }

        pub fn fail_on(&self, operation: &str) {
            self.failing.lock().insert(operation.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: String) -> GatewayResult<()> {
            let op = call.split(' ').next().unwrap_or_default().to_string();
            self.calls.lock().push(call);
            if self.failing.lock().contains(&op) {
                return Err(GatewayError::VenuePermanent {
                    venue: "mock".to_string(),
                    operation: op,
                    message: "scripted failure".to_string(),
                });
            }
            Ok(())
        }

        fn ack(&self) -> OrderAck {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            OrderAck {
                order_id: format!("ord-{id}"),
                status: "FILLED".to_string(),
                fill_price: Some(self.ticker.lock().last),
            }
        }
    }

    #[async_trait]
    impl VenueAdapter for MockVenue {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn asset_class(&self) -> &'static str {
            "crypto"
        }

        fn capabilities(&self) -> &Capabilities {
            &self.capabilities
        }

        async fn probe(&self) -> GatewayResult<()> {
            self.record("probe".to_string())
        }

        async fn get_balance(&self) -> GatewayResult<Vec<BalanceEntry>> {
            self.record("get_balance".to_string())?;
            Ok(vec![BalanceEntry {
                asset: "USDT".to_string(),
                available: Decimal::new(10_000, 0),
                total: Decimal::new(10_000, 0),
            }])
        }

        async fn get_available_margin(&self) -> GatewayResult<Decimal> {
            self.record("get_available_margin".to_string())?;
            Ok(Decimal::new(10_000, 0))
        }

        async fn get_positions(&self) -> GatewayResult<Vec<PositionSnapshot>> {
            self.record("get_positions".to_string())?;
            Ok(self.positions.lock().clone())
        }

        async fn get_position(&self, symbol: &str) -> GatewayResult<Option<PositionSnapshot>> {
            self.record(format!("get_position {symbol}"))?;
            Ok(self
                .positions
                .lock()
                .iter()
                .find(|p| p.symbol == symbol)
                .cloned())
        }

        async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
            self.record(format!("get_ticker {symbol}"))?;
            Ok(self.ticker.lock().clone())
        }

        async fn symbol_rules(&self, symbol: &str) -> GatewayResult<SymbolRules> {
            self.record(format!("symbol_rules {symbol}"))?;
            Ok(self.rules.lock().clone())
        }

        async fn get_candles(&self, symbol: &str, _limit: u32) -> GatewayResult<Vec<Candle>> {
            self.record(format!("get_candles {symbol}"))?;
            Ok(self.candles.lock().clone())
        }

        async fn place_market_order(
            &self,
            symbol: &str,
            side: OrderSide,
            qty: Decimal,
        ) -> GatewayResult<OrderAck> {
            self.record(format!("market_order {symbol} {side} {qty}"))?;
            Ok(self.ack())
        }

        async fn place_limit_order(
            &self,
            symbol: &str,
            side: OrderSide,
            qty: Decimal,
            price: Decimal,
        ) -> GatewayResult<OrderAck> {
            self.record(format!("limit_order {symbol} {side} {qty} @{price}"))?;
            Ok(self.ack())
        }

        async fn place_stop_loss(
            &self,
            symbol: &str,
            side: OrderSide,
            qty: Decimal,
            stop_price: Decimal,
            limit_price: Option<Decimal>,
        ) -> GatewayResult<OrderAck> {
            self.record(format!(
                "stop_loss {symbol} {side} {qty} @{stop_price} limit={limit_price:?}"
            ))?;
            Ok(self.ack())
        }

        async fn place_take_profit(
            &self,
            symbol: &str,
            side: OrderSide,
            qty: Decimal,
            price: Decimal,
        ) -> GatewayResult<OrderAck> {
            self.record(format!("take_profit {symbol} {side} {qty} @{price}"))?;
            Ok(self.ack())
        }

        async fn place_trailing_stop(
            &self,
            symbol: &str,
            side: OrderSide,
            qty: Decimal,
            trail: TrailSpec,
        ) -> GatewayResult<OrderAck> {
            self.record(format!("trailing_stop {symbol} {side} {qty} {trail:?}"))?;
            Ok(self.ack())
        }

        async fn close_position(
            &self,
            symbol: &str,
            side: OrderSide,
            qty: Decimal,
        ) -> GatewayResult<OrderAck> {
            self.record(format!("close_position {symbol} {side} {qty}"))?;
            Ok(self.ack())
        }

        async fn cancel_order(&self, symbol: &str, order_id: &str) -> GatewayResult<()> {
            self.record(format!("cancel_order {symbol} {order_id}"))
        }

        async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<()> {
            if !self.capabilities.supports(Capability::CancelAll) {
                return Err(self.unsupported("cancel_all_orders"));
            }
            self.record(format!("cancel_all {symbol}"))
        }

        async fn place_bracket_order(&self, spec: &BracketSpec) -> GatewayResult<BracketAck> {
            if !self.capabilities.supports(Capability::Bracket) {
                return Err(self.unsupported("place_bracket_order"));
            }
            self.record(format!("bracket {} {} {}", spec.symbol, spec.side, spec.qty))?;
            Ok(BracketAck {
                entry_order_id: self.ack().order_id,
                take_profit_order_id: spec.take_profit_price.map(|_| self.ack().order_id),
                stop_loss_order_id: spec.stop_loss_price.map(|_| self.ack().order_id),
            })
        }

        async fn place_entry_with_protection(
            &self,
            spec: &BracketSpec,
        ) -> GatewayResult<BracketAck> {
            if !self.capabilities.supports(Capability::EntryWithProtection) {
                return Err(self.unsupported("place_entry_with_protection"));
            }
            self.record(format!("batch {} {} {}", spec.symbol, spec.side, spec.qty))?;
            Ok(BracketAck {
                entry_order_id: self.ack().order_id,
                take_profit_order_id: spec.take_profit_price.map(|_| self.ack().order_id),
                stop_loss_order_id: spec.stop_loss_price.map(|_| self.ack().order_id),
            })
        }

        async fn place_oto_order(&self, spec: &BracketSpec) -> GatewayResult<BracketAck> {
            if !self.capabilities.supports(Capability::Oto) {
                return Err(self.unsupported("place_oto_order"));
            }
            self.record(format!("oto {} {} {}", spec.symbol, spec.side, spec.qty))?;
            Ok(BracketAck {
                entry_order_id: self.ack().order_id,
                take_profit_order_id: None,
                stop_loss_order_id: spec.stop_loss_price.map(|_| self.ack().order_id),
            })
        }

        async fn place_fractional_order(
            &self,
            symbol: &str,
            side: OrderSide,
            notional: Decimal,
        ) -> GatewayResult<OrderAck> {
            if !self.capabilities.supports(Capability::Fractional) {
                return Err(self.unsupported("place_fractional_order"));
            }
            self.record(format!("fractional {symbol} {side} ${notional}"))?;
            Ok(self.ack())
        }
    }
}
