// =============================================================================
// Position tracker — in-process map of open positions per (user, venue, symbol)
// =============================================================================
//
// The tracker is authoritative for adjunct metadata the venue does not retain
// (protective-order ids, stop kind, trailing parameters, strategy id); the
// venue is authoritative for current size and mark price. Reconciliation
// replaces the tracked set for one (user, venue) from the venue snapshot,
// carrying the adjunct metadata across for symbols that survive.
//
// Invariant: at most one tracked position per (user, venue, symbol).
//
// Thread-safety: the whole map sits behind one parking_lot::RwLock; accesses
// are short and never held across await points.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::GatewayResult;
use crate::types::{Side, StopKind};
use crate::venues::{TrailSpec, VenueAdapter};

/// Map key: (user, venue, symbol).
pub type PositionKey = (String, String, String);

/// One tracked open position, including the protective-order metadata the
/// venue will not give back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub user_id: String,
    pub venue: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub position_size_usd: Decimal,
    pub entry_order_id: Option<String>,
    pub stop_loss_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub stop_kind: StopKind,
    pub trailing: Option<TrailSpec>,
    pub asset_class: String,
    pub strategy_id: Option<String>,
}

impl TrackedPosition {
    pub fn key(&self) -> PositionKey {
        (
            self.user_id.clone(),
            self.venue.clone(),
            self.symbol.clone(),
        )
    }
}

/// Summary row for the positions probe (no credential data).
#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub user_id: String,
    pub venue: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub strategy_id: Option<String>,
}

/// Thread-safe tracker owning the in-process position set.
#[derive(Default)]
pub struct PositionTracker {
    positions: RwLock<HashMap<PositionKey, TrackedPosition>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Basic operations
    // -------------------------------------------------------------------------

    /// Insert a freshly opened position. Replacing an existing entry for the
    /// same key is a bug upstream and is logged loudly before overwriting.
    pub fn add(&self, position: TrackedPosition) {
        let key = position.key();
        let mut positions = self.positions.write();
        if positions.contains_key(&key) {
            warn!(
                user_id = %key.0,
                venue = %key.1,
                symbol = %key.2,
                "tracker already held a position for this key — overwriting"
            );
        }
        info!(
            user_id = %position.user_id,
            venue = %position.venue,
            symbol = %position.symbol,
            side = %position.side,
            qty = %position.qty,
            entry_price = %position.entry_price,
            "position tracked"
        );
        positions.insert(key, position);
    }

    pub fn get(&self, user_id: &str, venue: &str, symbol: &str) -> Option<TrackedPosition> {
        self.positions
            .read()
            .get(&key_of(user_id, venue, symbol))
            .cloned()
    }

    pub fn has(&self, user_id: &str, venue: &str, symbol: &str) -> bool {
        self.positions
            .read()
            .contains_key(&key_of(user_id, venue, symbol))
    }

    /// Apply a mutation to a tracked position in place.
    pub fn update<F>(&self, user_id: &str, venue: &str, symbol: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut TrackedPosition),
    {
        let mut positions = self.positions.write();
        match positions.get_mut(&key_of(user_id, venue, symbol)) {
            Some(position) => {
                mutate(position);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, user_id: &str, venue: &str, symbol: &str) -> Option<TrackedPosition> {
        let removed = self
            .positions
            .write()
            .remove(&key_of(user_id, venue, symbol));
        if removed.is_some() {
            info!(user_id, venue, symbol, "position untracked");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.positions.read().len()
    }

    /// All tracked positions as summary rows.
    pub fn summary(&self) -> Vec<PositionSummary> {
        self.positions
            .read()
            .values()
            .map(|p| PositionSummary {
                user_id: p.user_id.clone(),
                venue: p.venue.clone(),
                symbol: p.symbol.clone(),
                side: p.side,
                qty: p.qty,
                entry_price: p.entry_price,
                entry_time: p.entry_time,
                strategy_id: p.strategy_id.clone(),
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Replace the tracked set for `(user, venue)` from the venue snapshot.
    ///
    /// Adjunct metadata (protective-order ids, trailing parameters, strategy
    /// id) survives for symbols that are still open; size, side, and entry
    /// price are taken from the venue. Returns the number of positions now
    /// tracked for the pair.
    pub async fn reconcile(
        &self,
        user_id: &str,
        venue: &str,
        adapter: &dyn VenueAdapter,
    ) -> GatewayResult<usize> {
        let snapshots = adapter.get_positions().await?;
        debug!(
            user_id,
            venue,
            venue_positions = snapshots.len(),
            "reconciling tracker against venue"
        );

        let mut positions = self.positions.write();
        let stale: Vec<PositionKey> = positions
            .keys()
            .filter(|(u, v, _)| u == user_id && v == venue)
            .cloned()
            .collect();

        let mut kept: HashMap<PositionKey, TrackedPosition> = HashMap::new();
        for snapshot in &snapshots {
            let key = key_of(user_id, venue, &snapshot.symbol);
            let previous = positions.get(&key);
            let tracked = match previous {
                Some(prev) => TrackedPosition {
                    side: snapshot.side,
                    qty: snapshot.qty,
                    entry_price: snapshot.entry_price,
                    ..prev.clone()
                },
                None => {
                    warn!(
                        user_id,
                        venue,
                        symbol = %snapshot.symbol,
                        "venue reports a position the tracker did not know"
                    );
                    TrackedPosition {
                        user_id: user_id.to_string(),
                        venue: venue.to_string(),
                        symbol: snapshot.symbol.clone(),
                        side: snapshot.side,
                        qty: snapshot.qty,
                        entry_price: snapshot.entry_price,
                        entry_time: Utc::now(),
                        position_size_usd: snapshot.qty * snapshot.entry_price,
                        entry_order_id: None,
                        stop_loss_order_id: None,
                        take_profit_order_id: None,
                        stop_loss_price: None,
                        take_profit_price: None,
                        stop_kind: StopKind::Regular,
                        trailing: None,
                        asset_class: adapter.asset_class().to_string(),
                        strategy_id: None,
                    }
                }
            };
            kept.insert(key, tracked);
        }

        for key in stale {
            if !kept.contains_key(&key) {
                warn!(
                    user_id,
                    venue,
                    symbol = %key.2,
                    "tracked position no longer on venue — dropping"
                );
            }
            positions.remove(&key);
        }
        let count = kept.len();
        positions.extend(kept);

        info!(user_id, venue, tracked = count, "reconciliation complete");
        Ok(count)
    }
}

fn key_of(user_id: &str, venue: &str, symbol: &str) -> PositionKey {
    (
        user_id.to_string(),
        venue.to_string(),
        symbol.to_string(),
    )
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("open_positions", &self.count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::testing::MockVenue;
    use crate::venues::PositionSnapshot;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, qty: Decimal) -> TrackedPosition {
        TrackedPosition {
            user_id: "u1".to_string(),
            venue: "aster".to_string(),
            symbol: symbol.to_string(),
            side: Side::Long,
            qty,
            entry_price: dec!(50000),
            entry_time: Utc::now(),
            position_size_usd: dec!(1000),
            entry_order_id: Some("e1".to_string()),
            stop_loss_order_id: Some("sl1".to_string()),
            take_profit_order_id: Some("tp1".to_string()),
            stop_loss_price: Some(dec!(49000)),
            take_profit_price: Some(dec!(52000)),
            stop_kind: StopKind::Regular,
            trailing: None,
            asset_class: "crypto".to_string(),
            strategy_id: Some("s1".to_string()),
        }
    }

    #[test]
    fn add_get_remove_roundtrip() {
        let tracker = PositionTracker::new();
        tracker.add(position("BTCUSDT", dec!(0.02)));

        assert!(tracker.has("u1", "aster", "BTCUSDT"));
        assert!(!tracker.has("u1", "aster", "ETHUSDT"));
        assert!(!tracker.has("u2", "aster", "BTCUSDT"));

        let got = tracker.get("u1", "aster", "BTCUSDT").unwrap();
        assert_eq!(got.qty, dec!(0.02));

        tracker.remove("u1", "aster", "BTCUSDT");
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn one_position_per_key() {
        let tracker = PositionTracker::new();
        tracker.add(position("BTCUSDT", dec!(0.02)));
        tracker.add(position("BTCUSDT", dec!(0.05)));
        assert_eq!(tracker.count(), 1);
        assert_eq!(
            tracker.get("u1", "aster", "BTCUSDT").unwrap().qty,
            dec!(0.05)
        );
    }

    #[test]
    fn update_mutates_in_place() {
        let tracker = PositionTracker::new();
        tracker.add(position("BTCUSDT", dec!(0.020)));
        let updated = tracker.update("u1", "aster", "BTCUSDT", |p| {
            p.qty = dec!(0.015);
            p.stop_loss_order_id = None;
        });
        assert!(updated);
        let got = tracker.get("u1", "aster", "BTCUSDT").unwrap();
        assert_eq!(got.qty, dec!(0.015));
        assert!(got.stop_loss_order_id.is_none());
        assert!(!tracker.update("u1", "aster", "ETHUSDT", |_| {}));
    }

    #[tokio::test]
    async fn reconcile_preserves_adjunct_metadata() {
        let tracker = PositionTracker::new();
        tracker.add(position("BTCUSDT", dec!(0.02)));
        tracker.add(position("ETHUSDT", dec!(1)));

        // Venue reports BTC resized and a new SOL position; ETH is gone.
        let venue = MockVenue::new();
        venue.set_positions(vec![
            PositionSnapshot {
                symbol: "BTCUSDT".to_string(),
                side: Side::Long,
                qty: dec!(0.018),
                entry_price: dec!(50100),
                mark_price: None,
            },
            PositionSnapshot {
                symbol: "SOLUSDC".to_string(),
                side: Side::Short,
                qty: dec!(10),
                entry_price: dec!(150),
                mark_price: None,
            },
        ]);

        let count = tracker.reconcile("u1", "aster", &venue).await.unwrap();
        assert_eq!(count, 2);

        let btc = tracker.get("u1", "aster", "BTCUSDT").unwrap();
        assert_eq!(btc.qty, dec!(0.018));
        assert_eq!(btc.entry_price, dec!(50100));
        // Adjunct metadata survived.
        assert_eq!(btc.stop_loss_order_id.as_deref(), Some("sl1"));
        assert_eq!(btc.strategy_id.as_deref(), Some("s1"));

        assert!(!tracker.has("u1", "aster", "ETHUSDT"));
        let sol = tracker.get("u1", "aster", "SOLUSDC").unwrap();
        assert_eq!(sol.side, Side::Short);
        assert!(sol.stop_loss_order_id.is_none());
    }

    #[tokio::test]
    async fn reconcile_scopes_to_user_and_venue() {
        let tracker = PositionTracker::new();
        tracker.add(position("BTCUSDT", dec!(0.02)));
        let mut other = position("BTCUSDT", dec!(1));
        other.user_id = "u2".to_string();
        tracker.add(other);

        let venue = MockVenue::new();
        venue.set_positions(vec![]);
        tracker.reconcile("u1", "aster", &venue).await.unwrap();

        assert!(!tracker.has("u1", "aster", "BTCUSDT"));
        assert!(tracker.has("u2", "aster", "BTCUSDT"));
    }
}
