// =============================================================================
// Settings service — cached per-user, per-venue trading policy
// =============================================================================
//
// Policy rows live in the store; this service caches them for up to a minute
// so the hot webhook path does not pay a store round-trip per signal. If the
// store is unreachable the service degrades to a conservative default (no
// caps, no auto-close, window always open) and logs a warning — policy
// lookups must never take trading down on their own.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::{ExchangeSettingsRecord, Store};

/// How long a cached policy stays fresh.
const SETTINGS_TTL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Trading window
// ---------------------------------------------------------------------------

/// Named window presets plus a fully custom tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowPreset {
    #[serde(rename = "24/5")]
    AllWeekdays,
    NySession,
    LondonSession,
    Weekend,
    Custom,
}

/// An evaluable trading window: timezone plus a `[start, end]` minute-of-day
/// tuple. `end < start` means the window wraps past local midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingWindow {
    pub preset: WindowPreset,
    pub timezone: Tz,
    pub start_minute: u16,
    pub end_minute: u16,
}

impl TradingWindow {
    /// Build a window from a stored preset name, falling back to the stored
    /// custom tuple for unknown names.
    pub fn from_record(record: &ExchangeSettingsRecord) -> Self {
        let timezone: Tz = record
            .window_timezone
            .parse()
            .unwrap_or(chrono_tz::UTC);

        match record.trading_hours_preset.as_str() {
            "24/5" => Self {
                preset: WindowPreset::AllWeekdays,
                timezone,
                start_minute: 0,
                end_minute: 24 * 60,
            },
            "ny-session" => Self {
                preset: WindowPreset::NySession,
                timezone: chrono_tz::America::New_York,
                start_minute: 9 * 60 + 30,
                end_minute: 16 * 60,
            },
            "london-session" => Self {
                preset: WindowPreset::LondonSession,
                timezone: chrono_tz::Europe::London,
                start_minute: 8 * 60,
                end_minute: 16 * 60 + 30,
            },
            "weekend" => Self {
                preset: WindowPreset::Weekend,
                timezone,
                start_minute: 0,
                end_minute: 24 * 60,
            },
            _ => Self {
                preset: WindowPreset::Custom,
                timezone,
                start_minute: record.window_start_minute,
                end_minute: record.window_end_minute,
            },
        }
    }

    /// A window that is always open (the degraded default).
    pub fn always_open() -> Self {
        Self {
            preset: WindowPreset::Custom,
            timezone: chrono_tz::UTC,
            start_minute: 0,
            end_minute: 24 * 60,
        }
    }

    /// Whether `now` falls inside the window.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        let local = self.timezone.from_utc_datetime(&now.naive_utc());
        let weekday = local.weekday();
        let minute = (local.hour() * 60 + local.minute()) as u16;

        let day_ok = match self.preset {
            WindowPreset::AllWeekdays | WindowPreset::NySession | WindowPreset::LondonSession => {
                !matches!(weekday, Weekday::Sat | Weekday::Sun)
            }
            WindowPreset::Weekend => matches!(weekday, Weekday::Sat | Weekday::Sun),
            WindowPreset::Custom => true,
        };
        if !day_ok {
            return false;
        }

        if self.start_minute == self.end_minute {
            // Degenerate zero-width window: treat as always open.
            return true;
        }
        if self.end_minute > self.start_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            // Wraps past midnight.
            minute >= self.start_minute || minute < self.end_minute
        }
    }

    /// Human-readable description for rejection messages.
    pub fn describe(&self) -> String {
        format!(
            "{:02}:{:02}-{:02}:{:02} {}",
            self.start_minute / 60,
            self.start_minute % 60,
            self.end_minute / 60,
            self.end_minute % 60,
            self.timezone
        )
    }
}

// ---------------------------------------------------------------------------
// Venue policy
// ---------------------------------------------------------------------------

/// The per `(user, venue)` policy the executor and risk engine consume.
#[derive(Debug, Clone)]
pub struct VenuePolicy {
    pub window: TradingWindow,
    pub auto_close_outside_window: bool,
    /// 0 = unlimited.
    pub max_trades_per_week: u32,
    /// 0 = unlimited.
    pub max_loss_per_week_usd: Decimal,
    pub default_position_size_usd: Option<Decimal>,
}

impl VenuePolicy {
    /// Conservative default used when the store cannot be reached: no caps
    /// and no auto-close, window always open.
    pub fn degraded_default() -> Self {
        Self {
            window: TradingWindow::always_open(),
            auto_close_outside_window: false,
            max_trades_per_week: 0,
            max_loss_per_week_usd: Decimal::ZERO,
            default_position_size_usd: None,
        }
    }

    fn from_record(record: &ExchangeSettingsRecord) -> Self {
        Self {
            window: TradingWindow::from_record(record),
            auto_close_outside_window: record.auto_close_outside_window,
            max_trades_per_week: record.max_trades_per_week,
            max_loss_per_week_usd: record.max_loss_per_week_usd,
            default_position_size_usd: record.default_position_size_usd,
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// TTL-cached policy lookups over the store.
pub struct SettingsService {
    store: Arc<dyn Store>,
    cache: RwLock<HashMap<(String, String), (Instant, Arc<VenuePolicy>)>>,
    ttl: Duration,
}

impl SettingsService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            ttl: SETTINGS_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolve the policy for `(user, venue)`, serving from cache within the
    /// TTL. Store failures degrade to `VenuePolicy::degraded_default`.
    pub async fn policy(&self, user_id: &str, venue: &str) -> Arc<VenuePolicy> {
        let key = (user_id.to_string(), venue.to_string());

        if let Some((fetched_at, policy)) = self.cache.read().get(&key) {
            if fetched_at.elapsed() < self.ttl {
                return policy.clone();
            }
        }

        let policy = match self.store.get_exchange_settings(user_id, venue).await {
            Ok(Some(record)) => {
                debug!(user_id, venue, "exchange settings loaded from store");
                Arc::new(VenuePolicy::from_record(&record))
            }
            Ok(None) => {
                debug!(user_id, venue, "no exchange settings row — using defaults");
                Arc::new(VenuePolicy::degraded_default())
            }
            Err(e) => {
                warn!(
                    user_id,
                    venue,
                    error = %e,
                    "settings load failed — degrading to conservative defaults"
                );
                Arc::new(VenuePolicy::degraded_default())
            }
        };

        self.cache
            .write()
            .insert(key, (Instant::now(), policy.clone()));
        policy
    }

    /// Drop a cached policy (e.g. after the dashboard edits settings).
    pub fn invalidate(&self, user_id: &str, venue: &str) {
        self.cache
            .write()
            .remove(&(user_id.to_string(), venue.to_string()));
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn record(preset: &str) -> ExchangeSettingsRecord {
        ExchangeSettingsRecord {
            user_id: "u1".to_string(),
            exchange: "aster".to_string(),
            trading_hours_preset: preset.to_string(),
            window_timezone: "UTC".to_string(),
            window_start_minute: 0,
            window_end_minute: 1440,
            auto_close_outside_window: false,
            max_trades_per_week: 5,
            max_loss_per_week_usd: dec!(200),
            default_position_size_usd: Some(dec!(100)),
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    // ---- window evaluation -------------------------------------------------

    #[test]
    fn weekday_preset_closed_on_saturday() {
        let window = TradingWindow::from_record(&record("24/5"));
        // 2026-08-01 is a Saturday.
        assert!(!window.is_open_at(utc(2026, 8, 1, 12, 0)));
        // 2026-08-03 is a Monday.
        assert!(window.is_open_at(utc(2026, 8, 3, 12, 0)));
    }

    #[test]
    fn ny_session_respects_local_open() {
        let window = TradingWindow::from_record(&record("ny-session"));
        // 2026-08-03 (Mon) 13:00 UTC = 09:00 New York (EDT) — before the bell.
        assert!(!window.is_open_at(utc(2026, 8, 3, 13, 0)));
        // 14:00 UTC = 10:00 New York — inside the session.
        assert!(window.is_open_at(utc(2026, 8, 3, 14, 0)));
        // 20:30 UTC = 16:30 New York — after the close.
        assert!(!window.is_open_at(utc(2026, 8, 3, 20, 30)));
    }

    #[test]
    fn weekend_preset_open_only_on_weekend() {
        let window = TradingWindow::from_record(&record("weekend"));
        assert!(window.is_open_at(utc(2026, 8, 1, 12, 0))); // Saturday
        assert!(!window.is_open_at(utc(2026, 8, 3, 12, 0))); // Monday
    }

    #[test]
    fn custom_window_wraps_midnight() {
        let mut rec = record("custom");
        rec.window_start_minute = 22 * 60; // 22:00
        rec.window_end_minute = 2 * 60; // 02:00 next day
        let window = TradingWindow::from_record(&rec);
        assert!(window.is_open_at(utc(2026, 8, 3, 23, 0)));
        assert!(window.is_open_at(utc(2026, 8, 4, 1, 0)));
        assert!(!window.is_open_at(utc(2026, 8, 4, 12, 0)));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let mut rec = record("custom");
        rec.window_timezone = "Mars/Olympus_Mons".to_string();
        let window = TradingWindow::from_record(&rec);
        assert_eq!(window.timezone, chrono_tz::UTC);
    }

    // ---- service caching ---------------------------------------------------

    #[tokio::test]
    async fn policy_served_from_cache_within_ttl() {
        let store = Arc::new(MemoryStore::new());
        store.seed_settings(record("24/5"));
        let service = SettingsService::new(store.clone());

        let first = service.policy("u1", "aster").await;
        assert_eq!(first.max_trades_per_week, 5);

        // Mutating the store is not visible until the TTL lapses.
        store.seed_settings(ExchangeSettingsRecord {
            max_trades_per_week: 99,
            ..record("24/5")
        });
        let second = service.policy("u1", "aster").await;
        assert_eq!(second.max_trades_per_week, 5);
    }

    #[tokio::test]
    async fn expired_cache_refreshes() {
        let store = Arc::new(MemoryStore::new());
        store.seed_settings(record("24/5"));
        let service = SettingsService::with_ttl(store.clone(), Duration::from_millis(0));

        let first = service.policy("u1", "aster").await;
        assert_eq!(first.max_trades_per_week, 5);
    }

    #[tokio::test]
    async fn missing_row_degrades_to_default() {
        let store = Arc::new(MemoryStore::new());
        let service = SettingsService::new(store);
        let policy = service.policy("u1", "oanda").await;
        assert_eq!(policy.max_trades_per_week, 0);
        assert!(!policy.auto_close_outside_window);
        assert!(policy.window.is_open_at(Utc::now()));
    }
}
