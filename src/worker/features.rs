// =============================================================================
// Feature vector — the fixed indicator set fed to the prediction models
// =============================================================================
//
// Computed from up to ~100 one-minute bars fetched through the user's venue
// adapter. The vector is DETERMINISTIC for the same bar sequence: every
// indicator is a pure function of the candles, no clocks, no randomness.
//
// Money stays in Decimal elsewhere in the gateway; this module converts to
// f64 once at the boundary because the indicators are statistical features,
// not accounting quantities.
//
// Indicator notes:
//   RSI / ATR / ADX use Wilder's smoothing (seed with an SMA of the first
//   period, then blend 1/period of each new value).
//   MACD is EMA(12) − EMA(26) with an EMA(9) signal line.
//   %B is (close − lower band) / (upper − lower).
// =============================================================================

use serde::Serialize;

use crate::venues::Candle;

/// Bars required before a vector can be produced (SMA(50) plus one).
pub const MIN_BARS: usize = 51;

/// The fixed feature set. Field names double as the wire keys sent to the
/// prediction services.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureVector {
    pub last_close: f64,
    pub sma_20: f64,
    pub sma_50: f64,
    pub ema_12: f64,
    pub ema_26: f64,
    pub rsi_14: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub bollinger_upper: f64,
    pub bollinger_lower: f64,
    pub bollinger_percent_b: f64,
    pub atr_14: f64,
    pub atr_percent: f64,
    pub realized_volatility: f64,
    pub volume_sma_20: f64,
    pub volume_ratio: f64,
    pub obv: f64,
    pub adx_14: f64,
    pub above_sma_20: bool,
    pub above_sma_50: bool,
}

impl FeatureVector {
    /// Compute the vector from `candles` (oldest first). Returns `None` when
    /// fewer than [`MIN_BARS`] bars are available.
    pub fn compute(candles: &[Candle]) -> Option<Self> {
        if candles.len() < MIN_BARS {
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| to_f64(&c.close)).collect();
        let highs: Vec<f64> = candles.iter().map(|c| to_f64(&c.high)).collect();
        let lows: Vec<f64> = candles.iter().map(|c| to_f64(&c.low)).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| to_f64(&c.volume)).collect();

        let last_close = *closes.last()?;
        if last_close <= 0.0 {
            return None;
        }

        let sma_20 = sma(&closes, 20)?;
        let sma_50 = sma(&closes, 50)?;
        let ema_12 = ema(&closes, 12)?;
        let ema_26 = ema(&closes, 26)?;
        let rsi_14 = rsi(&closes, 14)?;

        let (macd, macd_signal) = macd_with_signal(&closes)?;
        let macd_histogram = macd - macd_signal;

        let (bollinger_upper, bollinger_lower) = bollinger(&closes, 20, 2.0)?;
        let band_width = bollinger_upper - bollinger_lower;
        let bollinger_percent_b = if band_width.abs() < f64::EPSILON {
            0.5
        } else {
            (last_close - bollinger_lower) / band_width
        };

        let atr_14 = atr(&highs, &lows, &closes, 14)?;
        let atr_percent = atr_14 / last_close * 100.0;

        let realized_volatility = realized_vol(&closes, 30)?;

        let volume_sma_20 = sma(&volumes, 20)?;
        let last_volume = *volumes.last()?;
        let volume_ratio = if volume_sma_20 > 0.0 {
            last_volume / volume_sma_20
        } else {
            1.0
        };

        let obv = obv(&closes, &volumes);
        let adx_14 = adx(&highs, &lows, &closes, 14)?;

        Some(Self {
            last_close,
            sma_20,
            sma_50,
            ema_12,
            ema_26,
            rsi_14,
            macd,
            macd_signal,
            macd_histogram,
            bollinger_upper,
            bollinger_lower,
            bollinger_percent_b,
            atr_14,
            atr_percent,
            realized_volatility,
            volume_sma_20,
            volume_ratio,
            obv,
            adx_14,
            above_sma_20: last_close > sma_20,
            above_sma_50: last_close > sma_50,
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn to_f64(value: &rust_decimal::Decimal) -> f64 {
    value.to_string().parse().unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Indicator primitives
// ---------------------------------------------------------------------------

/// Simple moving average of the trailing `period` values.
fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values[values.len() - period..].iter().sum();
    Some(sum / period as f64)
}

/// Final value of an EMA seeded with the SMA of the first `period` values.
fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period)?.last().copied()
}

fn ema_series(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;

    let mut series = Vec::with_capacity(values.len() - period + 1);
    series.push(seed);
    let mut current = seed;
    for &value in &values[period..] {
        current = value * alpha + current * (1.0 - alpha);
        series.push(current);
    }
    Some(series)
}

/// Wilder RSI over `period` deltas.
fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (mut avg_gain, mut avg_loss) =
        deltas[..period].iter().fold((0.0, 0.0), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });
    let period_f = period as f64;
    avg_gain /= period_f;
    avg_loss /= period_f;

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };
    value.is_finite().then_some(value)
}

/// MACD line and its EMA(9) signal line.
fn macd_with_signal(closes: &[f64]) -> Option<(f64, f64)> {
    let fast = ema_series(closes, 12)?;
    let slow = ema_series(closes, 26)?;
    // Align the two series on their tails.
    let len = fast.len().min(slow.len());
    let macd_line: Vec<f64> = fast[fast.len() - len..]
        .iter()
        .zip(&slow[slow.len() - len..])
        .map(|(f, s)| f - s)
        .collect();
    let signal = ema(&macd_line, 9)?;
    Some((*macd_line.last()?, signal))
}

/// Bollinger bands: SMA(period) ± `k` standard deviations.
fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<(f64, f64)> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();
    Some((mean + k * sd, mean - k * sd))
}

/// Wilder-smoothed average true range.
fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let true_ranges: Vec<f64> = (1..closes.len())
        .map(|i| {
            let range = highs[i] - lows[i];
            let up = (highs[i] - closes[i - 1]).abs();
            let down = (lows[i] - closes[i - 1]).abs();
            range.max(up).max(down)
        })
        .collect();

    let mut atr = true_ranges[..period].iter().sum::<f64>() / period as f64;
    for &tr in &true_ranges[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }
    atr.is_finite().then_some(atr)
}

/// Standard deviation of log returns over the trailing `window` bars.
fn realized_vol(closes: &[f64], window: usize) -> Option<f64> {
    if closes.len() < window + 1 {
        return None;
    }
    let tail = &closes[closes.len() - window - 1..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.is_empty() {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    Some(variance.sqrt())
}

/// On-balance volume over the full sequence.
fn obv(closes: &[f64], volumes: &[f64]) -> f64 {
    let mut total = 0.0;
    for i in 1..closes.len() {
        if closes[i] > closes[i - 1] {
            total += volumes[i];
        } else if closes[i] < closes[i - 1] {
            total -= volumes[i];
        }
    }
    total
}

/// Wilder ADX: smoothed directional movement over `period`.
fn adx(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < 2 * period + 1 {
        return None;
    }

    let mut trs = Vec::with_capacity(closes.len() - 1);
    let mut plus_dm = Vec::with_capacity(closes.len() - 1);
    let mut minus_dm = Vec::with_capacity(closes.len() - 1);
    for i in 1..closes.len() {
        let up_move = highs[i] - highs[i - 1];
        let down_move = lows[i - 1] - lows[i];
        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        let range = highs[i] - lows[i];
        let up = (highs[i] - closes[i - 1]).abs();
        let down = (lows[i] - closes[i - 1]).abs();
        trs.push(range.max(up).max(down));
    }

    let period_f = period as f64;
    let mut tr_smooth: f64 = trs[..period].iter().sum();
    let mut plus_smooth: f64 = plus_dm[..period].iter().sum();
    let mut minus_smooth: f64 = minus_dm[..period].iter().sum();

    let di = |plus: f64, minus: f64, tr: f64| -> (f64, f64) {
        if tr == 0.0 {
            (0.0, 0.0)
        } else {
            (100.0 * plus / tr, 100.0 * minus / tr)
        }
    };
    let dx_of = |plus_di: f64, minus_di: f64| -> f64 {
        let sum = plus_di + minus_di;
        if sum == 0.0 {
            0.0
        } else {
            100.0 * (plus_di - minus_di).abs() / sum
        }
    };

    let (p, m) = di(plus_smooth, minus_smooth, tr_smooth);
    let mut dx_values = vec![dx_of(p, m)];

    for i in period..trs.len() {
        tr_smooth = tr_smooth - tr_smooth / period_f + trs[i];
        plus_smooth = plus_smooth - plus_smooth / period_f + plus_dm[i];
        minus_smooth = minus_smooth - minus_smooth / period_f + minus_dm[i];
        let (p, m) = di(plus_smooth, minus_smooth, tr_smooth);
        dx_values.push(dx_of(p, m));
    }

    // ADX = Wilder-smoothed DX.
    if dx_values.len() < period {
        return None;
    }
    let mut adx = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }
    adx.is_finite().then_some(adx)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    /// Synthetic bar sequence with a mild oscillation.
    fn candles(count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 2.0 + i as f64 * 0.01;
                let close = Decimal::try_from(base).unwrap();
                Candle {
                    open_time: i as i64 * 60_000,
                    open: close,
                    high: Decimal::try_from(base + 0.5).unwrap(),
                    low: Decimal::try_from(base - 0.5).unwrap(),
                    close,
                    volume: Decimal::try_from(1000.0 + (i as f64 * 1.3).cos() * 100.0).unwrap(),
                }
            })
            .collect()
    }

    #[test]
    fn requires_minimum_bars() {
        assert!(FeatureVector::compute(&candles(MIN_BARS - 1)).is_none());
        assert!(FeatureVector::compute(&candles(MIN_BARS)).is_some());
    }

    #[test]
    fn deterministic_for_same_bars() {
        let bars = candles(100);
        let a = FeatureVector::compute(&bars).unwrap();
        let b = FeatureVector::compute(&bars).unwrap();
        assert_eq!(a.to_json(), b.to_json());
    }

    #[test]
    fn vector_carries_at_least_fifteen_features() {
        let vector = FeatureVector::compute(&candles(100)).unwrap();
        let json = vector.to_json();
        assert!(json.as_object().unwrap().len() >= 15);
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        assert!((rsi(&rising, 14).unwrap() - 100.0).abs() < 1e-9);
        let falling: Vec<f64> = (1..=40).rev().map(|x| x as f64).collect();
        assert!(rsi(&falling, 14).unwrap().abs() < 1e-9);
        let flat = vec![5.0; 40];
        assert!((rsi(&flat, 14).unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn sma_tracks_trailing_window() {
        let values: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert!((sma(&values, 10).unwrap() - 25.5).abs() < 1e-9);
    }

    #[test]
    fn ema_converges_toward_a_level_shift() {
        // Flat at 10, then a step to 20: the EMA must sit strictly between
        // the old and new levels, closer to the new one as bars accumulate.
        let mut values = vec![10.0; 20];
        values.extend(std::iter::repeat(20.0).take(15));
        let e = ema(&values, 10).unwrap();
        assert!(e > 15.0, "ema {e} should have moved most of the way up");
        assert!(e < 20.0, "ema {e} must not overshoot the new level");
    }

    #[test]
    fn bollinger_brackets_the_mean() {
        let (upper, lower) = bollinger(&vec![50.0; 25], 20, 2.0).unwrap();
        assert!((upper - 50.0).abs() < 1e-9);
        assert!((lower - 50.0).abs() < 1e-9);

        let mixed: Vec<f64> = (0..25).map(|i| 50.0 + (i % 5) as f64).collect();
        let (upper, lower) = bollinger(&mixed, 20, 2.0).unwrap();
        assert!(upper > lower);
    }

    #[test]
    fn percent_b_within_bands_for_oscillating_series() {
        let vector = FeatureVector::compute(&candles(100)).unwrap();
        assert!(vector.bollinger_percent_b > -0.5);
        assert!(vector.bollinger_percent_b < 1.5);
        assert!(vector.bollinger_upper >= vector.bollinger_lower);
    }

    #[test]
    fn atr_positive_for_ranging_bars() {
        let bars = candles(60);
        let highs: Vec<f64> = bars.iter().map(|c| to_f64(&c.high)).collect();
        let lows: Vec<f64> = bars.iter().map(|c| to_f64(&c.low)).collect();
        let closes: Vec<f64> = bars.iter().map(|c| to_f64(&c.close)).collect();
        let value = atr(&highs, &lows, &closes, 14).unwrap();
        assert!(value > 0.0);
        assert!(value < 5.0);
    }

    #[test]
    fn obv_direction_follows_closes() {
        let closes = vec![1.0, 2.0, 3.0];
        let volumes = vec![10.0, 20.0, 30.0];
        assert!((obv(&closes, &volumes) - 50.0).abs() < 1e-9);
        let closes = vec![3.0, 2.0, 1.0];
        assert!((obv(&closes, &volumes) + 50.0).abs() < 1e-9);
    }

    #[test]
    fn adx_bounded_zero_to_hundred() {
        let bars = candles(100);
        let highs: Vec<f64> = bars.iter().map(|c| to_f64(&c.high)).collect();
        let lows: Vec<f64> = bars.iter().map(|c| to_f64(&c.low)).collect();
        let closes: Vec<f64> = bars.iter().map(|c| to_f64(&c.close)).collect();
        let value = adx(&highs, &lows, &closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn price_position_flags_consistent() {
        let vector = FeatureVector::compute(&candles(100)).unwrap();
        assert_eq!(vector.above_sma_20, vector.last_close > vector.sma_20);
        assert_eq!(vector.above_sma_50, vector.last_close > vector.sma_50);
    }
}
