//! Pure feature functions over an instrument's bar history.
//!
//! Every function takes bars in chronological order and returns `None`
//! when there is not enough data. Callers substitute the feature's
//! neutral value; nothing here errors.

use crate::types::Bar;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Simple returns `c[i]/c[i-1] - 1`; non-positive prices yield no return.
pub fn returns(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| w[1].close / w[0].close - 1.0)
        .collect()
}

fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        None
    } else {
        Some(xs.iter().sum::<f64>() / xs.len() as f64)
    }
}

/// Population standard deviation.
fn std_dev(xs: &[f64]) -> Option<f64> {
    let m = mean(xs)?;
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64;
    Some(var.sqrt())
}

fn finite(x: f64) -> Option<f64> {
    x.is_finite().then_some(x)
}

fn tail<T>(xs: &[T], n: usize) -> &[T] {
    &xs[xs.len().saturating_sub(n)..]
}

fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let b = &w[1];
            (b.high - b.low)
                .max((b.high - prev_close).abs())
                .max((b.low - prev_close).abs())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Flow and participation
// ---------------------------------------------------------------------------

/// Latest turnover over the mean turnover of the prior 20 bars.
pub fn money_value_surge(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 21 {
        return None;
    }
    let (last, prior) = bars.split_last()?;
    let base = mean(&tail(prior, 20).iter().map(Bar::turnover).collect::<Vec<_>>())?;
    if base <= 0.0 {
        return None;
    }
    finite(last.turnover() / base)
}

/// Latest volume over the mean volume of the prior 20 bars.
pub fn volume_surge(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 21 {
        return None;
    }
    let (last, prior) = bars.split_last()?;
    let base = mean(&tail(prior, 20).iter().map(|b| b.volume).collect::<Vec<_>>())?;
    if base <= 0.0 {
        return None;
    }
    finite(last.volume / base)
}

/// Average true range over 14 bars relative to its own longer-run mean.
pub fn atr_regime(bars: &[Bar]) -> Option<f64> {
    let tr = true_ranges(bars);
    if tr.len() < 28 {
        return None;
    }
    let atr: Vec<f64> = tr.windows(14).map(|w| w.iter().sum::<f64>() / 14.0).collect();
    let (last, _) = atr.split_last()?;
    let base = mean(&atr)?;
    if base <= 0.0 {
        return None;
    }
    finite(last / base)
}

// ---------------------------------------------------------------------------
// Momentum and trend
// ---------------------------------------------------------------------------

/// Return over the last 5 bars.
pub fn rs_5(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 6 {
        return None;
    }
    let c = closes(bars);
    let then = c[c.len() - 6];
    if then <= 0.0 {
        return None;
    }
    finite(c[c.len() - 1] / then - 1.0)
}

/// Share of positive returns among the last 6.
pub fn momentum_persistence(bars: &[Bar]) -> Option<f64> {
    let r = returns(bars);
    if r.len() < 6 {
        return None;
    }
    let last = tail(&r, 6);
    Some(last.iter().filter(|x| **x > 0.0).count() as f64 / last.len() as f64)
}

/// Close relative to the highest close of the last 20 bars, minus one.
pub fn drawdown_20(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 20 {
        return None;
    }
    let window = tail(bars, 20);
    let peak = window.iter().map(|b| b.close).fold(f64::MIN, f64::max);
    let last = window.last()?.close;
    if peak <= 0.0 {
        return None;
    }
    finite(last / peak - 1.0)
}

/// Short-term return volatility relative to the 20-bar volatility.
pub fn volatility_shock(bars: &[Bar]) -> Option<f64> {
    let r = returns(bars);
    if r.len() < 20 {
        return None;
    }
    let short = std_dev(tail(&r, 5))?;
    let long = std_dev(tail(&r, 20))?;
    if long <= 0.0 {
        return None;
    }
    finite(short / long)
}

/// Blend of close vs MA20 and MA20 vs MA60.
pub fn trend_strength(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 60 {
        return None;
    }
    let c = closes(bars);
    let ma20 = mean(tail(&c, 20))?;
    let ma60 = mean(tail(&c, 60))?;
    if ma20 <= 0.0 || ma60 <= 0.0 {
        return None;
    }
    let close = *c.last()?;
    finite(0.5 * (close - ma20) / ma20 + 0.5 * (ma20 - ma60) / ma60)
}

/// Close vs MA20, for reports.
pub fn ma_trend(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 20 {
        return None;
    }
    let c = closes(bars);
    let ma20 = mean(tail(&c, 20))?;
    if ma20 <= 0.0 {
        return None;
    }
    finite(c.last()? / ma20 - 1.0)
}

/// Close relative to the highest high of the previous 20 bars.
pub fn breakout_20(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 21 {
        return None;
    }
    let (last, prior) = bars.split_last()?;
    let high = tail(prior, 20).iter().map(|b| b.high).fold(f64::MIN, f64::max);
    if high <= 0.0 {
        return None;
    }
    finite((last.close - high) / high)
}

/// Position of the close inside the previous 20-bar range.
pub fn range_position_20(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 21 {
        return None;
    }
    let (last, prior) = bars.split_last()?;
    let window = tail(prior, 20);
    let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    if high - low <= f64::EPSILON {
        return Some(0.5);
    }
    finite((last.close - low) / (high - low))
}

/// Net move over path length across the last 8 bars.
pub fn efficiency_8(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 9 {
        return None;
    }
    let c = closes(tail(bars, 9));
    let path: f64 = c.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    if path <= 0.0 {
        return Some(0.0);
    }
    finite((c[c.len() - 1] - c[0]).abs() / path)
}

/// Last single-bar return.
pub fn return_1h(bars: &[Bar]) -> Option<f64> {
    returns(bars).last().copied().and_then(finite)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars_from(closes: &[f64], volume: f64) -> Vec<Bar> {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                ts: t0 + Duration::hours(i as i64),
                open: *c,
                high: c * 1.01,
                low: c * 0.99,
                close: *c,
                volume,
            })
            .collect()
    }

    #[test]
    fn test_short_history_yields_none() {
        let bars = bars_from(&[100.0, 101.0, 102.0], 1000.0);
        assert!(money_value_surge(&bars).is_none());
        assert!(rs_5(&bars).is_none());
        assert!(trend_strength(&bars).is_none());
        assert!(drawdown_20(&bars).is_none());
        assert!(return_1h(&bars).is_some());
    }

    #[test]
    fn test_money_value_surge() {
        let mut bars = bars_from(&[100.0; 21], 1000.0);
        bars[20].volume = 3000.0;
        let surge = money_value_surge(&bars).unwrap();
        assert!((surge - 3.0).abs() < 1e-9);
        assert!((volume_surge(&bars).unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rs_5_and_return_1h() {
        let bars = bars_from(&[100.0, 101.0, 102.0, 103.0, 104.0, 110.0], 1.0);
        assert!((rs_5(&bars).unwrap() - 0.10).abs() < 1e-9);
        assert!((return_1h(&bars).unwrap() - (110.0 / 104.0 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_persistence_counts_positive_returns() {
        let bars = bars_from(&[100.0, 101.0, 100.0, 102.0, 103.0, 102.0, 104.0], 1.0);
        // returns: +, -, +, +, -, +
        assert!((momentum_persistence(&bars).unwrap() - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_drawdown_and_breakout() {
        let mut closes = vec![100.0; 19];
        closes.push(90.0);
        let bars = bars_from(&closes, 1.0);
        assert!((drawdown_20(&bars).unwrap() + 0.10).abs() < 1e-9);

        let mut closes = vec![100.0; 20];
        closes.push(105.0);
        let bars = bars_from(&closes, 1.0);
        // previous highs are 101.0
        assert!((breakout_20(&bars).unwrap() - (105.0 - 101.0) / 101.0).abs() < 1e-9);
        assert!(range_position_20(&bars).unwrap() > 1.0);
    }

    #[test]
    fn test_efficiency_straight_line_is_one() {
        let closes: Vec<f64> = (0..9).map(|i| 100.0 + i as f64).collect();
        let bars = bars_from(&closes, 1.0);
        assert!((efficiency_8(&bars).unwrap() - 1.0).abs() < 1e-12);

        let zigzag = [100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0];
        assert_eq!(efficiency_8(&bars_from(&zigzag, 1.0)).unwrap(), 0.0);
    }

    #[test]
    fn test_trend_strength_positive_in_uptrend() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 1.002f64.powi(i)).collect();
        let bars = bars_from(&closes, 1.0);
        assert!(trend_strength(&bars).unwrap() > 0.0);
        assert!(ma_trend(&bars).unwrap() > 0.0);
    }

    #[test]
    fn test_flat_series_volatility_undefined() {
        let bars = bars_from(&[100.0; 30], 1.0);
        assert!(volatility_shock(&bars).is_none());
        // flat range still has a high/low band from the bar construction
        assert!(range_position_20(&bars).is_some());
    }

    #[test]
    fn test_atr_regime_expanding_range() {
        let mut bars = bars_from(&[100.0; 40], 1.0);
        for b in bars.iter_mut().skip(30) {
            b.high = 105.0;
            b.low = 95.0;
        }
        assert!(atr_regime(&bars).unwrap() > 1.0);
    }
}
