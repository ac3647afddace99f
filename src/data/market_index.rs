//! Broad market state from the index series and universe breadth.

use crate::scoring::features;
use crate::types::{Bar, MarketLabel, MarketState};

const RISK_ON_RET_1D: f64 = 0.006;
const RISK_ON_RET_5D: f64 = 0.015;
const VOLATILE_VOL_20: f64 = 0.02;

/// Classify the market. `index` holds daily bars, oldest first; `breadth`
/// is the share of the universe whose last return was positive.
///
/// With fewer than six index bars the label falls back to breadth alone.
pub fn classify_market(index: &[Bar], breadth: f64) -> MarketState {
    let breadth = breadth.clamp(0.0, 1.0);
    let closes: Vec<f64> = index.iter().map(|b| b.close).collect();

    if closes.len() < 6 || closes.iter().any(|c| *c <= 0.0) {
        let label = if breadth >= 0.65 {
            MarketLabel::RiskOn
        } else if breadth <= 0.35 {
            MarketLabel::RiskOff
        } else {
            MarketLabel::Neutral
        };
        return MarketState {
            label,
            risk_score: (100.0 * (1.0 - breadth)).clamp(0.0, 100.0),
            breadth,
            ..MarketState::neutral()
        };
    }

    let n = closes.len();
    let ret_1d = closes[n - 1] / closes[n - 2] - 1.0;
    let ret_5d = closes[n - 1] / closes[n - 6] - 1.0;
    let rets = features::returns(index);
    let window = &rets[rets.len().saturating_sub(20)..];
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    let vol_20 = (window.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / window.len() as f64).sqrt();

    let risk_score = (50.0 - 900.0 * ret_1d - 400.0 * ret_5d + 1000.0 * vol_20).clamp(0.0, 100.0);

    let label = if ret_1d > RISK_ON_RET_1D && ret_5d > RISK_ON_RET_5D {
        MarketLabel::RiskOn
    } else if ret_1d < -RISK_ON_RET_1D && ret_5d < -RISK_ON_RET_5D {
        MarketLabel::RiskOff
    } else if vol_20 > VOLATILE_VOL_20 {
        MarketLabel::Volatile
    } else {
        MarketLabel::Neutral
    };

    MarketState {
        label,
        risk_score,
        breadth,
        index_ret_1d: Some(ret_1d),
        index_ret_5d: Some(ret_5d),
        index_vol_20: Some(vol_20),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn daily(closes: &[f64]) -> Vec<Bar> {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 6, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                ts: t0 + Duration::days(i as i64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_rally_is_risk_on() {
        let s = classify_market(&daily(&[100.0, 100.5, 101.0, 101.5, 102.0, 103.0]), 0.6);
        assert_eq!(s.label, MarketLabel::RiskOn);
        assert!(s.risk_score < 50.0);
    }

    #[test]
    fn test_selloff_is_risk_off() {
        let s = classify_market(&daily(&[100.0, 99.5, 99.0, 98.5, 98.0, 97.0]), 0.4);
        assert_eq!(s.label, MarketLabel::RiskOff);
        assert!(s.risk_score > 50.0);
    }

    #[test]
    fn test_choppy_is_volatile() {
        let s = classify_market(&daily(&[100.0, 104.0, 99.0, 104.0, 99.0, 100.0]), 0.5);
        assert_eq!(s.label, MarketLabel::Volatile);
    }

    #[test]
    fn test_missing_index_uses_breadth() {
        assert_eq!(classify_market(&[], 0.2).label, MarketLabel::RiskOff);
        assert_eq!(classify_market(&[], 0.5).label, MarketLabel::Neutral);
        let s = classify_market(&[], 0.8);
        assert_eq!(s.label, MarketLabel::RiskOn);
        assert!(s.index_ret_1d.is_none());
    }
}
