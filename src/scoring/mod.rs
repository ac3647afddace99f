//! Feature & scoring engine.
//!
//! Converts an instrument's bar history and side inputs (investor flow,
//! buzz, sector context, event risk) into a 0–100 score and a
//! per-feature contribution map. This layer is pure: the same inputs and
//! weight set always produce the same score, bit for bit.

pub mod features;

use std::collections::BTreeMap;

use crate::types::{Bar, WeightSet};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Sector context shared by all members of a sector in one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectorStats {
    pub members: usize,
    pub breadth: f64,
    pub rotation: f64,
}

/// Everything a feature function may read for one instrument.
#[derive(Debug, Clone, Copy)]
pub struct FeatureInputs<'a> {
    /// Chronological bars ending at or before the cycle timestamp.
    pub bars: &'a [Bar],
    /// Net investor flow in [-1, 1].
    pub flow: Option<f64>,
    /// Attention score in [0, 1].
    pub buzz: Option<f64>,
    pub sector: Option<SectorStats>,
    /// Market-wide event risk, 0–100.
    pub event_risk: Option<f64>,
}

impl<'a> FeatureInputs<'a> {
    pub fn bars_only(bars: &'a [Bar]) -> Self {
        Self {
            bars,
            flow: None,
            buzz: None,
            sector: None,
            event_risk: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Feature catalogue
// ---------------------------------------------------------------------------

/// A scored feature: how to compute it and the range it is normalised over.
pub struct FeatureSpec {
    pub name: &'static str,
    pub lo: f64,
    pub hi: f64,
    pub compute: fn(&FeatureInputs) -> Option<f64>,
}

const fn spec(
    name: &'static str,
    lo: f64,
    hi: f64,
    compute: fn(&FeatureInputs) -> Option<f64>,
) -> FeatureSpec {
    FeatureSpec {
        name,
        lo,
        hi,
        compute,
    }
}

impl FeatureSpec {
    /// Value used when the input is unavailable. Normalises to exactly 0.5.
    pub fn neutral(&self) -> f64 {
        (self.lo + self.hi) / 2.0
    }

    pub fn normalise(&self, x: f64) -> f64 {
        ((x - self.lo) / (self.hi - self.lo)).clamp(0.0, 1.0)
    }
}

/// Scored features, in the fixed order used for summation.
pub const FEATURES: &[FeatureSpec] = &[
    spec("money_value_surge", 0.8, 3.0, |i| features::money_value_surge(i.bars)),
    spec("flow_score", -1.0, 1.0, |i| i.flow),
    spec("atr_regime", 0.7, 1.8, |i| features::atr_regime(i.bars)),
    spec("sector_breadth", 0.2, 0.9, |i| i.sector.map(|s| s.breadth)),
    spec("sector_rotation", -0.15, 0.35, |i| i.sector.map(|s| s.rotation)),
    spec("buzz_score", 0.0, 1.0, |i| i.buzz),
    spec("rs_5", -0.05, 0.12, |i| features::rs_5(i.bars)),
    spec("momentum_persistence", 0.2, 0.9, |i| features::momentum_persistence(i.bars)),
    spec("drawdown_20", -0.18, 0.0, |i| features::drawdown_20(i.bars)),
    spec("volatility_shock", 0.7, 1.6, |i| features::volatility_shock(i.bars)),
    spec("trend_strength", -0.03, 0.08, |i| features::trend_strength(i.bars)),
    spec("breakout_20", -0.05, 0.06, |i| features::breakout_20(i.bars)),
    spec("range_position_20", 0.2, 1.0, |i| features::range_position_20(i.bars)),
    spec("efficiency_8", 0.1, 0.85, |i| features::efficiency_8(i.bars)),
    spec("event_calm", 0.0, 1.0, |i| i.event_risk.map(|r| 1.0 - r.clamp(0.0, 100.0) / 100.0)),
];

/// Recorded alongside scored features for reports and diagnostics.
const DIAGNOSTIC_FEATURES: &[(&str, fn(&[Bar]) -> Option<f64>)] = &[
    ("volume_surge", features::volume_surge),
    ("ma_trend", features::ma_trend),
    ("return_1h", features::return_1h),
];

pub fn feature_spec(name: &str) -> Option<&'static FeatureSpec> {
    FEATURES.iter().find(|f| f.name == name)
}

/// Initial weight set. Sums to 1.0.
pub fn default_weights() -> BTreeMap<String, f64> {
    [
        ("money_value_surge", 0.16),
        ("flow_score", 0.12),
        ("atr_regime", 0.10),
        ("sector_breadth", 0.06),
        ("sector_rotation", 0.07),
        ("buzz_score", 0.03),
        ("rs_5", 0.09),
        ("momentum_persistence", 0.07),
        ("drawdown_20", 0.05),
        ("volatility_shock", 0.02),
        ("trend_strength", 0.08),
        ("breakout_20", 0.05),
        ("range_position_20", 0.03),
        ("efficiency_8", 0.03),
        ("event_calm", 0.04),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

// ---------------------------------------------------------------------------
// Sector context
// ---------------------------------------------------------------------------

/// Per-sector breadth and rotation from each member's bars.
pub fn sector_stats<'a, I>(members: I) -> BTreeMap<String, SectorStats>
where
    I: IntoIterator<Item = (&'a str, &'a [Bar])>,
{
    let mut grouped: BTreeMap<String, Vec<&'a [Bar]>> = BTreeMap::new();
    for (sector, bars) in members {
        grouped.entry(sector.to_string()).or_default().push(bars);
    }

    grouped
        .into_iter()
        .filter_map(|(sector, series)| {
            let last_returns: Vec<f64> = series.iter().filter_map(|b| features::return_1h(b)).collect();
            if last_returns.is_empty() {
                return None;
            }
            let n = last_returns.len() as f64;
            let breadth = last_returns.iter().filter(|r| **r > 0.0).count() as f64 / n;
            let avg_ret = last_returns.iter().sum::<f64>() / n;
            let surges: Vec<f64> = series.iter().filter_map(|b| features::money_value_surge(b)).collect();
            let avg_surge = if surges.is_empty() {
                1.0
            } else {
                surges.iter().sum::<f64>() / surges.len() as f64
            };
            let rotation = 0.5 * avg_ret + 0.3 * (breadth - 0.5) + 0.2 * (avg_surge - 1.0);
            Some((
                sector,
                SectorStats {
                    members: series.len(),
                    breadth,
                    rotation,
                },
            ))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Feature values for one instrument with unavailable inputs neutralised.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub values: BTreeMap<String, f64>,
    /// Scored features that fell back to their neutral value.
    pub neutralised: Vec<&'static str>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

/// Evaluate every feature. Unavailable or non-finite values become neutral.
pub fn compute_features(inputs: &FeatureInputs) -> FeatureVector {
    let mut values = BTreeMap::new();
    let mut neutralised = Vec::new();

    for spec in FEATURES {
        let value = match (spec.compute)(inputs).filter(|x| x.is_finite()) {
            Some(v) => v,
            None => {
                neutralised.push(spec.name);
                spec.neutral()
            }
        };
        values.insert(spec.name.to_string(), value);
    }
    for (name, f) in DIAGNOSTIC_FEATURES {
        if let Some(v) = f(inputs.bars).filter(|x| x.is_finite()) {
            values.insert((*name).to_string(), v);
        }
    }

    FeatureVector { values, neutralised }
}

/// Score plus the per-feature contributions that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub score: f64,
    pub contributions: BTreeMap<String, f64>,
}

impl ScoreBreakdown {
    /// Features ordered by descending contribution, ties by name.
    pub fn top_contributors(&self, n: usize) -> Vec<(&str, f64)> {
        let mut items: Vec<(&str, f64)> =
            self.contributions.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        items.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        items.truncate(n);
        items
    }
}

/// Weighted sum of normalised features, scaled to 0–100 and rounded to 2dp.
pub fn score(features: &FeatureVector, weights: &WeightSet) -> ScoreBreakdown {
    let mut total = 0.0;
    let mut contributions = BTreeMap::new();

    for spec in FEATURES {
        let x = features.get(spec.name).unwrap_or_else(|| spec.neutral());
        let c = weights.weight(spec.name) * spec.normalise(x) * 100.0;
        total += c;
        contributions.insert(spec.name.to_string(), c);
    }

    ScoreBreakdown {
        score: (total * 100.0).round() / 100.0,
        contributions,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    fn weights() -> WeightSet {
        WeightSet {
            version: 1,
            effective_from: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
            weights: default_weights(),
            note: "default".into(),
        }
    }

    fn rising_bars(n: usize) -> Vec<Bar> {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let c = 100.0 * 1.003f64.powi(i as i32);
                Bar {
                    ts: t0 + Duration::hours(i as i64),
                    open: c,
                    high: c * 1.004,
                    low: c * 0.996,
                    close: c,
                    volume: if i + 1 == n { 5000.0 } else { 1000.0 + (i % 7) as f64 * 50.0 },
                }
            })
            .collect()
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let total: f64 = default_weights().values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        for spec in FEATURES {
            assert!(default_weights().contains_key(spec.name), "{} missing", spec.name);
        }
    }

    #[test]
    fn test_all_missing_inputs_score_fifty() {
        let fv = compute_features(&FeatureInputs::bars_only(&[]));
        assert_eq!(fv.neutralised.len(), FEATURES.len());
        let s = score(&fv, &weights());
        assert_eq!(s.score, 50.0);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let bars = rising_bars(80);
        let inputs = FeatureInputs {
            bars: &bars,
            flow: Some(0.4),
            buzz: Some(0.2),
            sector: Some(SectorStats { members: 3, breadth: 0.66, rotation: 0.05 }),
            event_risk: Some(30.0),
        };
        let a = score(&compute_features(&inputs), &weights());
        let b = score(&compute_features(&inputs), &weights());
        assert_eq!(a.score.to_bits(), b.score.to_bits());
        assert_eq!(a.contributions, b.contributions);
    }

    #[test]
    fn test_strong_instrument_beats_neutral() {
        let bars = rising_bars(80);
        let inputs = FeatureInputs {
            bars: &bars,
            flow: Some(0.8),
            buzz: Some(0.5),
            sector: None,
            event_risk: None,
        };
        let fv = compute_features(&inputs);
        assert!(fv.get("money_value_surge").unwrap() > 3.0);
        assert!(fv.get("return_1h").is_some());
        assert!(score(&fv, &weights()).score > 50.0);
    }

    #[test]
    fn test_missing_flow_is_neutral_not_error() {
        let bars = rising_bars(80);
        let fv = compute_features(&FeatureInputs::bars_only(&bars));
        assert!(fv.neutralised.contains(&"flow_score"));
        assert_eq!(fv.get("flow_score"), Some(0.0));
        assert_eq!(fv.get("event_calm"), Some(0.5));
    }

    #[test]
    fn test_contributions_sum_to_score() {
        let bars = rising_bars(80);
        let s = score(&compute_features(&FeatureInputs::bars_only(&bars)), &weights());
        let sum: f64 = s.contributions.values().sum();
        assert!((sum - s.score).abs() < 0.01);
        assert_eq!(s.top_contributors(3).len(), 3);
    }

    #[test]
    fn test_sector_stats_breadth_and_rotation() {
        let up = rising_bars(30);
        let mut down = rising_bars(30);
        let last = down.len() - 1;
        down[last].close = down[last - 1].close * 0.98;
        let stats = sector_stats(vec![("tech", &up[..]), ("tech", &down[..]), ("energy", &up[..])]);
        let tech = stats["tech"];
        assert_eq!(tech.members, 2);
        assert!((tech.breadth - 0.5).abs() < 1e-12);
        assert_eq!(stats["energy"].breadth, 1.0);
        assert!(stats["energy"].rotation > tech.rotation);
    }
}
