//! Factor diagnostics.
//!
//! Per feature: the information coefficient against realized 1d returns
//! and the top-minus-bottom quintile return spread, both on winsorised
//! values. Feeds the weight tuner and the nightly report.

use super::stats::{pearson, quintile_spread, unique_count, winsorize};
use crate::config::AdaptationConfig;
use crate::scoring::FEATURES;
use crate::storage::history::OutcomeSample;

#[derive(Debug, Clone, PartialEq)]
pub struct FactorStat {
    pub feature: String,
    pub samples: usize,
    pub unique: usize,
    /// `None` when the feature had too little data or no variance.
    pub ic: Option<f64>,
    pub spread: Option<f64>,
}

impl FactorStat {
    pub fn is_usable(&self) -> bool {
        self.ic.is_some()
    }
}

/// Statistics for one feature over `samples`.
pub fn factor_stat(feature: &str, samples: &[OutcomeSample], cfg: &AdaptationConfig) -> FactorStat {
    let (xs, ys): (Vec<f64>, Vec<f64>) = samples
        .iter()
        .filter_map(|s| s.features.get(feature).map(|x| (*x, s.realized_return)))
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .unzip();
    let unique = unique_count(&xs);
    let mut stat = FactorStat {
        feature: feature.to_string(),
        samples: xs.len(),
        unique,
        ic: None,
        spread: None,
    };
    if xs.len() < cfg.min_feature_samples || unique < cfg.min_unique_values {
        return stat;
    }
    let xw = winsorize(&xs, cfg.winsor_lower, cfg.winsor_upper);
    let yw = winsorize(&ys, cfg.winsor_lower, cfg.winsor_upper);
    stat.ic = pearson(&xw, &yw);
    if stat.ic.is_some() {
        stat.spread = quintile_spread(&xw, &yw);
    }
    stat
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsReport {
    pub sample_count: usize,
    pub factors: Vec<FactorStat>,
}

impl DiagnosticsReport {
    fn usable(&self) -> impl Iterator<Item = (&FactorStat, f64)> {
        self.factors.iter().filter_map(|f| f.ic.map(|ic| (f, ic)))
    }

    pub fn strongest(&self) -> Option<&FactorStat> {
        self.usable().max_by(|a, b| a.1.total_cmp(&b.1)).map(|(f, _)| f)
    }

    pub fn weakest(&self) -> Option<&FactorStat> {
        self.usable().min_by(|a, b| a.1.total_cmp(&b.1)).map(|(f, _)| f)
    }
}

/// Diagnose every scored feature.
pub fn diagnose(samples: &[OutcomeSample], cfg: &AdaptationConfig) -> DiagnosticsReport {
    DiagnosticsReport {
        sample_count: samples.len(),
        factors: FEATURES.iter().map(|spec| factor_stat(spec.name, samples, cfg)).collect(),
    }
}
