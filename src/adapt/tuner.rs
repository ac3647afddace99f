//! Nightly weight tuning.
//!
//! Each scored feature gets a signal from its factor statistics over the
//! recent window: mostly the information coefficient, partly the
//! top-minus-bottom quintile return spread. The signal nudges the weight,
//! the set is renormalised, and finally each feature's move is clamped to
//! the daily cap. The clamp is applied last and never undone, so
//! consecutive versions differ by at most the cap per feature.
//!
//! Until enough history exists (distinct trading days and samples) the
//! current weights are carried forward unchanged.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::diagnostics::{factor_stat, FactorStat};
use crate::calendar::SessionClock;
use crate::config::AdaptationConfig;
use crate::scoring::FEATURES;
use crate::storage::history::OutcomeSample;
use crate::storage::Store;
use crate::types::{CoreError, CoreResult, Horizon, WeightSet};

/// Weight of the IC in the combined signal; the spread takes the rest.
const IC_SHARE: f64 = 0.7;

// ---------------------------------------------------------------------------
// Pure proposal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSignal {
    pub feature: String,
    pub samples: usize,
    pub ic: Option<f64>,
    pub spread: Option<f64>,
    pub signal: f64,
    pub old: f64,
    pub new: f64,
    pub clamped: bool,
}

/// A feature whose proposed move exceeded the daily cap.
#[derive(Debug, Clone, PartialEq)]
pub struct ClampNote {
    pub feature: String,
    pub proposed: f64,
    pub cap: f64,
}

impl ClampNote {
    pub fn to_error(&self) -> CoreError {
        CoreError::AdaptationBoundsExceeded {
            feature: self.feature.clone(),
            proposed: self.proposed,
            cap: self.cap,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub weights: BTreeMap<String, f64>,
    pub signals: Vec<FeatureSignal>,
    pub clamps: Vec<ClampNote>,
}

fn combined_signal(stat: &FactorStat, cfg: &AdaptationConfig) -> f64 {
    let Some(ic) = stat.ic else {
        return 0.0;
    };
    let scaled_spread = stat
        .spread
        .map(|s| (s / cfg.spread_scale.max(1e-9)).clamp(-1.0, 1.0))
        .unwrap_or(0.0);
    IC_SHARE * ic + (1.0 - IC_SHARE) * scaled_spread
}

/// Propose the next weight set from `current` and the outcome samples.
pub fn propose(
    current: &BTreeMap<String, f64>,
    samples: &[OutcomeSample],
    cfg: &AdaptationConfig,
) -> Proposal {
    let mut raw = BTreeMap::new();
    let mut partial = Vec::new();
    for spec in FEATURES {
        let old = current.get(spec.name).copied().unwrap_or(0.0);
        let stat = factor_stat(spec.name, samples, cfg);
        let signal = combined_signal(&stat, cfg);
        raw.insert(spec.name.to_string(), (old + cfg.learning_rate * signal).max(0.0));
        partial.push((spec.name, stat, signal, old));
    }

    let total: f64 = raw.values().sum();
    let normalised: BTreeMap<String, f64> = if total > 1e-12 {
        raw.iter().map(|(k, v)| (k.clone(), v / total)).collect()
    } else {
        current.clone()
    };

    let mut weights = BTreeMap::new();
    let mut signals = Vec::new();
    let mut clamps = Vec::new();
    for (name, stat, signal, old) in partial {
        let target = normalised.get(name).copied().unwrap_or(old);
        let delta = target - old;
        let clamped = delta.abs() > cfg.daily_cap;
        let new = if clamped {
            clamps.push(ClampNote {
                feature: name.to_string(),
                proposed: delta,
                cap: cfg.daily_cap,
            });
            (old + delta.clamp(-cfg.daily_cap, cfg.daily_cap)).max(0.0)
        } else {
            target
        };
        weights.insert(name.to_string(), new);
        signals.push(FeatureSignal {
            feature: name.to_string(),
            samples: stat.samples,
            ic: stat.ic,
            spread: stat.spread,
            signal,
            old,
            new,
            clamped,
        });
    }

    Proposal {
        weights,
        signals,
        clamps,
    }
}

// ---------------------------------------------------------------------------
// Nightly step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TuneStatus {
    Warmup { days: usize, needed: usize },
    InsufficientSamples { samples: usize, needed: usize },
    Updated { clamped: usize },
}

impl std::fmt::Display for TuneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TuneStatus::Warmup { days, needed } => write!(f, "warmup {days}/{needed} days"),
            TuneStatus::InsufficientSamples { samples, needed } => {
                write!(f, "insufficient samples {samples}/{needed}")
            }
            TuneStatus::Updated { clamped } => write!(f, "updated ({clamped} clamped)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TuneResult {
    pub status: TuneStatus,
    pub previous: WeightSet,
    pub published: WeightSet,
    /// False when a set already existed for the target date.
    pub inserted: bool,
    pub signals: Vec<FeatureSignal>,
}

pub struct WeightTuner {
    store: Store,
    config: AdaptationConfig,
    clock: SessionClock,
}

impl WeightTuner {
    pub fn new(store: Store, config: AdaptationConfig, clock: SessionClock) -> Self {
        Self { store, config, clock }
    }

    async fn distinct_days(&self, as_of: DateTime<Utc>) -> CoreResult<usize> {
        let days: BTreeSet<NaiveDate> = self
            .store
            .outcome_cycle_times(Horizon::D1, as_of)
            .await?
            .into_iter()
            .map(|t| self.clock.local_date(t))
            .collect();
        Ok(days.len())
    }

    /// Publish the weight set effective on `target`, computed from
    /// outcomes known at `as_of`. Idempotent per target date.
    pub async fn run(&self, as_of: DateTime<Utc>, target: NaiveDate) -> CoreResult<TuneResult> {
        let previous = self.store.weights_effective(self.clock.local_date(as_of)).await?;
        let days = self.distinct_days(as_of).await?;
        let since = as_of - Duration::days(self.config.lookback_days);
        let samples = self
            .store
            .outcome_samples(Horizon::D1, since, as_of, self.config.max_samples)
            .await?;

        let (status, weights, signals) = if days < self.config.warmup_days {
            (
                TuneStatus::Warmup {
                    days,
                    needed: self.config.warmup_days,
                },
                previous.weights.clone(),
                Vec::new(),
            )
        } else if samples.len() < self.config.min_samples {
            (
                TuneStatus::InsufficientSamples {
                    samples: samples.len(),
                    needed: self.config.min_samples,
                },
                previous.weights.clone(),
                Vec::new(),
            )
        } else {
            let proposal = propose(&previous.weights, &samples, &self.config);
            for c in &proposal.clamps {
                info!(bound = %c.to_error(), "Weight delta clamped");
            }
            (
                TuneStatus::Updated {
                    clamped: proposal.clamps.len(),
                },
                proposal.weights,
                proposal.signals,
            )
        };

        let note = format!("{status}; {} samples over {days} days", samples.len());
        let (published, inserted) = self.store.publish_weights(target, &weights, &note, as_of).await?;
        if inserted {
            info!(version = published.version, %target, %status, "Weight set published");
        } else {
            info!(version = published.version, %target, "Weight set already published for target date");
        }
        for s in &signals {
            debug!(
                feature = %s.feature,
                samples = s.samples,
                ic = ?s.ic,
                old = s.old,
                new = s.new,
                "Feature signal"
            );
        }

        Ok(TuneResult {
            status,
            previous,
            published,
            inserted,
            signals,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::default_weights;
    use chrono::TimeZone;

    fn sample(i: usize, momentum: f64, ret: f64) -> OutcomeSample {
        let mut features = BTreeMap::new();
        features.insert("rs_5".to_string(), momentum);
        features.insert("buzz_score".to_string(), 0.5);
        OutcomeSample {
            run_id: format!("r{i}"),
            instrument_id: "AAA".into(),
            cycle_ts: Utc.with_ymd_and_hms(2026, 1, 6, 1, 0, 0).unwrap(),
            rank: 1,
            score: 60.0,
            features,
            realized_return: ret,
        }
    }

    fn predictive(n: usize) -> Vec<OutcomeSample> {
        (0..n)
            .map(|i| {
                let x = (i % 20) as f64 / 100.0;
                sample(i, x, x * 0.5 - 0.02)
            })
            .collect()
    }

    #[test]
    fn test_predictive_feature_gains_weight() {
        let cfg = AdaptationConfig::default();
        let current = default_weights();
        let p = propose(&current, &predictive(100), &cfg);
        let rs = p.signals.iter().find(|s| s.feature == "rs_5").unwrap();
        assert!(rs.ic.unwrap() > 0.9);
        assert!(p.weights["rs_5"] > current["rs_5"]);
        // buzz never varies, so it carries no signal of its own
        let buzz = p.signals.iter().find(|s| s.feature == "buzz_score").unwrap();
        assert_eq!(buzz.signal, 0.0);
    }

    #[test]
    fn test_delta_never_exceeds_cap() {
        let cfg = AdaptationConfig {
            daily_cap: 0.001,
            learning_rate: 0.5,
            ..AdaptationConfig::default()
        };
        let current = default_weights();
        let p = propose(&current, &predictive(200), &cfg);
        for (k, v) in &p.weights {
            assert!((v - current[k]).abs() <= cfg.daily_cap + 1e-12, "{k} moved too far");
        }
        assert!(!p.clamps.is_empty());
        for c in &p.clamps {
            assert!(c.proposed.abs() > c.cap);
            let err = c.to_error();
            assert!(matches!(err, CoreError::AdaptationBoundsExceeded { .. }));
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_no_samples_keeps_weights() {
        let cfg = AdaptationConfig::default();
        let current = default_weights();
        let p = propose(&current, &[], &cfg);
        for (k, v) in &p.weights {
            assert!((v - current[k]).abs() < 1e-12);
        }
        assert!(p.clamps.is_empty());
    }
}
