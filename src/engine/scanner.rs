//! Candidate selection.
//!
//! Scores every instrument in the collected view under the weight set in
//! force, applies the eligibility filters (a fresh reference price,
//! minimum turnover, no runaway last-bar move), and records the top N as
//! the run's candidates. A run and its candidates are persisted together;
//! a repeated cycle resumes from what was stored instead of re-scoring
//! into a second run.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

use crate::calendar::{SessionClock, TradingCalendar};
use crate::config::ScanConfig;
use crate::engine::enricher::MarketView;
use crate::scoring::{self, compute_features, sector_stats, FeatureInputs, FeatureVector, ScoreBreakdown};
use crate::storage::Store;
use crate::types::{Candidate, CoreError, CoreResult, Instrument, Run, RunStatus, WeightSet};

/// Contributions listed in a candidate's rationale.
const RATIONALE_TOP: usize = 3;

// ---------------------------------------------------------------------------
// Scored universe
// ---------------------------------------------------------------------------

/// Why an instrument was scored but not selectable.
#[derive(Debug, Clone, PartialEq)]
pub enum Ineligible {
    NoPrice,
    LowTurnover(f64),
    RunawayMove(f64),
}

impl std::fmt::Display for Ineligible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ineligible::NoPrice => write!(f, "no fresh price"),
            Ineligible::LowTurnover(t) => write!(f, "turnover {t:.0} below minimum"),
            Ineligible::RunawayMove(r) => write!(f, "last move {:+.1}% too large", r * 100.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoredInstrument {
    pub instrument: Instrument,
    pub features: FeatureVector,
    pub breakdown: ScoreBreakdown,
    pub price: Option<Decimal>,
    pub ineligible: Option<Ineligible>,
}

impl ScoredInstrument {
    pub fn score(&self) -> f64 {
        self.breakdown.score
    }

    pub fn is_eligible(&self) -> bool {
        self.ineligible.is_none()
    }
}

/// Result of a selection step.
#[derive(Debug, Clone)]
pub struct Selection {
    pub run: Run,
    pub candidates: Vec<Candidate>,
    /// Every instrument scored this cycle, best first.
    pub scored: Vec<ScoredInstrument>,
    /// True when the run already existed and its candidates were reloaded.
    pub resumed: bool,
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

pub struct CandidateSelector {
    config: ScanConfig,
    clock: SessionClock,
    calendar: Arc<dyn TradingCalendar>,
}

impl CandidateSelector {
    pub fn new(config: ScanConfig, clock: SessionClock, calendar: Arc<dyn TradingCalendar>) -> Self {
        Self { config, clock, calendar }
    }

    /// `SchedulingSkip` outside the trading session.
    pub fn check_window(&self, cycle_ts: DateTime<Utc>) -> CoreResult<()> {
        self.clock.check_session(self.calendar.as_ref(), cycle_ts)
    }

    /// Score the whole view. Sorted by score descending, ties by id.
    pub fn score_universe(&self, view: &MarketView, weights: &WeightSet) -> Vec<ScoredInstrument> {
        let sectors = sector_stats(
            view.instruments
                .iter()
                .filter_map(|d| d.instrument.sector.as_deref().map(|s| (s, d.bars.as_slice()))),
        );
        let event_risk = view.event_risk.as_ref().map(|r| r.score);

        let mut scored: Vec<ScoredInstrument> = view
            .instruments
            .iter()
            .map(|d| {
                let inputs = FeatureInputs {
                    bars: &d.bars,
                    flow: d.flow,
                    buzz: d.buzz,
                    sector: d.instrument.sector.as_ref().and_then(|s| sectors.get(s).copied()),
                    event_risk,
                };
                let features = compute_features(&inputs);
                let breakdown = scoring::score(&features, weights);
                let ineligible = self.eligibility(d.price, &d.bars);
                ScoredInstrument {
                    instrument: d.instrument.clone(),
                    features,
                    breakdown,
                    price: d.price,
                    ineligible,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score()
                .total_cmp(&a.score())
                .then_with(|| a.instrument.id.cmp(&b.instrument.id))
        });
        scored
    }

    fn eligibility(&self, price: Option<Decimal>, bars: &[crate::types::Bar]) -> Option<Ineligible> {
        if price.is_none() {
            return Some(Ineligible::NoPrice);
        }
        let turnover = bars.last().map(|b| b.turnover()).unwrap_or(0.0);
        if turnover < self.config.min_turnover {
            return Some(Ineligible::LowTurnover(turnover));
        }
        match scoring::features::return_1h(bars) {
            Some(r) if r.abs() > self.config.max_abs_return_1h => Some(Ineligible::RunawayMove(r)),
            _ => None,
        }
    }

    /// Top-N eligible instruments as ranked candidates of `run_id`.
    pub fn pick(&self, run_id: &str, scored: &[ScoredInstrument]) -> Vec<Candidate> {
        scored
            .iter()
            .filter(|s| s.is_eligible())
            .take(self.config.top_n)
            .enumerate()
            .filter_map(|(i, s)| {
                let price = s.price?;
                Some(Candidate {
                    run_id: run_id.to_string(),
                    instrument_id: s.instrument.id.clone(),
                    name: s.instrument.name.clone(),
                    rank: i as u32 + 1,
                    score: s.score(),
                    price,
                    features: s.features.values.clone(),
                    contributions: s.breakdown.contributions.clone(),
                    rationale: rationale(s),
                })
            })
            .collect()
    }

    /// Score, pick and persist one run for `view.as_of`. When a run for
    /// this cycle already exists, its stored candidates are returned and
    /// nothing new is written.
    pub async fn select(
        &self,
        store: &Store,
        view: &MarketView,
        weights: &WeightSet,
        now: DateTime<Utc>,
    ) -> CoreResult<Selection> {
        let scored = self.score_universe(view, weights);

        if let Some(run) = store.run_for_cycle(view.as_of).await? {
            let candidates = store.candidates_for_run(&run.run_id).await?;
            info!(run_id = %run.run_id, candidates = candidates.len(), "Resuming existing run");
            return Ok(Selection {
                run,
                candidates,
                scored,
                resumed: true,
            });
        }

        let run = Run {
            run_id: uuid::Uuid::new_v4().to_string(),
            cycle_ts: view.as_of,
            status: RunStatus::Running,
            universe_size: scored.len(),
        };
        let candidates = self.pick(&run.run_id, &scored);

        match store.insert_run_with_candidates(&run, &candidates, now).await {
            Ok(()) => {}
            Err(CoreError::AlreadyRun(_)) => {
                // Lost a race with a concurrent invocation; take its result.
                let existing = store
                    .run_for_cycle(view.as_of)
                    .await?
                    .ok_or_else(|| CoreError::AlreadyRun(view.as_of.to_rfc3339()))?;
                let candidates = store.candidates_for_run(&existing.run_id).await?;
                return Ok(Selection {
                    run: existing,
                    candidates,
                    scored,
                    resumed: true,
                });
            }
            Err(e) => return Err(e),
        }

        let eligible = scored.iter().filter(|s| s.is_eligible()).count();
        info!(
            run_id = %run.run_id,
            scored = scored.len(),
            eligible,
            selected = candidates.len(),
            weights_version = weights.version,
            "Candidates selected"
        );
        for c in &candidates {
            debug!(candidate = %c, rationale = %c.rationale, "Selected");
        }

        Ok(Selection {
            run,
            candidates,
            scored,
            resumed: false,
        })
    }
}

/// "money_value_surge 2.40 (+16.0) · rs_5 0.06 (+5.3) · ..." plus a note on
/// neutralised inputs.
fn rationale(s: &ScoredInstrument) -> String {
    let parts: Vec<String> = s
        .breakdown
        .top_contributors(RATIONALE_TOP)
        .into_iter()
        .map(|(name, c)| {
            let value = s.features.get(name).unwrap_or(f64::NAN);
            format!("{name} {value:.2} (+{c:.1})")
        })
        .collect();
    let mut text = parts.join(" · ");
    if !s.features.neutralised.is_empty() {
        text.push_str(&format!(" · {} neutral", s.features.neutralised.len()));
    }
    text
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::WeekdayCalendar;
    use crate::engine::enricher::{BarSource, InstrumentData};
    use crate::scoring::default_weights;
    use crate::types::Bar;
    use chrono::{Duration, NaiveDate, NaiveTime, TimeZone};

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 6, 2, 0, 0).unwrap()
    }

    fn bars(step: f64, volume: f64) -> Vec<Bar> {
        (0..30)
            .map(|i| {
                let c = 100.0 + step * i as f64;
                Bar {
                    ts: as_of() - Duration::hours(29 - i),
                    open: c,
                    high: c + 1.0,
                    low: c - 1.0,
                    close: c,
                    volume,
                }
            })
            .collect()
    }

    fn data(id: &str, bars: Vec<Bar>, priced: bool) -> InstrumentData {
        let price = if priced {
            Some(Decimal::try_from(bars.last().unwrap().close).unwrap())
        } else {
            None
        };
        InstrumentData {
            instrument: Instrument {
                id: id.into(),
                name: format!("{id} Corp"),
                sector: Some("tech".into()),
            },
            bars,
            source: BarSource::Provider,
            flow: None,
            buzz: None,
            price,
        }
    }

    fn view(instruments: Vec<InstrumentData>) -> MarketView {
        MarketView {
            as_of: as_of(),
            instruments,
            index_bars: Vec::new(),
            event_risk: None,
            degraded: Vec::new(),
        }
    }

    fn weights() -> WeightSet {
        WeightSet {
            version: 1,
            effective_from: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
            weights: default_weights(),
            note: "seed".into(),
        }
    }

    fn selector(top_n: usize) -> CandidateSelector {
        let config = ScanConfig {
            top_n,
            min_turnover: 1_000.0,
            ..ScanConfig::default()
        };
        let clock = SessionClock::new(
            9,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        )
        .unwrap();
        CandidateSelector::new(config, clock, Arc::new(WeekdayCalendar::new(Vec::new())))
    }

    #[test]
    fn test_ranking_and_eligibility() {
        let v = view(vec![
            data("UP", bars(0.5, 100.0), true),
            data("FLAT", bars(0.0, 100.0), true),
            data("NOPX", bars(0.8, 100.0), false),
            data("THIN", bars(0.6, 1.0), true),
        ]);
        let s = selector(5);
        let scored = s.score_universe(&v, &weights());
        assert_eq!(scored.len(), 4);
        for pair in scored.windows(2) {
            assert!(pair[0].score() >= pair[1].score());
        }

        let picked = s.pick("run-1", &scored);
        let ids: Vec<&str> = picked.iter().map(|c| c.instrument_id.as_str()).collect();
        assert!(ids.contains(&"UP"));
        assert!(!ids.contains(&"NOPX"));
        assert!(!ids.contains(&"THIN"));
        assert_eq!(picked[0].rank, 1);
        assert!(picked.iter().all(|c| c.run_id == "run-1"));
        assert!(!picked[0].rationale.is_empty());
    }

    #[test]
    fn test_top_n_limits_candidates() {
        let v = view((0..6).map(|i| data(&format!("I{i}"), bars(0.1 * i as f64, 100.0), true)).collect());
        assert_eq!(selector(2).pick("r", &selector(2).score_universe(&v, &weights())).len(), 2);
    }

    #[test]
    fn test_missing_inputs_still_score() {
        let v = view(vec![data("EMPTY", Vec::new(), false)]);
        let scored = selector(5).score_universe(&v, &weights());
        // every scored feature is neutral, so the score sits at 50
        assert!((scored[0].score() - 50.0).abs() < 0.01);
        assert_eq!(scored[0].ineligible, Some(Ineligible::NoPrice));
    }

    #[test]
    fn test_window_check() {
        let s = selector(5);
        assert!(s.check_window(as_of()).is_ok());
        // Saturday 2026-01-10 11:00 local
        let weekend = Utc.with_ymd_and_hms(2026, 1, 10, 2, 0, 0).unwrap();
        assert!(matches!(s.check_window(weekend), Err(CoreError::SchedulingSkip(_))));
    }

    #[tokio::test]
    async fn test_select_persists_and_resumes() {
        let store = Store::in_memory().await.unwrap();
        let v = view(vec![data("UP", bars(0.5, 100.0), true), data("FLAT", bars(0.0, 100.0), true)]);
        let s = selector(5);

        let first = s.select(&store, &v, &weights(), as_of()).await.unwrap();
        assert!(!first.resumed);
        assert_eq!(first.candidates.len(), 2);

        let second = s.select(&store, &v, &weights(), as_of()).await.unwrap();
        assert!(second.resumed);
        assert_eq!(second.run.run_id, first.run.run_id);
        assert_eq!(second.candidates.len(), first.candidates.len());
        assert_eq!(store.count_runs().await.unwrap(), 1);
    }
}
