//! Strategy lab.
//!
//! Replays stored runs and their 1d outcomes through every configured
//! (score threshold, max holdings) pair and ranks the pairs by a
//! return/hit-rate/volatility objective. Strictly read-only: results go
//! into the nightly report for human review and never touch weights or
//! regimes.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use crate::adapt::stats::{mean, std_pop};
use crate::config::LabConfig;
use crate::storage::history::RankedResult;
use crate::storage::Store;
use crate::types::CoreResult;

/// Volatility tolerated before the objective starts penalising it.
const VOL_FLOOR: f64 = 0.008;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Performance of one grid point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabRow {
    pub threshold: f64,
    pub max_holdings: usize,
    /// Runs in which at least one candidate qualified.
    pub trades: usize,
    pub avg_return: f64,
    pub win_rate: f64,
    pub volatility: f64,
    pub sharpe: f64,
    /// `None` when the pair never traded.
    pub objective: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LabStatus {
    InsufficientRuns { runs: usize, needed: usize },
    Ranked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabReport {
    pub status: LabStatus,
    pub runs: usize,
    /// Best first.
    pub rows: Vec<LabRow>,
}

impl LabReport {
    pub fn best(&self) -> Option<&LabRow> {
        self.rows.first().filter(|r| r.objective.is_some())
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Trading days per year, for annualising daily figures.
const TRADING_DAYS: f64 = 250.0;

/// Annualised mean-over-volatility of per-run 1d returns. Ranks grid
/// points whose objectives tie.
pub fn sharpe(avg: f64, vol: f64) -> f64 {
    if vol < 1e-10 {
        return 0.0;
    }
    avg / vol * TRADING_DAYS.sqrt()
}

pub fn objective(avg: f64, win_rate: f64, vol: f64) -> f64 {
    0.70 * avg + 0.25 * (win_rate - 0.5) - 0.20 * (vol - VOL_FLOOR).max(0.0)
}

/// Group candidate rows by run, keeping only those with a 1d outcome.
fn by_run(results: &[RankedResult]) -> Vec<Vec<&RankedResult>> {
    let mut runs: BTreeMap<(DateTime<Utc>, &str), Vec<&RankedResult>> = BTreeMap::new();
    for r in results.iter().filter(|r| r.ret_1d.is_some()) {
        runs.entry((r.cycle_ts, r.run_id.as_str())).or_default().push(r);
    }
    runs.into_values()
        .map(|mut v| {
            v.sort_by_key(|r| r.rank);
            v
        })
        .collect()
}

fn evaluate(runs: &[Vec<&RankedResult>], threshold: f64, max_holdings: usize) -> LabRow {
    let returns: Vec<f64> = runs
        .iter()
        .filter_map(|run| {
            let picks: Vec<f64> = run
                .iter()
                .filter(|r| r.score >= threshold)
                .take(max_holdings)
                .filter_map(|r| r.ret_1d)
                .collect();
            mean(&picks)
        })
        .collect();

    let trades = returns.len();
    let avg = mean(&returns).unwrap_or(0.0);
    let win_rate = if trades == 0 {
        0.0
    } else {
        returns.iter().filter(|r| **r > 0.0).count() as f64 / trades as f64
    };
    let vol = std_pop(&returns).unwrap_or(0.0);

    LabRow {
        threshold,
        max_holdings,
        trades,
        avg_return: avg,
        win_rate,
        volatility: vol,
        sharpe: sharpe(avg, vol),
        objective: (trades > 0).then(|| objective(avg, win_rate, vol)),
    }
}

/// Run the full grid over `results`.
pub fn run_grid(results: &[RankedResult], config: &LabConfig) -> LabReport {
    let runs = by_run(results);
    if runs.len() < config.min_runs {
        return LabReport {
            status: LabStatus::InsufficientRuns {
                runs: runs.len(),
                needed: config.min_runs,
            },
            runs: runs.len(),
            rows: Vec::new(),
        };
    }

    let mut rows: Vec<LabRow> = config
        .thresholds
        .iter()
        .flat_map(|t| config.max_holdings.iter().map(move |k| (*t, *k)))
        .map(|(t, k)| evaluate(&runs, t, k))
        .collect();

    rows.sort_by(|a, b| match (a.objective, b.objective) {
        (Some(x), Some(y)) => y
            .total_cmp(&x)
            .then_with(|| b.sharpe.total_cmp(&a.sharpe))
            .then_with(|| a.threshold.total_cmp(&b.threshold))
            .then_with(|| a.max_holdings.cmp(&b.max_holdings)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a
            .threshold
            .total_cmp(&b.threshold)
            .then_with(|| a.max_holdings.cmp(&b.max_holdings)),
    });

    LabReport {
        status: LabStatus::Ranked,
        runs: runs.len(),
        rows,
    }
}

pub struct StrategyLab {
    store: Store,
    config: LabConfig,
}

impl StrategyLab {
    pub fn new(store: Store, config: LabConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(&self, as_of: DateTime<Utc>) -> CoreResult<LabReport> {
        let since = as_of - Duration::days(self.config.lookback_days);
        let results = self.store.ranked_results(since, as_of).await?;
        let report = run_grid(&results, &self.config);
        match report.best() {
            Some(best) => info!(
                runs = report.runs,
                threshold = best.threshold,
                max_holdings = best.max_holdings,
                avg_return = format!("{:+.3}%", best.avg_return * 100.0),
                win_rate = format!("{:.1}%", best.win_rate * 100.0),
                "Strategy lab ranked"
            ),
            None => info!(runs = report.runs, status = ?report.status, "Strategy lab skipped"),
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
