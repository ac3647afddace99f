//! Cycle reports.
//!
//! Summaries of one hourly cycle and one nightly batch, plus their plain
//! text rendering for the notification channel. Building a report never
//! touches storage; the drivers hand in everything it needs.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::info;

use crate::adapt::diagnostics::DiagnosticsReport;
use crate::adapt::tuner::{FeatureSignal, TuneStatus};
use crate::backtest::{LabReport, LabStatus};
use crate::engine::tracker::TrackReport;
use crate::paper::PaperCycleReport;
use crate::storage::markers::{Marker, MarkerStatus};
use crate::types::{Candidate, MarketState, Regime, RegimeLabel};

/// Failed cycles mentioned in the next report.
pub fn failure_notes(markers: &[Marker], since: DateTime<Utc>) -> Vec<String> {
    markers
        .iter()
        .filter(|m| m.status == MarkerStatus::Failed && m.heartbeat_at >= since)
        .map(|m| {
            format!(
                "{} {} failed: {}",
                m.kind,
                m.boundary,
                m.detail.as_deref().unwrap_or("no detail")
            )
        })
        .collect()
}

fn pct(x: f64) -> String {
    format!("{:+.2}%", x * 100.0)
}

fn money(x: Decimal) -> String {
    x.round_dp(0).to_string()
}

// ---------------------------------------------------------------------------
// Hourly
// ---------------------------------------------------------------------------

/// Summary of one completed scan cycle.
#[derive(Debug, Clone)]
pub struct HourlyReport {
    pub run_id: String,
    pub cycle_ts: DateTime<Utc>,
    /// Local wall-clock label, e.g. "2026-01-06 10:00".
    pub local_label: String,
    pub resumed: bool,
    pub universe: usize,
    pub eligible: usize,
    pub candidates: Vec<Candidate>,
    pub market: MarketState,
    pub regime: RegimeLabel,
    pub weights_version: i64,
    pub tracked: TrackReport,
    /// `None` when paper trading is disabled.
    pub paper: Option<PaperCycleReport>,
    pub degraded: Vec<String>,
    /// Optional commentary keyed by instrument id.
    pub explanations: BTreeMap<String, String>,
    pub failures: Vec<String>,
}

impl HourlyReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "[flowscout] {} | market {} (risk {:.0}, breadth {:.0}%) | regime {}",
            self.local_label,
            self.market.label,
            self.market.risk_score,
            self.market.breadth * 100.0,
            self.regime
        );
        let _ = writeln!(
            out,
            "scored {} / eligible {} / weights v{}{}",
            self.universe,
            self.eligible,
            self.weights_version,
            if self.resumed { " (resumed)" } else { "" }
        );

        if self.candidates.is_empty() {
            let _ = writeln!(out, "no candidates this cycle");
        }
        for c in &self.candidates {
            let _ = writeln!(out, "{c}");
            let _ = writeln!(out, "  {}", c.rationale);
            if let Some(text) = self.explanations.get(&c.instrument_id) {
                let _ = writeln!(out, "  > {}", text.trim());
            }
        }

        if let Some(p) = &self.paper {
            let _ = writeln!(
                out,
                "paper: {} buys, {} sells, threshold {:.0} | cash {} nav {} | {} open | realized {}",
                p.entries.len(),
                p.exits.len(),
                p.threshold,
                money(p.account.cash),
                money(p.account.nav),
                p.open_positions,
                money(p.realized)
            );
            for o in p.entries.iter().chain(p.exits.iter()) {
                let _ = writeln!(out, "  {o}");
            }
            if !p.skipped.is_empty() {
                let _ = writeln!(out, "  {} candidates skipped", p.skipped.len());
            }
        }

        if self.tracked.written > 0 {
            let _ = writeln!(out, "outcomes recorded: {}", self.tracked.written);
        }
        if !self.degraded.is_empty() {
            let _ = writeln!(out, "degraded inputs: {}", self.degraded.len());
        }
        for f in &self.failures {
            let _ = writeln!(out, "! {f}");
        }
        out
    }

    pub fn log(&self) {
        info!(
            run_id = %self.run_id,
            cycle = %self.cycle_ts,
            candidates = self.candidates.len(),
            market = %self.market.label,
            regime = %self.regime,
            buys = self.paper.as_ref().map_or(0, |p| p.entries.len()),
            sells = self.paper.as_ref().map_or(0, |p| p.exits.len()),
            nav = ?self.paper.as_ref().map(|p| p.account.nav.round_dp(2)),
            outcomes = self.tracked.written,
            "Hourly cycle reported"
        );
    }
}

// ---------------------------------------------------------------------------
// Nightly
// ---------------------------------------------------------------------------

/// Summary of one nightly adaptation batch.
#[derive(Debug, Clone)]
pub struct NightlyReport {
    pub as_of: DateTime<Utc>,
    /// Trading day the new weights and regime apply to.
    pub target: NaiveDate,
    pub tracked: TrackReport,
    pub tune_status: TuneStatus,
    pub weights_version: i64,
    pub weights_inserted: bool,
    pub signals: Vec<FeatureSignal>,
    pub regime: Regime,
    pub regime_inserted: bool,
    pub diagnostics: DiagnosticsReport,
    pub lab: LabReport,
    pub failures: Vec<String>,
}

impl NightlyReport {
    /// Features whose weight moved the most, largest first.
    pub fn biggest_moves(&self, n: usize) -> Vec<&FeatureSignal> {
        let mut moved: Vec<&FeatureSignal> = self.signals.iter().filter(|s| s.new != s.old).collect();
        moved.sort_by(|a, b| (b.new - b.old).abs().total_cmp(&(a.new - a.old).abs()));
        moved.truncate(n);
        moved
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let r = &self.regime;
        let _ = writeln!(out, "[flowscout nightly] for {}", self.target);
        let _ = writeln!(
            out,
            "regime {}: {} samples, win {:.1}%, avg {}, day P&L {}{}",
            r.label,
            r.sample_count,
            r.win_rate * 100.0,
            pct(r.avg_return),
            money(r.day_pnl),
            if self.regime_inserted { "" } else { " (unchanged)" }
        );
        let _ = writeln!(
            out,
            "weights v{}: {}{}",
            self.weights_version,
            self.tune_status,
            if self.weights_inserted { "" } else { " (already published)" }
        );
        for s in self.biggest_moves(3) {
            let capped = if s.clamped { " (capped)" } else { "" };
            let _ = writeln!(out, "  {} {:.3} -> {:.3}{capped}", s.feature, s.old, s.new);
        }

        let d = &self.diagnostics;
        match (d.strongest(), d.weakest()) {
            (Some(best), Some(worst)) => {
                let _ = writeln!(
                    out,
                    "factors ({} samples): strongest {} IC {:+.3}, weakest {} IC {:+.3}",
                    d.sample_count,
                    best.feature,
                    best.ic.unwrap_or(0.0),
                    worst.feature,
                    worst.ic.unwrap_or(0.0)
                );
            }
            _ => {
                let _ = writeln!(out, "factors: not enough data ({} samples)", d.sample_count);
            }
        }

        match (&self.lab.status, self.lab.best()) {
            (LabStatus::Ranked, Some(best)) => {
                let _ = writeln!(
                    out,
                    "lab best over {} runs: threshold {:.0}, holdings {} -> avg {}, win {:.1}%, sharpe {:.2}",
                    self.lab.runs,
                    best.threshold,
                    best.max_holdings,
                    pct(best.avg_return),
                    best.win_rate * 100.0,
                    best.sharpe
                );
            }
            (LabStatus::InsufficientRuns { runs, needed }, _) => {
                let _ = writeln!(out, "lab: {runs}/{needed} runs with outcomes");
            }
            _ => {
                let _ = writeln!(out, "lab: no combination traded");
            }
        }

        if self.tracked.written > 0 {
            let _ = writeln!(out, "outcomes recorded: {}", self.tracked.written);
        }
        for f in &self.failures {
            let _ = writeln!(out, "! {f}");
        }
        out
    }

    pub fn log(&self) {
        info!(
            target_date = %self.target,
            regime = %self.regime.label,
            weights_version = self.weights_version,
            tune = %self.tune_status,
            lab_runs = self.lab.runs,
            "Nightly batch reported"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
