//! The hourly scan cycle.
//!
//! session check → claim boundary → collect → track outcomes → score and
//! select → paper trade → report. The boundary is the local top of the
//! hour; every stage receives it as its `as_of`, so a late or repeated
//! invocation computes exactly what an on-time one would have.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::time::Duration as StdDuration;
use tracing::{error, info, warn};

use super::coordinator::{CycleKind, CycleLease};
use super::report::{failure_notes, HourlyReport};
use super::Engine;
use crate::data::market_index::classify_market;
use crate::llm::explain_candidates;
use crate::paper::marks_from_view;
use crate::types::{CoreResult, RunStatus};

/// Markers scanned for recent failures.
const FAILURE_LOOKBACK_MARKERS: usize = 50;

impl Engine {
    /// Run the cycle containing `now`.
    ///
    /// `SchedulingSkip` outside the session and `AlreadyRun` for a claimed
    /// boundary are expected no-ops for the caller to log.
    pub async fn run_hourly(&self, now: DateTime<Utc>) -> CoreResult<HourlyReport> {
        let cycle_ts = self.clock.cycle_boundary(now);
        self.selector.check_window(cycle_ts)?;

        let lease = self
            .coordinator
            .acquire(CycleKind::Hourly, &cycle_ts.to_rfc3339(), now)
            .await?;

        match self.hourly_cycle(&lease, cycle_ts, now).await {
            Ok(report) => {
                let detail = format!("run {} with {} candidates", report.run_id, report.candidates.len());
                self.coordinator.complete(&lease, now, &detail).await?;
                self.coordinator.heartbeat(CycleKind::Hourly.as_str(), now, &detail).await?;
                report.log();
                self.notify(&report.render()).await;
                Ok(report)
            }
            Err(e) => {
                error!(cycle = %cycle_ts, error = %e, "Hourly cycle failed");
                if let Err(mark) = self.coordinator.fail(&lease, now, &e.to_string()).await {
                    warn!(error = %mark, "Could not record cycle failure");
                }
                Err(e)
            }
        }
    }

    async fn hourly_cycle(
        &self,
        lease: &CycleLease,
        cycle_ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<HourlyReport> {
        let view = self.enricher.collect(cycle_ts).await?;
        self.coordinator.touch(lease, now).await?;

        let tracked = self.tracker.track(cycle_ts).await?;

        let today = self.clock.local_date(cycle_ts);
        let weights = self.store.weights_effective(today).await?;
        let regime = self.classifier.effective(today).await?;
        let market = classify_market(&view.index_bars, view.breadth());
        info!(
            market = %market.label,
            risk = format!("{:.0}", market.risk_score),
            regime = %regime,
            weights_version = weights.version,
            "Cycle context"
        );

        let selection = self.selector.select(&self.store, &view, &weights, now).await?;
        let run_id = selection.run.run_id.clone();

        let paper = if self.config.paper.enabled {
            let marks = marks_from_view(&view);
            let mut paper = self
                .simulator
                .run_cycle(&run_id, &selection.candidates, regime, &market, &marks, cycle_ts)
                .await?;
            paper.account = self.simulator.mark(&marks, cycle_ts).await?;
            Some(paper)
        } else {
            None
        };

        self.store.set_run_status(&run_id, RunStatus::Completed, now).await?;

        let explanations = match (&self.explainer, selection.resumed) {
            (Some(explainer), false) if self.config.explainer.enabled => {
                explain_candidates(
                    explainer.as_ref(),
                    &selection.candidates,
                    self.config.explainer.explain_top,
                    StdDuration::from_secs(self.config.explainer.timeout_secs),
                )
                .await
            }
            _ => BTreeMap::new(),
        };

        let markers = self.store.recent_markers(FAILURE_LOOKBACK_MARKERS).await?;
        let failures = failure_notes(&markers, cycle_ts - Duration::days(1));

        Ok(HourlyReport {
            run_id,
            cycle_ts,
            local_label: self.clock.local(cycle_ts).format("%Y-%m-%d %H:%M").to_string(),
            resumed: selection.resumed,
            universe: selection.scored.len(),
            eligible: selection.scored.iter().filter(|s| s.is_eligible()).count(),
            candidates: selection.candidates,
            market,
            regime,
            weights_version: weights.version,
            tracked,
            paper,
            degraded: view.degraded,
            explanations,
            failures,
        })
    }
}
