//! The nightly adaptation batch.
//!
//! Claims the local date, catches up outcomes, then publishes the next
//! trading day's weight set and regime. Diagnostics and the strategy lab
//! are computed for the report only.

use chrono::{DateTime, Duration, Utc};
use tracing::{error, warn};

use super::coordinator::CycleKind;
use super::report::{failure_notes, NightlyReport};
use super::Engine;
use crate::adapt::diagnostics::diagnose;
use crate::backtest::LabReport;
use crate::types::{CoreResult, Horizon};

impl Engine {
    /// Run the batch for the local day containing `now`. A second call for
    /// the same day is `AlreadyRun`.
    pub async fn run_nightly(&self, now: DateTime<Utc>) -> CoreResult<NightlyReport> {
        let today = self.clock.local_date(now);
        let lease = self
            .coordinator
            .acquire(CycleKind::Nightly, &today.to_string(), now)
            .await?;

        match self.nightly_batch(now).await {
            Ok(report) => {
                let detail = format!(
                    "{} weights v{} regime {}",
                    report.target, report.weights_version, report.regime.label
                );
                self.coordinator.complete(&lease, now, &detail).await?;
                self.coordinator.heartbeat(CycleKind::Nightly.as_str(), now, &detail).await?;
                report.log();
                self.notify(&report.render()).await;
                Ok(report)
            }
            Err(e) => {
                error!(date = %today, error = %e, "Nightly batch failed");
                if let Err(mark) = self.coordinator.fail(&lease, now, &e.to_string()).await {
                    warn!(error = %mark, "Could not record batch failure");
                }
                Err(e)
            }
        }
    }

    async fn nightly_batch(&self, now: DateTime<Utc>) -> CoreResult<NightlyReport> {
        let tracked = self.tracker.track(now).await?;

        let target = self
            .clock
            .next_trading_day(self.calendar.as_ref(), self.clock.local_date(now));
        let tune = self.tuner.run(now, target).await?;
        let (regime, regime_inserted) = self.classifier.run(now, target).await?;

        let cfg = &self.config.adaptation;
        let samples = self
            .store
            .outcome_samples(Horizon::D1, now - Duration::days(cfg.lookback_days), now, cfg.max_samples)
            .await?;
        let diagnostics = diagnose(&samples, cfg);

        let lab = self.run_lab(now).await?;

        let markers = self.store.recent_markers(50).await?;
        let failures = failure_notes(&markers, now - Duration::days(1));

        Ok(NightlyReport {
            as_of: now,
            target,
            tracked,
            tune_status: tune.status,
            weights_version: tune.published.version,
            weights_inserted: tune.inserted,
            signals: tune.signals,
            regime,
            regime_inserted,
            diagnostics,
            lab,
            failures,
        })
    }

    /// Strategy lab over the configured lookback. Read-only.
    pub async fn run_lab(&self, now: DateTime<Utc>) -> CoreResult<LabReport> {
        self.lab.run(now).await
    }
}
