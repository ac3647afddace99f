//! Outcome tracking.
//!
//! For every candidate and every horizon whose window has elapsed, finds
//! the first stored price observed at or after `cycle_ts + horizon` and
//! records the realized return. An outcome is never written from a price
//! observed before its horizon, and each (run, instrument, horizon) is
//! written at most once, so the tracker can run on every cycle.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::storage::Store;
use crate::types::{CoreResult, Horizon, Outcome};

/// `exit / entry - 1`, or `None` for a non-positive entry.
pub fn realized_return(entry: Decimal, exit: Decimal) -> Option<f64> {
    if entry <= Decimal::ZERO {
        return None;
    }
    (exit / entry - Decimal::ONE).to_f64()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackReport {
    pub written: usize,
    /// Due outcomes still waiting for a price at or after their horizon.
    pub waiting: usize,
    pub by_horizon: BTreeMap<Horizon, usize>,
}

pub struct OutcomeTracker {
    store: Store,
}

impl OutcomeTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Fill every outcome measurable with prices observed up to `as_of`.
    pub async fn track(&self, as_of: DateTime<Utc>) -> CoreResult<TrackReport> {
        let mut report = TrackReport::default();

        for horizon in Horizon::ALL {
            let pending = self.store.pending_outcomes(horizon, as_of - horizon.duration()).await?;
            let mut written = 0usize;

            for p in pending {
                let due = p.cycle_ts + horizon.duration();
                let Some(exit) = self.store.first_snapshot_between(&p.instrument_id, due, as_of).await? else {
                    report.waiting += 1;
                    continue;
                };
                let Some(ret) = realized_return(p.price, exit.price) else {
                    debug!(
                        run_id = %p.run_id,
                        instrument = %p.instrument_id,
                        "Non-positive entry price, skipped"
                    );
                    continue;
                };
                let outcome = Outcome {
                    run_id: p.run_id,
                    instrument_id: p.instrument_id,
                    horizon,
                    cycle_ts: p.cycle_ts,
                    entry_price: p.price,
                    exit_price: exit.price,
                    exit_observed_at: exit.observed_at,
                    realized_return: ret,
                };
                if self.store.insert_outcome(&outcome, as_of).await? {
                    written += 1;
                }
            }

            if written > 0 {
                report.by_horizon.insert(horizon, written);
            }
            report.written += written;
        }

        info!(written = report.written, waiting = report.waiting, "Outcomes tracked");
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candidate, PriceSnapshot, Run, RunStatus};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 6, 1, 0, 0).unwrap()
    }

    async fn seed(store: &Store) {
        let run = Run {
            run_id: "run-1".into(),
            cycle_ts: t0(),
            status: RunStatus::Completed,
            universe_size: 1,
        };
        let candidate = Candidate {
            run_id: "run-1".into(),
            instrument_id: "AAA".into(),
            name: "Alpha".into(),
            rank: 1,
            score: 70.0,
            price: dec!(100),
            features: BTreeMap::new(),
            contributions: BTreeMap::new(),
            rationale: String::new(),
        };
        store.insert_run_with_candidates(&run, &[candidate], t0()).await.unwrap();
    }

    fn snap(minutes: i64, price: Decimal) -> PriceSnapshot {
        PriceSnapshot {
            instrument_id: "AAA".into(),
            observed_at: t0() + Duration::minutes(minutes),
            price,
            volume: 1.0,
        }
    }

    #[test]
    fn test_realized_return() {
        assert!((realized_return(dec!(100), dec!(102)).unwrap() - 0.02).abs() < 1e-12);
        assert!(realized_return(Decimal::ZERO, dec!(1)).is_none());
    }

    #[tokio::test]
    async fn test_early_price_never_used() {
        let store = Store::in_memory().await.unwrap();
        seed(&store).await;
        store.insert_snapshots(&[snap(59, dec!(150))]).await.unwrap();

        let tracker = OutcomeTracker::new(store.clone());
        let r = tracker.track(t0() + Duration::minutes(61)).await.unwrap();
        assert_eq!(r.written, 0);
        assert_eq!(r.waiting, 1);

        store.insert_snapshots(&[snap(61, dec!(101))]).await.unwrap();
        let r = tracker.track(t0() + Duration::minutes(61)).await.unwrap();
        assert_eq!(r.written, 1);
        let outcomes = store.outcomes_for_run("run-1").await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].exit_price, dec!(101));
        assert!(outcomes[0].exit_observed_at >= t0() + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_tracking_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        seed(&store).await;
        store
            .insert_snapshots(&[snap(60, dec!(101)), snap(240, dec!(104)), snap(24 * 60, dec!(110))])
            .await
            .unwrap();

        let tracker = OutcomeTracker::new(store.clone());
        let as_of = t0() + Duration::days(1);
        let first = tracker.track(as_of).await.unwrap();
        assert_eq!(first.written, 3);
        assert_eq!(first.by_horizon.get(&Horizon::D1), Some(&1));

        let second = tracker.track(as_of).await.unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(store.count_outcomes().await.unwrap(), 3);
    }
}
