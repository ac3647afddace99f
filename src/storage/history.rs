//! Runs, candidates, price snapshots and outcomes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;

use super::{decimal_from_db, ts_from_db, ts_to_db, Store};
use crate::types::{Candidate, CoreError, CoreResult, Horizon, Outcome, PriceSnapshot, Run, RunStatus};

/// A candidate still waiting for an outcome at some horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOutcome {
    pub run_id: String,
    pub instrument_id: String,
    pub cycle_ts: DateTime<Utc>,
    pub price: Decimal,
}

/// A tracked outcome joined back to the candidate's features.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeSample {
    pub run_id: String,
    pub instrument_id: String,
    pub cycle_ts: DateTime<Utc>,
    pub rank: u32,
    pub score: f64,
    pub features: BTreeMap<String, f64>,
    pub realized_return: f64,
}

/// One candidate row for strategy backtests; `ret_1d` is absent until tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedResult {
    pub run_id: String,
    pub cycle_ts: DateTime<Utc>,
    pub rank: u32,
    pub score: f64,
    pub ret_1d: Option<f64>,
}

impl Store {
    // -- Runs ----------------------------------------------------------------

    /// Persist a run and all its candidates as one unit. A second run for the
    /// same cycle timestamp fails with `AlreadyRun` and writes nothing.
    pub async fn insert_run_with_candidates(
        &self,
        run: &Run,
        candidates: &[Candidate],
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO runs (run_id, cycle_ts, status, universe_size, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.run_id)
        .bind(ts_to_db(run.cycle_ts))
        .bind(run.status.to_string())
        .bind(run.universe_size as i64)
        .bind(ts_to_db(now))
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            return match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    Err(CoreError::AlreadyRun(run.cycle_ts.to_rfc3339()))
                }
                other => Err(other.into()),
            };
        }

        for c in candidates {
            sqlx::query(
                "INSERT INTO candidates
                 (run_id, instrument_id, name, rank, score, price, features_json, contributions_json, rationale)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&run.run_id)
            .bind(&c.instrument_id)
            .bind(&c.name)
            .bind(c.rank as i64)
            .bind(c.score)
            .bind(c.price.to_string())
            .bind(serde_json::to_string(&c.features)?)
            .bind(serde_json::to_string(&c.contributions)?)
            .bind(&c.rationale)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query("UPDATE runs SET status = ?, completed_at = ? WHERE run_id = ?")
            .bind(status.to_string())
            .bind(ts_to_db(now))
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn run_for_cycle(&self, cycle_ts: DateTime<Utc>) -> CoreResult<Option<Run>> {
        let row = sqlx::query("SELECT run_id, cycle_ts, status, universe_size FROM runs WHERE cycle_ts = ?")
            .bind(ts_to_db(cycle_ts))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    pub async fn latest_run(&self) -> CoreResult<Option<Run>> {
        let row = sqlx::query(
            "SELECT run_id, cycle_ts, status, universe_size FROM runs ORDER BY cycle_ts DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    pub async fn count_runs(&self) -> CoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM runs").fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    pub async fn candidates_for_run(&self, run_id: &str) -> CoreResult<Vec<Candidate>> {
        let rows = sqlx::query(
            "SELECT run_id, instrument_id, name, rank, score, price, features_json, contributions_json, rationale
             FROM candidates WHERE run_id = ? ORDER BY rank",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    // -- Snapshots -----------------------------------------------------------

    /// Append snapshots; rows already present for (instrument, observed_at)
    /// are left untouched. Returns the number of new rows.
    pub async fn insert_snapshots(&self, snapshots: &[PriceSnapshot]) -> CoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for s in snapshots {
            let res = sqlx::query(
                "INSERT OR IGNORE INTO price_snapshots (instrument_id, observed_at, price, volume)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&s.instrument_id)
            .bind(ts_to_db(s.observed_at))
            .bind(s.price.to_string())
            .bind(s.volume)
            .execute(&mut *tx)
            .await?;
            written += res.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Snapshots for an instrument with `from <= observed_at <= to`, oldest first.
    pub async fn snapshot_history(
        &self,
        instrument_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<PriceSnapshot>> {
        let rows = sqlx::query(
            "SELECT instrument_id, observed_at, price, volume FROM price_snapshots
             WHERE instrument_id = ? AND observed_at >= ? AND observed_at <= ?
             ORDER BY observed_at",
        )
        .bind(instrument_id)
        .bind(ts_to_db(from))
        .bind(ts_to_db(to))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    /// Earliest snapshot with `not_before <= observed_at <= as_of`.
    pub async fn first_snapshot_between(
        &self,
        instrument_id: &str,
        not_before: DateTime<Utc>,
        as_of: DateTime<Utc>,
    ) -> CoreResult<Option<PriceSnapshot>> {
        let row = sqlx::query(
            "SELECT instrument_id, observed_at, price, volume FROM price_snapshots
             WHERE instrument_id = ? AND observed_at >= ? AND observed_at <= ?
             ORDER BY observed_at ASC LIMIT 1",
        )
        .bind(instrument_id)
        .bind(ts_to_db(not_before))
        .bind(ts_to_db(as_of))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| snapshot_from_row(&r)).transpose()
    }

    // -- Outcomes ------------------------------------------------------------

    /// Candidates from cycles at or before `cycle_cutoff` with no outcome yet
    /// at `horizon`.
    pub async fn pending_outcomes(
        &self,
        horizon: Horizon,
        cycle_cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<PendingOutcome>> {
        let rows = sqlx::query(
            "SELECT c.run_id, c.instrument_id, r.cycle_ts, c.price
             FROM candidates c
             JOIN runs r ON r.run_id = c.run_id
             LEFT JOIN outcomes o
               ON o.run_id = c.run_id AND o.instrument_id = c.instrument_id AND o.horizon = ?
             WHERE o.run_id IS NULL AND r.cycle_ts <= ?
             ORDER BY r.cycle_ts, c.rank",
        )
        .bind(horizon.as_str())
        .bind(ts_to_db(cycle_cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(PendingOutcome {
                    run_id: r.try_get("run_id")?,
                    instrument_id: r.try_get("instrument_id")?,
                    cycle_ts: ts_from_db(r.try_get("cycle_ts")?)?,
                    price: decimal_from_db(&r.try_get::<String, _>("price")?)?,
                })
            })
            .collect()
    }

    /// Write an outcome once. Returns false when it already existed.
    pub async fn insert_outcome(&self, outcome: &Outcome, now: DateTime<Utc>) -> CoreResult<bool> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO outcomes
             (run_id, instrument_id, horizon, cycle_ts, entry_price, exit_price, exit_observed_at, realized_return, computed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&outcome.run_id)
        .bind(&outcome.instrument_id)
        .bind(outcome.horizon.as_str())
        .bind(ts_to_db(outcome.cycle_ts))
        .bind(outcome.entry_price.to_string())
        .bind(outcome.exit_price.to_string())
        .bind(ts_to_db(outcome.exit_observed_at))
        .bind(outcome.realized_return)
        .bind(ts_to_db(now))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn outcomes_for_run(&self, run_id: &str) -> CoreResult<Vec<Outcome>> {
        let rows = sqlx::query(
            "SELECT run_id, instrument_id, horizon, cycle_ts, entry_price, exit_price, exit_observed_at, realized_return
             FROM outcomes WHERE run_id = ? ORDER BY instrument_id, horizon",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(outcome_from_row).collect()
    }

    pub async fn count_outcomes(&self) -> CoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM outcomes").fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    /// Outcomes at `horizon` for cycles in `[since, until]`, most recent
    /// first, joined to the candidate's features.
    pub async fn outcome_samples(
        &self,
        horizon: Horizon,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<OutcomeSample>> {
        let rows = sqlx::query(
            "SELECT o.run_id, o.instrument_id, o.cycle_ts, c.rank, c.score, c.features_json, o.realized_return
             FROM outcomes o
             JOIN candidates c ON c.run_id = o.run_id AND c.instrument_id = o.instrument_id
             WHERE o.horizon = ? AND o.cycle_ts >= ? AND o.cycle_ts <= ?
             ORDER BY o.cycle_ts DESC, c.rank ASC
             LIMIT ?",
        )
        .bind(horizon.as_str())
        .bind(ts_to_db(since))
        .bind(ts_to_db(until))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(OutcomeSample {
                    run_id: r.try_get("run_id")?,
                    instrument_id: r.try_get("instrument_id")?,
                    cycle_ts: ts_from_db(r.try_get("cycle_ts")?)?,
                    rank: r.try_get::<i64, _>("rank")? as u32,
                    score: r.try_get("score")?,
                    features: serde_json::from_str(&r.try_get::<String, _>("features_json")?)?,
                    realized_return: r.try_get("realized_return")?,
                })
            })
            .collect()
    }

    /// Distinct cycle timestamps that have an outcome at `horizon` by `until`.
    pub async fn outcome_cycle_times(
        &self,
        horizon: Horizon,
        until: DateTime<Utc>,
    ) -> CoreResult<Vec<DateTime<Utc>>> {
        let rows = sqlx::query(
            "SELECT DISTINCT cycle_ts FROM outcomes WHERE horizon = ? AND cycle_ts <= ? ORDER BY cycle_ts",
        )
        .bind(horizon.as_str())
        .bind(ts_to_db(until))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| ts_from_db(r.try_get("cycle_ts")?)).collect()
    }

    /// Every candidate of runs in `[since, until]` with its 1d outcome if any.
    pub async fn ranked_results(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> CoreResult<Vec<RankedResult>> {
        let rows = sqlx::query(
            "SELECT c.run_id, r.cycle_ts, c.rank, c.score, o.realized_return
             FROM candidates c
             JOIN runs r ON r.run_id = c.run_id
             LEFT JOIN outcomes o
               ON o.run_id = c.run_id AND o.instrument_id = c.instrument_id AND o.horizon = '1d'
             WHERE r.cycle_ts >= ? AND r.cycle_ts <= ?
             ORDER BY r.cycle_ts, c.rank",
        )
        .bind(ts_to_db(since))
        .bind(ts_to_db(until))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(RankedResult {
                    run_id: r.try_get("run_id")?,
                    cycle_ts: ts_from_db(r.try_get("cycle_ts")?)?,
                    rank: r.try_get::<i64, _>("rank")? as u32,
                    score: r.try_get("score")?,
                    ret_1d: r.try_get("realized_return")?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn run_from_row(r: &SqliteRow) -> CoreResult<Run> {
    Ok(Run {
        run_id: r.try_get("run_id")?,
        cycle_ts: ts_from_db(r.try_get("cycle_ts")?)?,
        status: r.try_get::<String, _>("status")?.parse()?,
        universe_size: r.try_get::<i64, _>("universe_size")? as usize,
    })
}

fn candidate_from_row(r: &SqliteRow) -> CoreResult<Candidate> {
    Ok(Candidate {
        run_id: r.try_get("run_id")?,
        instrument_id: r.try_get("instrument_id")?,
        name: r.try_get("name")?,
        rank: r.try_get::<i64, _>("rank")? as u32,
        score: r.try_get("score")?,
        price: decimal_from_db(&r.try_get::<String, _>("price")?)?,
        features: serde_json::from_str(&r.try_get::<String, _>("features_json")?)?,
        contributions: serde_json::from_str(&r.try_get::<String, _>("contributions_json")?)?,
        rationale: r.try_get("rationale")?,
    })
}

fn snapshot_from_row(r: &SqliteRow) -> CoreResult<PriceSnapshot> {
    Ok(PriceSnapshot {
        instrument_id: r.try_get("instrument_id")?,
        observed_at: ts_from_db(r.try_get("observed_at")?)?,
        price: decimal_from_db(&r.try_get::<String, _>("price")?)?,
        volume: r.try_get("volume")?,
    })
}

fn outcome_from_row(r: &SqliteRow) -> CoreResult<Outcome> {
    Ok(Outcome {
        run_id: r.try_get("run_id")?,
        instrument_id: r.try_get("instrument_id")?,
        horizon: r.try_get::<String, _>("horizon")?.parse()?,
        cycle_ts: ts_from_db(r.try_get("cycle_ts")?)?,
        entry_price: decimal_from_db(&r.try_get::<String, _>("entry_price")?)?,
        exit_price: decimal_from_db(&r.try_get::<String, _>("exit_price")?)?,
        exit_observed_at: ts_from_db(r.try_get("exit_observed_at")?)?,
        realized_return: r.try_get("realized_return")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, h, 0, 0).unwrap()
    }

    fn run(id: &str, ts: DateTime<Utc>) -> Run {
        Run {
            run_id: id.into(),
            cycle_ts: ts,
            status: RunStatus::Running,
            universe_size: 2,
        }
    }

    fn candidate(run_id: &str, id: &str, rank: u32) -> Candidate {
        Candidate {
            run_id: run_id.into(),
            instrument_id: id.into(),
            name: format!("{id} Corp"),
            rank,
            score: 70.0 - rank as f64,
            price: dec!(100),
            features: BTreeMap::from([("rs_5".to_string(), 0.02)]),
            contributions: BTreeMap::from([("rs_5".to_string(), 3.5)]),
            rationale: "rs_5".into(),
        }
    }

    #[tokio::test]
    async fn test_run_with_candidates_is_atomic_and_unique() {
        let store = Store::in_memory().await.unwrap();
        let r = run("r1", t(1));
        store
            .insert_run_with_candidates(&r, &[candidate("r1", "AAA", 1), candidate("r1", "BBB", 2)], t(1))
            .await
            .unwrap();

        let dup = run("r2", t(1));
        let err = store
            .insert_run_with_candidates(&dup, &[candidate("r2", "AAA", 1)], t(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyRun(_)));
        assert_eq!(store.count_runs().await.unwrap(), 1);
        assert!(store.candidates_for_run("r2").await.unwrap().is_empty());

        let loaded = store.candidates_for_run("r1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].instrument_id, "AAA");
        assert_eq!(loaded[0].features["rs_5"], 0.02);
    }

    #[tokio::test]
    async fn test_failed_candidate_rolls_back_run() {
        let store = Store::in_memory().await.unwrap();
        // duplicate (run_id, instrument_id) violates the candidate key
        let r = run("r1", t(1));
        let res = store
            .insert_run_with_candidates(&r, &[candidate("r1", "AAA", 1), candidate("r1", "AAA", 2)], t(1))
            .await;
        assert!(res.is_err());
        assert_eq!(store.count_runs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshots_append_only() {
        let store = Store::in_memory().await.unwrap();
        let snap = PriceSnapshot {
            instrument_id: "AAA".into(),
            observed_at: t(1),
            price: dec!(100),
            volume: 10.0,
        };
        assert_eq!(store.insert_snapshots(&[snap.clone()]).await.unwrap(), 1);
        let changed = PriceSnapshot { price: dec!(999), ..snap };
        assert_eq!(store.insert_snapshots(&[changed]).await.unwrap(), 0);

        let hist = store.snapshot_history("AAA", t(0), t(5)).await.unwrap();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].price, dec!(100));
    }

    #[tokio::test]
    async fn test_first_snapshot_between_respects_bounds() {
        let store = Store::in_memory().await.unwrap();
        let snaps: Vec<PriceSnapshot> = [1, 3, 5]
            .iter()
            .map(|h| PriceSnapshot {
                instrument_id: "AAA".into(),
                observed_at: t(*h),
                price: Decimal::from(100 + h),
                volume: 1.0,
            })
            .collect();
        store.insert_snapshots(&snaps).await.unwrap();

        let s = store.first_snapshot_between("AAA", t(2), t(6)).await.unwrap().unwrap();
        assert_eq!(s.observed_at, t(3));
        let within = store
            .first_snapshot_between("AAA", t(2), t(2) + Duration::minutes(30))
            .await
            .unwrap();
        assert!(within.is_none());
    }

    #[tokio::test]
    async fn test_pending_outcomes_and_insert_once() {
        let store = Store::in_memory().await.unwrap();
        store
            .insert_run_with_candidates(&run("r1", t(1)), &[candidate("r1", "AAA", 1)], t(1))
            .await
            .unwrap();

        let pending = store.pending_outcomes(Horizon::H1, t(1)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(store.pending_outcomes(Horizon::H1, t(0)).await.unwrap().is_empty());

        let outcome = Outcome {
            run_id: "r1".into(),
            instrument_id: "AAA".into(),
            horizon: Horizon::H1,
            cycle_ts: t(1),
            entry_price: dec!(100),
            exit_price: dec!(102),
            exit_observed_at: t(2),
            realized_return: 0.02,
        };
        assert!(store.insert_outcome(&outcome, t(2)).await.unwrap());
        assert!(!store.insert_outcome(&Outcome { realized_return: 9.9, ..outcome }, t(3)).await.unwrap());
        assert!(store.pending_outcomes(Horizon::H1, t(1)).await.unwrap().is_empty());

        let stored = store.outcomes_for_run("r1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].realized_return, 0.02);

        let samples = store.outcome_samples(Horizon::H1, t(0), t(5), 10).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].features["rs_5"], 0.02);
        assert!(store.outcome_samples(Horizon::D1, t(0), t(5), 10).await.unwrap().is_empty());
    }
}
