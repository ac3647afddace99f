//! Versioned weight log and daily regimes.
//!
//! Both are append-only: a weight set is published once per effective
//! date and a regime once per trading day. Readers select by date, so the
//! nightly writer never races the hourly reader.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;

use super::{date_from_db, date_to_db, decimal_from_db, ts_to_db, Store};
use crate::types::{CoreError, CoreResult, Regime, WeightSet};

impl Store {
    /// Latest weight set whose effective date is on or before `date`.
    pub async fn weights_effective(&self, date: NaiveDate) -> CoreResult<WeightSet> {
        let row = sqlx::query(
            "SELECT version, effective_from, weights_json, note FROM weight_sets
             WHERE effective_from <= ? ORDER BY effective_from DESC LIMIT 1",
        )
        .bind(date_to_db(date))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => weight_set_from_row(&r),
            None => Err(CoreError::Config(format!("no weight set effective on {date}"))),
        }
    }

    /// Append a weight set for `effective_from`. If one already exists for
    /// that date it is returned unchanged and the flag is false.
    pub async fn publish_weights(
        &self,
        effective_from: NaiveDate,
        weights: &BTreeMap<String, f64>,
        note: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<(WeightSet, bool)> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO weight_sets (effective_from, weights_json, note, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(date_to_db(effective_from))
        .bind(serde_json::to_string(weights)?)
        .bind(note)
        .bind(ts_to_db(now))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT version, effective_from, weights_json, note FROM weight_sets WHERE effective_from = ?",
        )
        .bind(date_to_db(effective_from))
        .fetch_one(&self.pool)
        .await?;
        Ok((weight_set_from_row(&row)?, res.rows_affected() == 1))
    }

    /// Most recent weight sets, newest first.
    pub async fn weight_history(&self, limit: usize) -> CoreResult<Vec<WeightSet>> {
        let rows = sqlx::query(
            "SELECT version, effective_from, weights_json, note FROM weight_sets
             ORDER BY effective_from DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(weight_set_from_row).collect()
    }

    /// Record the regime for a trading day. Returns false if already set.
    pub async fn insert_regime(&self, regime: &Regime, now: DateTime<Utc>) -> CoreResult<bool> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO regimes (date, label, sample_count, win_rate, avg_return, day_pnl, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(date_to_db(regime.date))
        .bind(regime.label.to_string())
        .bind(regime.sample_count as i64)
        .bind(regime.win_rate)
        .bind(regime.avg_return)
        .bind(regime.day_pnl.to_string())
        .bind(ts_to_db(now))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn regime_on(&self, date: NaiveDate) -> CoreResult<Option<Regime>> {
        let row = sqlx::query(
            "SELECT date, label, sample_count, win_rate, avg_return, day_pnl FROM regimes WHERE date = ?",
        )
        .bind(date_to_db(date))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| regime_from_row(&r)).transpose()
    }

    /// Most recent regime recorded on or before `date`.
    pub async fn regime_effective(&self, date: NaiveDate) -> CoreResult<Option<Regime>> {
        let row = sqlx::query(
            "SELECT date, label, sample_count, win_rate, avg_return, day_pnl FROM regimes
             WHERE date <= ? ORDER BY date DESC LIMIT 1",
        )
        .bind(date_to_db(date))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| regime_from_row(&r)).transpose()
    }

    pub async fn latest_regime(&self) -> CoreResult<Option<Regime>> {
        let row = sqlx::query(
            "SELECT date, label, sample_count, win_rate, avg_return, day_pnl FROM regimes
             ORDER BY date DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| regime_from_row(&r)).transpose()
    }
}

fn weight_set_from_row(r: &SqliteRow) -> CoreResult<WeightSet> {
    Ok(WeightSet {
        version: r.try_get("version")?,
        effective_from: date_from_db(&r.try_get::<String, _>("effective_from")?)?,
        weights: serde_json::from_str(&r.try_get::<String, _>("weights_json")?)?,
        note: r.try_get("note")?,
    })
}

fn regime_from_row(r: &SqliteRow) -> CoreResult<Regime> {
    Ok(Regime {
        date: date_from_db(&r.try_get::<String, _>("date")?)?,
        label: r.try_get::<String, _>("label")?.parse()?,
        sample_count: r.try_get::<i64, _>("sample_count")? as usize,
        win_rate: r.try_get("win_rate")?,
        avg_return: r.try_get("avg_return")?,
        day_pnl: decimal_from_db(&r.try_get::<String, _>("day_pnl")?)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
