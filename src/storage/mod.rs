//! Persistence layer.
//!
//! SQLite via `sqlx`. Every fact table carries a uniqueness constraint on
//! its natural key and is written with `INSERT OR IGNORE`, so a duplicate
//! invocation is absorbed instead of double-applied. The two multi-row
//! units (a run with its candidates, and an order with its position and
//! account update) are written inside one transaction each.
//!
//! Timestamps are stored as Unix seconds, dates as `YYYY-MM-DD`, money as
//! decimal text.

pub mod history;
pub mod adaptive;
pub mod ledger;
pub mod markers;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use crate::scoring::default_weights;
use crate::types::{CoreError, CoreResult};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS runs (
        run_id        TEXT PRIMARY KEY,
        cycle_ts      INTEGER NOT NULL UNIQUE,
        status        TEXT NOT NULL,
        universe_size INTEGER NOT NULL DEFAULT 0,
        created_at    INTEGER NOT NULL,
        completed_at  INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS candidates (
        run_id             TEXT NOT NULL REFERENCES runs(run_id),
        instrument_id      TEXT NOT NULL,
        name               TEXT NOT NULL,
        rank               INTEGER NOT NULL,
        score              REAL NOT NULL,
        price              TEXT NOT NULL,
        features_json      TEXT NOT NULL,
        contributions_json TEXT NOT NULL,
        rationale          TEXT NOT NULL,
        PRIMARY KEY (run_id, instrument_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS price_snapshots (
        instrument_id TEXT NOT NULL,
        observed_at   INTEGER NOT NULL,
        price         TEXT NOT NULL,
        volume        REAL NOT NULL,
        PRIMARY KEY (instrument_id, observed_at)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS outcomes (
        run_id           TEXT NOT NULL,
        instrument_id    TEXT NOT NULL,
        horizon          TEXT NOT NULL,
        cycle_ts         INTEGER NOT NULL,
        entry_price      TEXT NOT NULL,
        exit_price       TEXT NOT NULL,
        exit_observed_at INTEGER NOT NULL,
        realized_return  REAL NOT NULL,
        computed_at      INTEGER NOT NULL,
        PRIMARY KEY (run_id, instrument_id, horizon)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS weight_sets (
        version        INTEGER PRIMARY KEY AUTOINCREMENT,
        effective_from TEXT NOT NULL UNIQUE,
        weights_json   TEXT NOT NULL,
        note           TEXT NOT NULL,
        created_at     INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS regimes (
        date         TEXT PRIMARY KEY,
        label        TEXT NOT NULL,
        sample_count INTEGER NOT NULL,
        win_rate     REAL NOT NULL,
        avg_return   REAL NOT NULL,
        day_pnl      TEXT NOT NULL,
        created_at   INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS paper_account (
        id           INTEGER PRIMARY KEY CHECK (id = 1),
        cash         TEXT NOT NULL,
        nav          TEXT NOT NULL,
        realized_pnl TEXT NOT NULL,
        updated_at   INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS paper_positions (
        instrument_id TEXT PRIMARY KEY,
        quantity      INTEGER NOT NULL CHECK (quantity > 0),
        average_cost  TEXT NOT NULL,
        opened_at     INTEGER NOT NULL,
        last_price    TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS paper_orders (
        order_id      TEXT PRIMARY KEY,
        run_id        TEXT NOT NULL,
        instrument_id TEXT NOT NULL,
        side          TEXT NOT NULL,
        quantity      INTEGER NOT NULL CHECK (quantity > 0),
        price         TEXT NOT NULL,
        fee           TEXT NOT NULL,
        slippage      TEXT NOT NULL,
        reason        TEXT NOT NULL,
        ts            INTEGER NOT NULL,
        UNIQUE (run_id, instrument_id, side)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS cycle_markers (
        kind         TEXT NOT NULL,
        boundary     TEXT NOT NULL,
        status       TEXT NOT NULL,
        started_at   INTEGER NOT NULL,
        heartbeat_at INTEGER NOT NULL,
        finished_at  INTEGER,
        detail       TEXT,
        PRIMARY KEY (kind, boundary)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS heartbeats (
        component TEXT PRIMARY KEY,
        beat_at   INTEGER NOT NULL,
        detail    TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_outcomes_horizon ON outcomes (horizon, cycle_ts)",
    "CREATE INDEX IF NOT EXISTS idx_orders_ts ON paper_orders (ts)",
];

/// Date from which the seed weight set is effective.
pub const SEED_WEIGHTS_DATE: &str = "1970-01-01";

/// Handle to the SQLite database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) a database file and ensure the schema.
    pub async fn connect(path: &str) -> CoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(path, "Store opened");
        Ok(store)
    }

    /// Private in-memory database (single connection), for tests and dry runs.
    pub async fn in_memory() -> CoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> CoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        let weights_json = serde_json::to_string(&default_weights())?;
        let seeded = sqlx::query(
            "INSERT OR IGNORE INTO weight_sets (effective_from, weights_json, note, created_at)
             VALUES (?, ?, 'seed', 0)",
        )
        .bind(SEED_WEIGHTS_DATE)
        .bind(weights_json)
        .execute(&self.pool)
        .await?;
        debug!(seeded = seeded.rows_affected(), "Schema ready");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

pub(crate) fn ts_to_db(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

pub(crate) fn ts_from_db(secs: i64) -> CoreResult<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| decode_error(format!("invalid timestamp {secs}")))
}

pub(crate) fn date_to_db(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn date_from_db(s: &str) -> CoreResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| decode_error(format!("invalid date {s}: {e}")))
}

pub(crate) fn decimal_from_db(s: &str) -> CoreResult<Decimal> {
    Decimal::from_str(s).map_err(|e| decode_error(format!("invalid decimal {s}: {e}")))
}

fn decode_error(msg: String) -> CoreError {
    CoreError::Storage(sqlx::Error::Decode(msg.into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
