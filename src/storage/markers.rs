//! Cycle markers and liveness heartbeats.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

use super::{ts_from_db, ts_to_db, Store};
use crate::types::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for MarkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerStatus::Running => write!(f, "running"),
            MarkerStatus::Completed => write!(f, "completed"),
            MarkerStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for MarkerStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(MarkerStatus::Running),
            "completed" => Ok(MarkerStatus::Completed),
            "failed" => Ok(MarkerStatus::Failed),
            other => Err(CoreError::Config(format!("unknown marker status '{other}'"))),
        }
    }
}

/// Persisted lock for one (kind, boundary) cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub kind: String,
    pub boundary: String,
    pub status: MarkerStatus,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
}

impl Store {
    /// Claim a fresh marker. False if one exists for (kind, boundary).
    pub async fn try_insert_marker(
        &self,
        kind: &str,
        boundary: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO cycle_markers (kind, boundary, status, started_at, heartbeat_at)
             VALUES (?, ?, 'running', ?, ?)",
        )
        .bind(kind)
        .bind(boundary)
        .bind(ts_to_db(now))
        .bind(ts_to_db(now))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn marker(&self, kind: &str, boundary: &str) -> CoreResult<Option<Marker>> {
        let row = sqlx::query(
            "SELECT kind, boundary, status, started_at, heartbeat_at, finished_at, detail
             FROM cycle_markers WHERE kind = ? AND boundary = ?",
        )
        .bind(kind)
        .bind(boundary)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| marker_from_row(&r)).transpose()
    }

    /// Re-claim a failed or abandoned marker. Compare-and-set on the observed
    /// heartbeat so two contenders cannot both win.
    pub async fn reclaim_marker(
        &self,
        kind: &str,
        boundary: &str,
        seen_heartbeat: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let res = sqlx::query(
            "UPDATE cycle_markers
             SET status = 'running', started_at = ?, heartbeat_at = ?, finished_at = NULL, detail = NULL
             WHERE kind = ? AND boundary = ? AND heartbeat_at = ? AND status != 'completed'",
        )
        .bind(ts_to_db(now))
        .bind(ts_to_db(now))
        .bind(kind)
        .bind(boundary)
        .bind(ts_to_db(seen_heartbeat))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Refresh the heartbeat of a running marker.
    pub async fn touch_marker(&self, kind: &str, boundary: &str, now: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query(
            "UPDATE cycle_markers SET heartbeat_at = ? WHERE kind = ? AND boundary = ? AND status = 'running'",
        )
        .bind(ts_to_db(now))
        .bind(kind)
        .bind(boundary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_marker(
        &self,
        kind: &str,
        boundary: &str,
        status: MarkerStatus,
        now: DateTime<Utc>,
        detail: &str,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE cycle_markers SET status = ?, heartbeat_at = ?, finished_at = ?, detail = ?
             WHERE kind = ? AND boundary = ?",
        )
        .bind(status.to_string())
        .bind(ts_to_db(now))
        .bind(ts_to_db(now))
        .bind(detail)
        .bind(kind)
        .bind(boundary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_markers(&self, limit: usize) -> CoreResult<Vec<Marker>> {
        let rows = sqlx::query(
            "SELECT kind, boundary, status, started_at, heartbeat_at, finished_at, detail
             FROM cycle_markers ORDER BY heartbeat_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(marker_from_row).collect()
    }

    // -- Heartbeats ------------------------------------------------------------

    pub async fn beat(&self, component: &str, now: DateTime<Utc>, detail: &str) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO heartbeats (component, beat_at, detail) VALUES (?, ?, ?)
             ON CONFLICT (component) DO UPDATE SET beat_at = excluded.beat_at, detail = excluded.detail",
        )
        .bind(component)
        .bind(ts_to_db(now))
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent heartbeat across all components.
    pub async fn latest_beat(&self) -> CoreResult<Option<(String, DateTime<Utc>, String)>> {
        let row = sqlx::query("SELECT component, beat_at, detail FROM heartbeats ORDER BY beat_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some((
                r.try_get("component")?,
                ts_from_db(r.try_get("beat_at")?)?,
                r.try_get("detail")?,
            ))),
            None => Ok(None),
        }
    }
}

fn marker_from_row(r: &SqliteRow) -> CoreResult<Marker> {
    let finished: Option<i64> = r.try_get("finished_at")?;
    Ok(Marker {
        kind: r.try_get("kind")?,
        boundary: r.try_get("boundary")?,
        status: r.try_get::<String, _>("status")?.parse()?,
        started_at: ts_from_db(r.try_get("started_at")?)?,
        heartbeat_at: ts_from_db(r.try_get("heartbeat_at")?)?,
        finished_at: finished.map(ts_from_db).transpose()?,
        detail: r.try_get("detail")?,
    })
}
