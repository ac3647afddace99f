//! Run coordination.
//!
//! At most one active execution per (kind, boundary). A cycle claims its
//! boundary by inserting a marker row; a second invocation finds the row
//! and stands down. A marker left `running` by a crashed process can be
//! taken over once its heartbeat is older than the takeover window, and a
//! `failed` marker may be retried. Completed boundaries are never re-run.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::storage::markers::MarkerStatus;
use crate::storage::Store;
use crate::types::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Hourly,
    Nightly,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::Hourly => "hourly",
            CycleKind::Nightly => "nightly",
        }
    }
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof that the holder owns one (kind, boundary).
#[derive(Debug, Clone, PartialEq)]
pub struct CycleLease {
    pub kind: CycleKind,
    pub boundary: String,
}

/// Heartbeat freshness for the liveness probe.
#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    pub component: Option<String>,
    pub last_beat: Option<DateTime<Utc>>,
    pub detail: Option<String>,
    pub age_secs: Option<i64>,
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct RunCoordinator {
    store: Store,
    takeover_after: Duration,
    stale_after: Duration,
}

impl RunCoordinator {
    pub fn new(store: Store, takeover_after_secs: i64, stale_after_secs: i64) -> Self {
        Self {
            store,
            takeover_after: Duration::seconds(takeover_after_secs),
            stale_after: Duration::seconds(stale_after_secs),
        }
    }

    /// Claim `boundary`. `AlreadyRun` if it completed or is live elsewhere.
    pub async fn acquire(
        &self,
        kind: CycleKind,
        boundary: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<CycleLease> {
        let lease = CycleLease {
            kind,
            boundary: boundary.to_string(),
        };
        if self.store.try_insert_marker(kind.as_str(), boundary, now).await? {
            info!(%kind, boundary, "Cycle claimed");
            return Ok(lease);
        }

        let Some(marker) = self.store.marker(kind.as_str(), boundary).await? else {
            // Deleted between the insert and the read; try once more.
            return if self.store.try_insert_marker(kind.as_str(), boundary, now).await? {
                Ok(lease)
            } else {
                Err(CoreError::AlreadyRun(format!("{kind} {boundary}")))
            };
        };

        match marker.status {
            MarkerStatus::Completed => Err(CoreError::AlreadyRun(format!("{kind} {boundary} completed"))),
            MarkerStatus::Running if now - marker.heartbeat_at < self.takeover_after => {
                Err(CoreError::AlreadyRun(format!("{kind} {boundary} in progress")))
            }
            status => {
                if self
                    .store
                    .reclaim_marker(kind.as_str(), boundary, marker.heartbeat_at, now)
                    .await?
                {
                    warn!(%kind, boundary, previous = %status, "Reclaimed cycle marker");
                    Ok(lease)
                } else {
                    Err(CoreError::AlreadyRun(format!("{kind} {boundary} claimed by another process")))
                }
            }
        }
    }

    /// Keep the lease alive during a long cycle.
    pub async fn touch(&self, lease: &CycleLease, now: DateTime<Utc>) -> CoreResult<()> {
        self.store.touch_marker(lease.kind.as_str(), &lease.boundary, now).await
    }

    pub async fn complete(&self, lease: &CycleLease, now: DateTime<Utc>, detail: &str) -> CoreResult<()> {
        self.store
            .finish_marker(lease.kind.as_str(), &lease.boundary, MarkerStatus::Completed, now, detail)
            .await
    }

    pub async fn fail(&self, lease: &CycleLease, now: DateTime<Utc>, detail: &str) -> CoreResult<()> {
        self.store
            .finish_marker(lease.kind.as_str(), &lease.boundary, MarkerStatus::Failed, now, detail)
            .await
    }

    /// Record that `component` is alive.
    pub async fn heartbeat(&self, component: &str, now: DateTime<Utc>, detail: &str) -> CoreResult<()> {
        self.store.beat(component, now, detail).await
    }

    pub async fn liveness(&self, now: DateTime<Utc>) -> CoreResult<Liveness> {
        Ok(match self.store.latest_beat().await? {
            Some((component, at, detail)) => {
                let age = now - at;
                Liveness {
                    component: Some(component),
                    last_beat: Some(at),
                    detail: Some(detail),
                    age_secs: Some(age.num_seconds()),
                    stale: age > self.stale_after,
                }
            }
            None => Liveness {
                component: None,
                last_beat: None,
                detail: None,
                age_secs: None,
                stale: true,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 6, 1, 0, 0).unwrap()
    }

    async fn coordinator() -> RunCoordinator {
        RunCoordinator::new(Store::in_memory().await.unwrap(), 1800, 7800)
    }

    #[tokio::test]
    async fn test_second_acquire_is_rejected() {
        let c = coordinator().await;
        let lease = c.acquire(CycleKind::Hourly, "b1", t0()).await.unwrap();
        assert_eq!(lease.boundary, "b1");

        let err = c.acquire(CycleKind::Hourly, "b1", t0()).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyRun(_)));

        // different kind, same boundary string, is independent
        assert!(c.acquire(CycleKind::Nightly, "b1", t0()).await.is_ok());
    }

    #[tokio::test]
    async fn test_completed_is_never_rerun() {
        let c = coordinator().await;
        let lease = c.acquire(CycleKind::Hourly, "b1", t0()).await.unwrap();
        c.complete(&lease, t0(), "ok").await.unwrap();

        let later = t0() + Duration::days(2);
        assert!(matches!(
            c.acquire(CycleKind::Hourly, "b1", later).await,
            Err(CoreError::AlreadyRun(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_and_abandoned_can_be_reclaimed() {
        let c = coordinator().await;
        let lease = c.acquire(CycleKind::Hourly, "b1", t0()).await.unwrap();
        c.fail(&lease, t0(), "boom").await.unwrap();
        assert!(c.acquire(CycleKind::Hourly, "b1", t0() + Duration::seconds(5)).await.is_ok());

        c.acquire(CycleKind::Hourly, "b2", t0()).await.unwrap();
        // still fresh
        assert!(c.acquire(CycleKind::Hourly, "b2", t0() + Duration::minutes(10)).await.is_err());
        // abandoned past the takeover window
        assert!(c.acquire(CycleKind::Hourly, "b2", t0() + Duration::minutes(31)).await.is_ok());
    }

    #[tokio::test]
    async fn test_touch_keeps_lease_alive() {
        let c = coordinator().await;
        let lease = c.acquire(CycleKind::Nightly, "2026-01-06", t0()).await.unwrap();
        c.touch(&lease, t0() + Duration::minutes(25)).await.unwrap();
        assert!(c
            .acquire(CycleKind::Nightly, "2026-01-06", t0() + Duration::minutes(40))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_liveness() {
        let c = coordinator().await;
        assert!(c.liveness(t0()).await.unwrap().stale);

        c.heartbeat("hourly", t0(), "run ok").await.unwrap();
        let fresh = c.liveness(t0() + Duration::minutes(5)).await.unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.age_secs, Some(300));
        assert_eq!(fresh.component.as_deref(), Some("hourly"));

        assert!(c.liveness(t0() + Duration::hours(3)).await.unwrap().stale);
    }
}
