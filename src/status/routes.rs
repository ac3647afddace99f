//! Status API route handlers.
//!
//! All endpoints return JSON read straight from the store, so the server
//! reflects cycles run by any process sharing the database.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::calendar::SessionClock;
use crate::engine::coordinator::{Liveness, RunCoordinator};
use crate::storage::Store;
use crate::types::{CoreError, PaperAccount, PaperPosition, Regime, Run};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct StatusState {
    pub store: Store,
    pub coordinator: RunCoordinator,
    pub clock: SessionClock,
}

pub type AppState = Arc<StatusState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub now: DateTime<Utc>,
    pub latest_run: Option<Run>,
    pub runs: i64,
    pub outcomes: i64,
    pub regime: Option<Regime>,
    pub weights_version: i64,
    /// `None` until the first paper cycle creates the account.
    pub account: Option<PaperAccount>,
    pub positions: Vec<PaperPosition>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn internal(e: CoreError) -> ApiError {
    warn!(error = %e, "Status query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health — 503 when the last heartbeat is stale.
pub async fn health(State(state): State<AppState>) -> Result<(StatusCode, Json<Liveness>), ApiError> {
    let liveness = state.coordinator.liveness(Utc::now()).await.map_err(internal)?;
    let code = if liveness.stale {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Ok((code, Json(liveness)))
}

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let now = Utc::now();
    let store = &state.store;
    let today = state.clock.local_date(now);

    let account = match store.load_account().await {
        Ok(a) => Some(a),
        Err(CoreError::Config(_)) => None,
        Err(e) => return Err(internal(e)),
    };

    Ok(Json(StatusResponse {
        now,
        latest_run: store.latest_run().await.map_err(internal)?,
        runs: store.count_runs().await.map_err(internal)?,
        outcomes: store.count_outcomes().await.map_err(internal)?,
        regime: store.latest_regime().await.map_err(internal)?,
        weights_version: store.weights_effective(today).await.map_err(internal)?.version,
        account,
        positions: store.open_positions().await.map_err(internal)?,
    }))
}
