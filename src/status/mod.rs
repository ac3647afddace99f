//! Status server.
//!
//! A small JSON API for the external watchdog and for humans: liveness
//! and the latest run, regime and paper account. CORS is open for GETs so
//! a local page can poll it.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use routes::AppState;

/// Bind `port` and serve in a background task.
pub async fn spawn_status_server(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status port {port}"))?;
    info!(port, "Status server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Status server stopped");
        }
    });
    Ok(())
}

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/status", get(routes::get_status))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::SessionClock;
    use crate::engine::coordinator::RunCoordinator;
    use crate::storage::Store;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{NaiveTime, Utc};
    use routes::StatusState;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn state() -> AppState {
        let store = Store::in_memory().await.unwrap();
        let clock = SessionClock::new(
            9,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        )
        .unwrap();
        Arc::new(StatusState {
            coordinator: RunCoordinator::new(store.clone(), 1800, 600),
            store,
            clock,
        })
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_is_unavailable_without_heartbeat() {
        let (status, json) = get(build_router(state().await), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["stale"], true);
    }

    #[tokio::test]
    async fn test_health_ok_after_heartbeat() {
        let state = state().await;
        state.coordinator.heartbeat("hourly", Utc::now(), "ok").await.unwrap();
        let (status, json) = get(build_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["component"], "hourly");
    }

    #[tokio::test]
    async fn test_status_on_empty_store() {
        let (status, json) = get(build_router(state().await), "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["runs"], 0);
        assert!(json["account"].is_null());
        assert_eq!(json["weights_version"], 1);
    }
}
