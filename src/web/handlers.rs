//! HTTP request handlers.

use super::AppState;
use crate::db::HostId;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;

// ============================================================================
// Servers
// ============================================================================

/// Every host with its coarse window, record and metadata.
pub async fn handle_get_servers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.snapshot())
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub id: HostId,
    pub timestamps: Vec<i64>,
    pub counts: Vec<Option<u32>>,
}

/// The fine (per-server detail) window for one host.
pub async fn handle_get_history(State(state): State<AppState>, Path(id): Path<HostId>) -> impl IntoResponse {
    match state.store.fine_window(id) {
        Ok(window) => Json(HistoryResponse {
            id,
            timestamps: window.timestamps,
            counts: window.counts,
        })
        .into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

// ============================================================================
// Shared data
// ============================================================================

pub async fn handle_get_timestamps(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.shared_axis())
}

pub async fn handle_get_records(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.records())
}

/// The last completed tick, or 204 before the first one.
pub async fn handle_latest_update(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.latest().await {
        Some(event) => Json(event).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub async fn handle_health() -> &'static str {
    "ok"
}
