use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{CacheRegistry, CacheStats};
use crate::click::ClickRecorder;
use crate::protection::PasswordGate;
use crate::storage::Storage;

pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub recorder: Arc<ClickRecorder>,
    pub gate: Arc<PasswordGate>,
    pub caches: CacheRegistry,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Issue a fresh click token for a link at render time
pub async fn issue_click_token(
    State(state): State<Arc<AppState>>,
    Path(link_id): Path<String>,
) -> Response {
    match state.storage.get_link(&link_id).await {
        Ok(Some(_)) => Json(state.recorder.codec().issue(&link_id)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "link not found"),
        Err(e) => {
            tracing::error!(link_id, error = %e, "failed to look up link for click token");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "try again later")
        }
    }
}

#[derive(Serialize)]
pub struct CacheStatsResponse {
    pub caches: BTreeMap<String, CacheStats>,
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        caches: state.caches.snapshot(),
    })
}
