use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

use super::handlers::{error_response, AppState};
use crate::analytics::RequestMetadata;
use crate::click::{ClickError, ClickSubmission};

/// Record a click posted by the browser.
///
/// Rejection reasons are logged by the recorder and never echoed back.
pub async fn track_click(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ClickSubmission>, JsonRejection>,
) -> Response {
    let Json(submission) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "unparseable click submission");
            return error_response(StatusCode::BAD_REQUEST, "invalid request");
        }
    };

    let metadata = RequestMetadata::from_headers(&headers);
    match state.recorder.record_click(&submission, &metadata).await {
        Ok(_) => Json(json!({ "success": true })).into_response(),
        Err(e) if e.is_rejection() => error_response(StatusCode::BAD_REQUEST, "invalid request"),
        Err(ClickError::Overloaded) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "try again later")
        }
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "try again later"),
    }
}
