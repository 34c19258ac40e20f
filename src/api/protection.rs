//! Password protection endpoints

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::handlers::{error_response, AppState};
use crate::analytics::RequestMetadata;
use crate::auth::AuthenticatedUser;
use crate::protection::ProtectionError;

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    pub password: String,
    #[serde(default)]
    pub hint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyFailure {
    success: bool,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    locked_until: Option<i64>,
}

fn verified_cookie_name(link_id: &str) -> String {
    format!("verified_{link_id}")
}

/// Scope the cookie to this link's protection routes so other links never see it
fn verified_cookie_path(link_id: &str) -> String {
    format!("/api/protection/{link_id}")
}

fn has_verified_cookie(headers: &HeaderMap, link_id: &str) -> bool {
    let name = verified_cookie_name(link_id);
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(key, value)| key == name && value == "1")
}

fn failure(status: StatusCode, error: &'static str) -> Response {
    (
        status,
        Json(VerifyFailure {
            success: false,
            error,
            remaining_attempts: None,
            locked_until: None,
        }),
    )
        .into_response()
}

fn internal_error(link_id: &str, e: &ProtectionError) -> Response {
    tracing::error!(link_id, error = %e, "protection request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "try again later")
}

/// Public protection status
pub async fn get_protection(
    State(state): State<Arc<AppState>>,
    Path(link_id): Path<String>,
) -> Response {
    match state.gate.get_protection_info(&link_id).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => internal_error(&link_id, &e),
    }
}

pub async fn set_protection(
    State(state): State<Arc<AppState>>,
    Path(link_id): Path<String>,
    Extension(AuthenticatedUser(owner_id)): Extension<AuthenticatedUser>,
    payload: Result<Json<SetPasswordRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "invalid request");
    };

    match state
        .gate
        .set_password(&link_id, &owner_id, &request.password, request.hint.as_deref())
        .await
    {
        Ok(record) => Json(json!({ "success": true, "hint": record.hint })).into_response(),
        Err(ProtectionError::EmptyPassword) => {
            error_response(StatusCode::BAD_REQUEST, "password must not be empty")
        }
        Err(ProtectionError::NotOwner) => error_response(StatusCode::FORBIDDEN, "forbidden"),
        Err(ProtectionError::LinkNotFound) => {
            error_response(StatusCode::NOT_FOUND, "link not found")
        }
        Err(e) => internal_error(&link_id, &e),
    }
}

pub async fn remove_protection(
    State(state): State<Arc<AppState>>,
    Path(link_id): Path<String>,
    Extension(AuthenticatedUser(owner_id)): Extension<AuthenticatedUser>,
) -> Response {
    match state.gate.remove_password(&link_id, &owner_id).await {
        Ok(removed) => Json(json!({ "success": removed })).into_response(),
        Err(e) => internal_error(&link_id, &e),
    }
}

/// Check a visitor's password and hand out the verification cookie
pub async fn verify_protection(
    State(state): State<Arc<AppState>>,
    Path(link_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Response {
    if has_verified_cookie(&headers, &link_id) {
        return Json(json!({ "success": true, "alreadyVerified": true })).into_response();
    }

    let Ok(Json(request)) = payload else {
        return failure(StatusCode::BAD_REQUEST, "invalid request");
    };

    let client_ip = RequestMetadata::from_headers(&headers).client_ip();
    match state
        .gate
        .verify_password(&link_id, &request.password, &client_ip)
        .await
    {
        Ok(proof) => {
            let max_age = (proof.expires_at - proof.verified_at).max(0);
            let cookie = format!(
                "{}=1; Path={}; Max-Age={max_age}; HttpOnly; SameSite=Lax",
                verified_cookie_name(&link_id),
                verified_cookie_path(&link_id)
            );
            let mut response = Json(json!({ "success": true })).into_response();
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    response.headers_mut().insert(header::SET_COOKIE, value);
                }
                Err(e) => {
                    tracing::warn!(link_id, error = %e, "link id is not usable in a cookie");
                }
            }
            response
        }
        Err(ProtectionError::NotProtected) => {
            failure(StatusCode::BAD_REQUEST, "link is not password protected")
        }
        Err(ProtectionError::Locked { locked_until }) => (
            StatusCode::LOCKED,
            Json(VerifyFailure {
                success: false,
                error: "too many failed attempts",
                remaining_attempts: None,
                locked_until: Some(locked_until),
            }),
        )
            .into_response(),
        Err(ProtectionError::InvalidPassword {
            remaining_attempts,
            locked_until,
        }) => (
            StatusCode::UNAUTHORIZED,
            Json(VerifyFailure {
                success: false,
                error: "invalid password",
                remaining_attempts: Some(remaining_attempts),
                locked_until,
            }),
        )
            .into_response(),
        Err(e) => internal_error(&link_id, &e),
    }
}
