//! Request identity
//!
//! Users are authenticated by the hosting layer, which forwards the user id
//! in a trusted header. Operator endpoints take an `X-API-Key` instead.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;

/// User id placed in request extensions by [`identity_middleware`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

pub struct AuthService {
    identity_header: String,
    admin_api_keys: Arc<Vec<String>>,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            identity_header: config.identity_header.to_lowercase(),
            admin_api_keys: Arc::new(config.admin_api_keys.clone()),
        }
    }

    pub fn identity(&self, headers: &HeaderMap) -> Option<AuthenticatedUser> {
        headers
            .get(self.identity_header.as_str())
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| AuthenticatedUser(id.to_string()))
    }

    /// Admin endpoints stay closed when no key is configured
    pub fn validate_admin_key(&self, key: &str) -> bool {
        !key.is_empty()
            && self
                .admin_api_keys
                .iter()
                .any(|k| bool::from(k.as_bytes().ct_eq(key.as_bytes())))
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

/// Reject requests without a forwarded user id
pub async fn identity_middleware(
    auth_service: Arc<AuthService>,
    mut request: Request,
    next: Next,
) -> Response {
    match auth_service.identity(request.headers()) {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => unauthorized("authentication required"),
    }
}

pub async fn admin_middleware(
    auth_service: Arc<AuthService>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let api_key = headers
        .get("X-API-Key")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    if auth_service.validate_admin_key(api_key) {
        next.run(request).await
    } else {
        unauthorized("invalid or missing API key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn service(keys: &[&str]) -> AuthService {
        AuthService::new(&AuthConfig {
            identity_header: "X-Authenticated-User".to_string(),
            admin_api_keys: keys.iter().map(|k| k.to_string()).collect(),
        })
    }

    #[test]
    fn test_identity_from_header() {
        let auth = service(&[]);
        let mut headers = HeaderMap::new();
        assert_eq!(auth.identity(&headers), None);

        headers.insert("x-authenticated-user", HeaderValue::from_static("  "));
        assert_eq!(auth.identity(&headers), None);

        headers.insert("x-authenticated-user", HeaderValue::from_static("user-42"));
        assert_eq!(
            auth.identity(&headers),
            Some(AuthenticatedUser("user-42".to_string()))
        );
    }

    #[test]
    fn test_admin_keys() {
        let auth = service(&["k1", "k2"]);
        assert!(auth.validate_admin_key("k2"));
        assert!(!auth.validate_admin_key("k3"));
        assert!(!auth.validate_admin_key(""));

        let closed = service(&[]);
        assert!(!closed.validate_admin_key("anything"));
    }
}
