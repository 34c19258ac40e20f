use axum::{
    extract::Request,
    http::HeaderMap,
    middleware::{self, Next},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::{admin_middleware, identity_middleware, AuthService};

use super::handlers::{cache_stats, health_check, issue_click_token, AppState};
use super::protection::{get_protection, remove_protection, set_protection, verify_protection};
use super::track::track_click;

pub fn create_api_router(state: Arc<AppState>, auth_service: Arc<AuthService>) -> Router {
    let owner_auth = Arc::clone(&auth_service);
    let owner_routes = Router::new()
        .route(
            "/api/protection/{link_id}",
            post(set_protection).delete(remove_protection),
        )
        .route_layer(middleware::from_fn(move |req: Request, next: Next| {
            let auth = Arc::clone(&owner_auth);
            identity_middleware(auth, req, next)
        }))
        .with_state(Arc::clone(&state));

    let admin_routes = Router::new()
        .route("/api/admin/cache/stats", get(cache_stats))
        .route_layer(middleware::from_fn(move |headers: HeaderMap, req: Request, next: Next| {
            let auth = Arc::clone(&auth_service);
            admin_middleware(auth, headers, req, next)
        }))
        .with_state(Arc::clone(&state));

    let public_routes = Router::new()
        .route("/api/track/click", post(track_click))
        .route("/api/links/{link_id}/click-token", get(issue_click_token))
        .route("/api/protection/{link_id}", get(get_protection))
        .route("/api/protection/{link_id}/verify", post(verify_protection))
        .with_state(state);

    Router::new()
        .route("/health", get(health_check))
        .merge(public_routes)
        .merge(owner_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
