//! Admin cache statistics endpoint

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use linkgate::analytics::{BotClassifier, GeoRecord, GeoResolver, NoopGeoUpstream};
use linkgate::api::{self, AppState};
use linkgate::auth::AuthService;
use linkgate::cache::{Cache, CacheRegistry, TtlCache};
use linkgate::click::{ClickRecorder, ClickTokenCodec, RecorderPolicy};
use linkgate::config::AuthConfig;
use linkgate::models::{Link, ProtectionRecord};
use linkgate::protection::{LockoutPolicy, PasswordGate};
use linkgate::storage::{CachedStorage, SqliteStorage, Storage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const ADMIN_KEY: &str = "test-admin-key";

/// Wire the app the way the server binary does, with every cache registered
async fn create_test_app() -> Router {
    let sqlite = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    sqlite.init().await.unwrap();

    let link_cache: Arc<dyn Cache<Option<Link>>> = Arc::new(TtlCache::new(50));
    let protection_cache: Arc<dyn Cache<Option<ProtectionRecord>>> = Arc::new(TtlCache::new(50));
    let geo_cache: Arc<dyn Cache<GeoRecord>> = Arc::new(TtlCache::new(50));
    let replay_cache: Arc<dyn Cache<()>> = Arc::new(TtlCache::new(500));

    let mut caches = CacheRegistry::new();
    caches.register("links", Arc::clone(&link_cache));
    caches.register("protection", Arc::clone(&protection_cache));
    caches.register("geo", Arc::clone(&geo_cache));
    caches.register("click_replay", Arc::clone(&replay_cache));

    let storage: Arc<dyn Storage> = Arc::new(CachedStorage::new(
        Arc::new(sqlite),
        link_cache,
        protection_cache,
        Duration::from_secs(60),
    ));
    storage
        .create_link("abc", "owner1", "https://example.com")
        .await
        .unwrap();

    let geo = GeoResolver::new(geo_cache, Arc::new(NoopGeoUpstream), Duration::from_secs(1));
    let recorder = ClickRecorder::new(
        ClickTokenCodec::unsigned(),
        Arc::new(BotClassifier::default()),
        Arc::new(geo),
        Arc::clone(&storage),
        replay_cache,
        RecorderPolicy::default(),
    );
    let state = Arc::new(AppState {
        gate: Arc::new(PasswordGate::new(Arc::clone(&storage), LockoutPolicy::default())),
        storage,
        recorder: Arc::new(recorder),
        caches,
    });
    let auth_service = Arc::new(AuthService::new(&AuthConfig {
        admin_api_keys: vec![ADMIN_KEY.to_string()],
        ..AuthConfig::default()
    }));

    api::create_api_router(state, auth_service)
}

fn stats_request(api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri("/api/admin/cache/stats");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_cache_stats_require_admin_key() {
    let app = create_test_app().await;

    let missing = app.clone().oneshot(stats_request(None)).await.unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app.clone().oneshot(stats_request(Some("nope"))).await.unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_cache_stats_report_every_cache() {
    let app = create_test_app().await;

    // Two token lookups for the same link: one miss, one hit
    for _ in 0..2 {
        let request = Request::builder()
            .uri("/api/links/abc/click-token")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(stats_request(Some(ADMIN_KEY))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let stats: Value = serde_json::from_slice(&body).unwrap();
    let caches = stats["caches"].as_object().unwrap();

    for name in ["links", "protection", "geo", "click_replay"] {
        let cache = &caches[name];
        for field in ["size", "maxSize", "hitRate", "hitCount", "missCount", "evictions"] {
            assert!(cache.get(field).is_some(), "{name} is missing {field}");
        }
    }

    let links = &caches["links"];
    assert_eq!(links["maxSize"], 50);
    assert_eq!(links["size"], 1);
    assert!(links["hitCount"].as_u64().unwrap() >= 2);
}
