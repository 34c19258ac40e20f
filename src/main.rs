use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use linkgate::analytics::{
    BotClassifier, GeoRecord, GeoResolver, GeoUpstream, HttpGeoUpstream, MaxMindGeoUpstream,
    NoopGeoUpstream,
};
use linkgate::api::{self, AppState};
use linkgate::auth::AuthService;
use linkgate::cache::{Cache, CacheRegistry, TtlCache};
use linkgate::click::{ClickRecorder, ClickTokenCodec, RecorderPolicy};
use linkgate::config::{Config, DatabaseBackend, GeoProvider};
use linkgate::models::{Link, ProtectionRecord};
use linkgate::protection::{LockoutPolicy, PasswordGate};
use linkgate::storage::{CachedStorage, PostgresStorage, SqliteStorage, Storage};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    info!("Loaded configuration");

    let backend: Arc<dyn Storage> = match config.database.backend {
        DatabaseBackend::Sqlite => {
            info!("Using SQLite storage: {}", config.database.url);
            Arc::new(SqliteStorage::new(&config.database.url, config.database.max_connections).await?)
        }
        DatabaseBackend::Postgres => {
            info!("Using PostgreSQL storage");
            Arc::new(
                PostgresStorage::new(&config.database.url, config.database.max_connections)
                    .await?,
            )
        }
    };

    info!("Initializing database...");
    backend.init().await?;
    info!("Database initialized successfully");

    let max_entries = config.cache.max_entries;
    let link_cache: Arc<dyn Cache<Option<Link>>> = Arc::new(TtlCache::new(max_entries));
    let protection_cache: Arc<dyn Cache<Option<ProtectionRecord>>> =
        Arc::new(TtlCache::new(max_entries));
    let geo_cache: Arc<dyn Cache<GeoRecord>> = Arc::new(TtlCache::new(max_entries));
    // One entry per token still inside its validity window
    let replay_cache: Arc<dyn Cache<()>> =
        Arc::new(TtlCache::new(config.analytics.replay_capacity));

    let mut caches = CacheRegistry::new();
    caches.register("links", Arc::clone(&link_cache));
    caches.register("protection", Arc::clone(&protection_cache));
    caches.register("geo", Arc::clone(&geo_cache));
    caches.register("click_replay", Arc::clone(&replay_cache));

    let storage: Arc<dyn Storage> = Arc::new(CachedStorage::new(
        backend,
        link_cache,
        protection_cache,
        Duration::from_secs(config.cache.storage_ttl_secs),
    ));

    let geo_timeout = Duration::from_millis(config.geo.timeout_ms);
    let upstream: Arc<dyn GeoUpstream> = match config.geo.provider {
        GeoProvider::None => Arc::new(NoopGeoUpstream),
        GeoProvider::Http => Arc::new(HttpGeoUpstream::new(
            &config.geo.api_url_template,
            geo_timeout,
        )?),
        GeoProvider::Maxmind => {
            let path = config.geo.mmdb_path.as_deref().unwrap_or_default();
            Arc::new(MaxMindGeoUpstream::new(path)?)
        }
    };
    let geo = GeoResolver::new(geo_cache, upstream, geo_timeout)
        .with_ttl(Duration::from_secs(config.geo.cache_ttl_secs));
    info!("Geolocation provider: {}", geo.upstream_name());

    let classifier = BotClassifier::new(config.analytics.extra_bot_signatures.iter().cloned());
    info!("Bot classifier loaded with {} signatures", classifier.signature_count());

    let codec = ClickTokenCodec::from_secret(config.click_token.secret.as_deref())
        .with_ttl_ms((config.click_token.ttl_secs * 1000) as i64);

    let recorder = ClickRecorder::new(
        codec,
        Arc::new(classifier),
        Arc::new(geo),
        Arc::clone(&storage),
        replay_cache,
        RecorderPolicy::from(&config.analytics),
    );
    let gate = PasswordGate::new(Arc::clone(&storage), LockoutPolicy::from(&config.protection));

    if config.auth.admin_api_keys.is_empty() {
        info!("No ADMIN_API_KEYS configured; admin endpoints are disabled");
    }
    let auth_service = Arc::new(AuthService::new(&config.auth));

    let state = Arc::new(AppState {
        storage,
        recorder: Arc::new(recorder),
        gate: Arc::new(gate),
        caches,
    });
    let router = api::create_api_router(state, auth_service);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, router).await?;

    Ok(())
}
