use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub geo: GeoConfig,
    pub click_token: ClickTokenConfig,
    pub protection: ProtectionConfig,
    pub analytics: AnalyticsConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries per cache instance
    pub max_entries: usize,
    /// TTL for cached link and protection lookups
    pub storage_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoProvider {
    None,
    Http,
    Maxmind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    pub provider: GeoProvider,
    /// URL template with `{ip}` placeholder, used by the HTTP provider
    pub api_url_template: String,
    /// Path to a GeoLite2/GeoIP2 City database, used by the MaxMind provider
    pub mmdb_path: Option<String>,
    pub timeout_ms: u64,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickTokenConfig {
    /// When set, click tokens are HMAC-signed with this secret
    pub secret: Option<String>,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    pub max_attempts: u32,
    pub lockout_secs: u64,
    /// Lifetime of the verification cookie
    pub verified_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Persist clicks classified as bots (tagged `is_bot`)
    pub record_bots: bool,
    /// Reject a click token that was already redeemed
    pub reject_replays: bool,
    /// Store truncated client IPs (/24 for IPv4, /48 for IPv6)
    pub ip_anonymization: bool,
    /// Extra bot signatures as `pattern=category` pairs
    pub extra_bot_signatures: Vec<(String, String)>,
    pub persist_retries: u32,
    /// Live replay markers held at once. This bounds the clicks accepted
    /// per token lifetime; past it new clicks are refused until markers expire.
    pub replay_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header carrying the user id authenticated by the hosting layer
    pub identity_header: String,
    /// Keys accepted on admin endpoints via `X-API-Key`
    pub admin_api_keys: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: crate::cache::DEFAULT_MAX_ENTRIES,
            storage_ttl_secs: 60,
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            provider: GeoProvider::None,
            api_url_template: "http://ip-api.com/json/{ip}?fields=status,countryCode,regionName,city"
                .to_string(),
            mmdb_path: None,
            timeout_ms: 3000,
            cache_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for ClickTokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_secs: 5 * 60,
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_secs: 15 * 60,
            verified_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            record_bots: true,
            reject_replays: true,
            ip_anonymization: false,
            extra_bot_signatures: Vec::new(),
            persist_retries: 3,
            replay_capacity: 100_000,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            identity_header: "x-authenticated-user".to_string(),
            admin_api_keys: Vec::new(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse `pattern=category` pairs, skipping malformed entries
pub fn parse_bot_signatures(items: &[String]) -> Vec<(String, String)> {
    items
        .iter()
        .filter_map(|item| match item.split_once('=') {
            Some((pattern, category)) if !pattern.trim().is_empty() => {
                Some((pattern.trim().to_string(), category.trim().to_string()))
            }
            _ => {
                tracing::warn!("Ignoring malformed bot signature '{item}', expected pattern=category");
                None
            }
        })
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend = match env_or("DATABASE_BACKEND", "sqlite").to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            _ => DatabaseBackend::Sqlite,
        };

        let database = DatabaseConfig {
            backend,
            url: env_or("DATABASE_URL", "sqlite://./linkgate.db?mode=rwc"),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10)?,
        };

        let server = ServerConfig {
            host: env_or("HOST", "127.0.0.1"),
            port: env_parse("PORT", 8080)?,
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            max_entries: env_parse("CACHE_MAX_ENTRIES", cache_defaults.max_entries)?,
            storage_ttl_secs: env_parse("CACHE_STORAGE_TTL_SECS", cache_defaults.storage_ttl_secs)?,
        };

        let geo_defaults = GeoConfig::default();
        let provider = match env_or("GEO_PROVIDER", "none").to_lowercase().as_str() {
            "none" => GeoProvider::None,
            "http" => GeoProvider::Http,
            "maxmind" => GeoProvider::Maxmind,
            other => {
                tracing::warn!(
                    "Unknown GEO_PROVIDER '{other}', falling back to 'none'. Supported values: none, http, maxmind"
                );
                GeoProvider::None
            }
        };
        let mmdb_path = std::env::var("GEO_MMDB_PATH").ok();
        if matches!(provider, GeoProvider::Maxmind) && mmdb_path.is_none() {
            anyhow::bail!("GEO_MMDB_PATH must be set when GEO_PROVIDER=maxmind");
        }
        let geo = GeoConfig {
            provider,
            api_url_template: env_or("GEO_API_URL", &geo_defaults.api_url_template),
            mmdb_path,
            // Keep the upstream call within the pipeline's latency budget
            timeout_ms: env_parse("GEO_TIMEOUT_MS", geo_defaults.timeout_ms)?.clamp(1000, 5000),
            cache_ttl_secs: geo_defaults.cache_ttl_secs,
        };

        let token_defaults = ClickTokenConfig::default();
        let click_token = ClickTokenConfig {
            secret: std::env::var("CLICK_TOKEN_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            ttl_secs: env_parse("CLICK_TOKEN_TTL_SECS", token_defaults.ttl_secs)?,
        };

        let protection_defaults = ProtectionConfig::default();
        let protection = ProtectionConfig {
            max_attempts: env_parse("PROTECTION_MAX_ATTEMPTS", protection_defaults.max_attempts)?
                .max(1),
            lockout_secs: env_parse("PROTECTION_LOCKOUT_SECS", protection_defaults.lockout_secs)?,
            verified_ttl_secs: env_parse(
                "PROTECTION_VERIFIED_TTL_SECS",
                protection_defaults.verified_ttl_secs,
            )?,
        };

        let analytics_defaults = AnalyticsConfig::default();
        let analytics = AnalyticsConfig {
            record_bots: env_flag("ANALYTICS_RECORD_BOTS", analytics_defaults.record_bots),
            reject_replays: env_flag("ANALYTICS_REJECT_REPLAYS", analytics_defaults.reject_replays),
            ip_anonymization: env_flag(
                "ANALYTICS_IP_ANONYMIZATION",
                analytics_defaults.ip_anonymization,
            ),
            extra_bot_signatures: parse_bot_signatures(&env_list("BOT_SIGNATURES")),
            persist_retries: env_parse(
                "ANALYTICS_PERSIST_RETRIES",
                analytics_defaults.persist_retries,
            )?
            .max(1),
            replay_capacity: env_parse(
                "ANALYTICS_REPLAY_CAPACITY",
                analytics_defaults.replay_capacity,
            )?
            .max(1),
        };

        let auth = AuthConfig {
            identity_header: env_or("AUTH_IDENTITY_HEADER", &AuthConfig::default().identity_header)
                .to_lowercase(),
            admin_api_keys: env_list("ADMIN_API_KEYS"),
        };

        if click_token.secret.is_none() {
            tracing::warn!(
                "CLICK_TOKEN_SECRET is not set; click tokens are unsigned and only checked for freshness and link binding"
            );
        }

        Ok(Config {
            database,
            server,
            cache,
            geo,
            click_token,
            protection,
            analytics,
            auth,
        })
    }
}
