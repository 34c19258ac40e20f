//! Cached, best-effort IP geolocation
//!
//! Every answer is cached for a fixed TTL (24h by default), including the
//! `"Unknown"` fallback produced on upstream failure, so a failing or
//! rate-limited upstream is not hammered for the same address.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::analytics::ip_extractor::{is_unroutable, parse_ip};
use crate::analytics::upstream::GeoUpstream;
use crate::cache::Cache;

/// Country value used when a location cannot be determined
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// Fixed TTL for geolocation answers
pub const GEO_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Coarse location of an IP address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub ip: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
}

impl GeoRecord {
    pub fn unknown(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            country: Some(UNKNOWN_COUNTRY.to_string()),
            city: None,
            region: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.country.as_deref() == Some(UNKNOWN_COUNTRY)
    }
}

pub struct GeoResolver {
    cache: Arc<dyn Cache<GeoRecord>>,
    upstream: Arc<dyn GeoUpstream>,
    timeout: Duration,
    ttl: Duration,
}

impl GeoResolver {
    pub fn new(
        cache: Arc<dyn Cache<GeoRecord>>,
        upstream: Arc<dyn GeoUpstream>,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            upstream,
            timeout,
            ttl: GEO_CACHE_TTL,
        }
    }

    /// Override the cache TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn upstream_name(&self) -> &'static str {
        self.upstream.name()
    }

    /// Resolve an IP to a location. Never fails; worst case is `"Unknown"`.
    pub async fn resolve(&self, ip: &str) -> GeoRecord {
        if let Some(cached) = self.cache.get(ip) {
            return cached;
        }

        // The cache lock is not held here; concurrent misses for the same IP
        // may both reach the upstream, and the last answer wins.
        let record = self.lookup_upstream(ip).await;
        self.cache.set(ip, record.clone(), self.ttl);
        record
    }

    async fn lookup_upstream(&self, raw_ip: &str) -> GeoRecord {
        let Some(ip) = parse_ip(raw_ip) else {
            debug!(ip = raw_ip, "unparseable client IP, skipping geolocation");
            return GeoRecord::unknown(raw_ip);
        };

        if is_unroutable(ip) {
            debug!(%ip, "unroutable client IP, skipping geolocation");
            return GeoRecord::unknown(raw_ip);
        }

        match tokio::time::timeout(self.timeout, self.upstream.locate(ip)).await {
            Ok(Ok(Some(location))) => GeoRecord {
                ip: raw_ip.to_string(),
                country: location
                    .country
                    .or_else(|| Some(UNKNOWN_COUNTRY.to_string())),
                city: location.city,
                region: location.region,
            },
            Ok(Ok(None)) => {
                debug!(%ip, upstream = self.upstream.name(), "no geolocation answer");
                GeoRecord::unknown(raw_ip)
            }
            Ok(Err(e)) => {
                warn!(%ip, upstream = self.upstream.name(), error = %e, "geolocation lookup failed");
                GeoRecord::unknown(raw_ip)
            }
            Err(_) => {
                warn!(
                    %ip,
                    upstream = self.upstream.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "geolocation lookup timed out"
                );
                GeoRecord::unknown(raw_ip)
            }
        }
    }
}
