//! Geolocation upstreams
//!
//! An upstream answers "where is this IP" and may be slow or fail. It is
//! always called through [`crate::analytics::GeoResolver`], which adds
//! caching, the timeout and the `"Unknown"` fallback.

use anyhow::{Context, Result};
use async_trait::async_trait;
use maxminddb::{geoip2, Mmap, Reader};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Location fields an upstream can provide
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamLocation {
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
}

#[async_trait]
pub trait GeoUpstream: Send + Sync {
    /// Look up an address. `Ok(None)` means the upstream has no answer.
    async fn locate(&self, ip: IpAddr) -> Result<Option<UpstreamLocation>>;

    fn name(&self) -> &'static str;
}

/// Upstream that never knows anything; used when geolocation is disabled
pub struct NoopGeoUpstream;

#[async_trait]
impl GeoUpstream for NoopGeoUpstream {
    async fn locate(&self, _ip: IpAddr) -> Result<Option<UpstreamLocation>> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Response shape of ip-api style services; alternative field names are
/// accepted for compatibility with similar APIs
#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: Option<String>,
    #[serde(alias = "country_code")]
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    country: Option<String>,
    city: Option<String>,
    #[serde(alias = "region_name")]
    #[serde(rename = "regionName")]
    region_name: Option<String>,
}

/// HTTP JSON geolocation API (ip-api.com and compatibles)
pub struct HttpGeoUpstream {
    client: reqwest::Client,
    /// URL with `{ip}` placeholder
    url_template: String,
}

impl HttpGeoUpstream {
    pub fn new(url_template: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("linkgate-geo/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for geolocation")?;

        Ok(Self {
            client,
            url_template: url_template.to_string(),
        })
    }
}

#[async_trait]
impl GeoUpstream for HttpGeoUpstream {
    async fn locate(&self, ip: IpAddr) -> Result<Option<UpstreamLocation>> {
        let url = self.url_template.replace("{ip}", &ip.to_string());

        let response: ApiResponse = self
            .client
            .get(&url)
            .send()
            .await
            .context("geolocation request failed")?
            .error_for_status()
            .context("geolocation API returned an error status")?
            .json()
            .await
            .context("geolocation API returned an unreadable body")?;

        if response.status.as_deref() == Some("fail") {
            return Ok(None);
        }

        let country = response.country_code.or(response.country);
        if country.is_none() && response.city.is_none() {
            return Ok(None);
        }

        Ok(Some(UpstreamLocation {
            country,
            city: response.city,
            region: response.region_name,
        }))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Local MaxMind GeoLite2/GeoIP2 City database
pub struct MaxMindGeoUpstream {
    reader: Arc<Reader<Mmap>>,
}

impl MaxMindGeoUpstream {
    pub fn new(city_path: &str) -> Result<Self> {
        let reader = unsafe { Reader::open_mmap(city_path) }
            .with_context(|| format!("Failed to open GeoIP City database at {}", city_path))?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    fn lookup(&self, ip: IpAddr) -> Option<UpstreamLocation> {
        let result = self.reader.lookup(ip).ok()?;

        if let Ok(Some(city)) = result.decode::<geoip2::City>() {
            return Some(UpstreamLocation {
                country: city.country.iso_code.map(|s| s.to_string()),
                city: city.city.names.english.map(|s| s.to_string()),
                region: city
                    .subdivisions
                    .first()
                    .and_then(|subdivision| subdivision.names.english)
                    .map(|s| s.to_string()),
            });
        }

        // The City database is a superset of Country data
        if let Ok(Some(country)) = result.decode::<geoip2::Country>() {
            return Some(UpstreamLocation {
                country: country.country.iso_code.map(|s| s.to_string()),
                ..Default::default()
            });
        }

        None
    }
}

#[async_trait]
impl GeoUpstream for MaxMindGeoUpstream {
    async fn locate(&self, ip: IpAddr) -> Result<Option<UpstreamLocation>> {
        // Memory-mapped lookups are fast enough to run inline
        Ok(self.lookup(ip))
    }

    fn name(&self) -> &'static str {
        "maxmind"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maxmind_invalid_path() {
        assert!(MaxMindGeoUpstream::new("/nonexistent/path.mmdb").is_err());
    }

    #[tokio::test]
    async fn test_noop_upstream_has_no_answer() {
        let upstream = NoopGeoUpstream;
        let result = upstream.locate("8.8.8.8".parse().unwrap()).await.unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_api_response_parsing() {
        let ok: ApiResponse = serde_json::from_str(
            r#"{"status":"success","countryCode":"US","regionName":"California","city":"Mountain View"}"#,
        )
        .unwrap();
        assert_eq!(ok.country_code.as_deref(), Some("US"));
        assert_eq!(ok.region_name.as_deref(), Some("California"));

        let alt: ApiResponse =
            serde_json::from_str(r#"{"country_code":"DE","city":"Berlin"}"#).unwrap();
        assert_eq!(alt.country_code.as_deref(), Some("DE"));

        let fail: ApiResponse =
            serde_json::from_str(r#"{"status":"fail","message":"private range"}"#).unwrap();
        assert_eq!(fail.status.as_deref(), Some("fail"));
    }
}
