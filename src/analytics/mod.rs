//! Click enrichment: bot classification, client IP handling and geolocation
//!
//! None of these steps can reject a click. They only annotate it.

pub mod bot;
pub mod geo;
pub mod ip_extractor;
pub mod upstream;

pub use bot::{detect_device, BotClassification, BotClassifier};
pub use geo::{GeoRecord, GeoResolver, UNKNOWN_COUNTRY};
pub use ip_extractor::{anonymize_ip, RequestMetadata};
pub use upstream::{GeoUpstream, HttpGeoUpstream, MaxMindGeoUpstream, NoopGeoUpstream};
