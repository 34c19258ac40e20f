//! User-agent classification
//!
//! Classification is informational only: bots are still recorded, tagged
//! with `is_bot` and a coarse category, so dashboards can filter them out.
//!
//! The signature table decides bot status. Device class comes from woothee,
//! whose crawler category also catches bots the table misses.

use serde::Serialize;
use woothee::parser::Parser;

use crate::models::Device;

/// Built-in signature table: case-insensitive substring → category.
///
/// More specific patterns come first; the first match wins.
pub const DEFAULT_SIGNATURES: &[(&str, &str)] = &[
    // Social link-preview fetchers
    ("facebookexternalhit", "social"),
    ("facebot", "social"),
    ("twitterbot", "social"),
    ("linkedinbot", "social"),
    ("slackbot", "social"),
    ("slack-imgproxy", "social"),
    ("discordbot", "social"),
    ("telegrambot", "social"),
    ("whatsapp", "social"),
    ("pinterestbot", "social"),
    ("redditbot", "social"),
    ("skypeuripreview", "social"),
    ("vkshare", "social"),
    ("embedly", "social"),
    // Search engines
    ("googlebot", "search"),
    ("google-inspectiontool", "search"),
    ("adsbot-google", "search"),
    ("bingbot", "search"),
    ("bingpreview", "search"),
    ("duckduckbot", "search"),
    ("baiduspider", "search"),
    ("yandexbot", "search"),
    ("yandex.com/bots", "search"),
    ("applebot", "search"),
    ("slurp", "search"),
    ("sogou", "search"),
    ("exabot", "search"),
    ("seznambot", "search"),
    ("petalbot", "search"),
    // SEO and marketing crawlers
    ("ahrefsbot", "seo"),
    ("semrushbot", "seo"),
    ("mj12bot", "seo"),
    ("dotbot", "seo"),
    ("rogerbot", "seo"),
    ("screaming frog", "seo"),
    ("serpstatbot", "seo"),
    // AI crawlers
    ("gptbot", "ai"),
    ("chatgpt-user", "ai"),
    ("claudebot", "ai"),
    ("anthropic-ai", "ai"),
    ("ccbot", "ai"),
    ("perplexitybot", "ai"),
    ("bytespider", "ai"),
    // Uptime monitors
    ("uptimerobot", "monitor"),
    ("pingdom", "monitor"),
    ("statuscake", "monitor"),
    ("site24x7", "monitor"),
    ("newrelicpinger", "monitor"),
    // Headless browsers and HTTP libraries
    ("headlesschrome", "automation"),
    ("phantomjs", "automation"),
    ("puppeteer", "automation"),
    ("playwright", "automation"),
    ("selenium", "automation"),
    ("curl/", "tool"),
    ("wget/", "tool"),
    ("python-requests", "tool"),
    ("python-urllib", "tool"),
    ("aiohttp", "tool"),
    ("go-http-client", "tool"),
    ("java/", "tool"),
    ("okhttp", "tool"),
    ("axios/", "tool"),
    ("node-fetch", "tool"),
    ("libwww-perl", "tool"),
    ("httpclient", "tool"),
    ("postmanruntime", "tool"),
    ("insomnia", "tool"),
    // Generic markers, kept last
    ("crawler", "crawler"),
    ("spider", "crawler"),
    ("scraper", "crawler"),
    ("bot/", "crawler"),
    ("bot;", "crawler"),
    ("-bot", "crawler"),
    ("_bot", "crawler"),
    ("+http", "crawler"),
];

/// Outcome of classifying a user agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotClassification {
    pub is_bot: bool,
    pub category: Option<String>,
}

impl BotClassification {
    fn human() -> Self {
        Self {
            is_bot: false,
            category: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Signature {
    /// Lowercased pattern
    pattern: String,
    category: String,
}

/// Substring-based bot classifier over a configurable signature table
#[derive(Debug, Clone)]
pub struct BotClassifier {
    signatures: Vec<Signature>,
}

impl Default for BotClassifier {
    fn default() -> Self {
        Self::new(std::iter::empty::<(String, String)>())
    }
}

impl BotClassifier {
    /// Build a classifier from the default table plus `extra` signatures.
    ///
    /// Extra signatures are checked before the defaults so deployments can
    /// override a built-in category.
    pub fn new<I, P, C>(extra: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: AsRef<str>,
    {
        let mut signatures: Vec<Signature> = extra
            .into_iter()
            .filter(|(pattern, _)| !pattern.as_ref().trim().is_empty())
            .map(|(pattern, category)| Signature {
                pattern: pattern.as_ref().trim().to_lowercase(),
                category: category.as_ref().trim().to_lowercase(),
            })
            .collect();

        signatures.extend(DEFAULT_SIGNATURES.iter().map(|(pattern, category)| Signature {
            pattern: pattern.to_string(),
            category: category.to_string(),
        }));

        Self { signatures }
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    /// Classify a raw user-agent string
    pub fn classify(&self, user_agent: &str) -> BotClassification {
        let ua = user_agent.to_lowercase();
        if ua.is_empty() {
            return BotClassification::human();
        }

        self.signatures
            .iter()
            .find(|sig| ua.contains(&sig.pattern))
            .map(|sig| BotClassification {
                is_bot: true,
                category: Some(sig.category.clone()),
            })
            .unwrap_or_else(BotClassification::human)
    }

    /// Classify and derive the device class in one pass
    pub fn inspect(&self, user_agent: &str) -> (BotClassification, Device) {
        let classification = self.classify(user_agent);
        if classification.is_bot {
            return (classification, Device::Bot);
        }

        match detect_device(user_agent) {
            Device::Bot => (
                BotClassification {
                    is_bot: true,
                    category: Some("crawler".to_string()),
                },
                Device::Bot,
            ),
            device => (classification, device),
        }
    }
}

/// Device class from woothee's category
///
/// woothee files tablets under "smartphone", so iPads and Android builds
/// without "mobile" are split out first.
pub fn detect_device(user_agent: &str) -> Device {
    if user_agent.trim().is_empty() {
        return Device::Desktop;
    }

    let ua = user_agent.to_lowercase();
    if ua.contains("ipad") || (ua.contains("android") && !ua.contains("mobile")) {
        return Device::Tablet;
    }

    match Parser::new().parse(user_agent).map(|result| result.category) {
        Some("smartphone" | "mobilephone") => Device::Mobile,
        Some("crawler") => Device::Bot,
        _ => Device::Desktop,
    }
}
