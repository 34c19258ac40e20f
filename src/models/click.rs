use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Coarse device class of a visitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Mobile,
    Tablet,
    Desktop,
    Bot,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Mobile => "mobile",
            Device::Tablet => "tablet",
            Device::Desktop => "desktop",
            Device::Bot => "bot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mobile" => Some(Device::Mobile),
            "tablet" => Some(Device::Tablet),
            "desktop" => Some(Device::Desktop),
            "bot" => Some(Device::Bot),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Click event ready to be persisted
#[derive(Debug, Clone)]
pub struct NewClickEvent {
    pub link_id: String,
    pub timestamp: i64,
    pub ip: String,
    pub user_agent: String,
    pub referer: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub device: Device,
    pub is_bot: bool,
    pub bot_category: Option<String>,
}

/// Persisted click event (append-only)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ClickEvent {
    pub id: i64,
    pub link_id: String,
    pub timestamp: i64,
    pub ip: String,
    pub user_agent: String,
    pub referer: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    /// Stored as text; see [`Device::parse`]
    pub device: String,
    pub is_bot: bool,
    pub bot_category: Option<String>,
}

impl ClickEvent {
    pub fn from_new(id: i64, event: &NewClickEvent) -> Self {
        Self {
            id,
            link_id: event.link_id.clone(),
            timestamp: event.timestamp,
            ip: event.ip.clone(),
            user_agent: event.user_agent.clone(),
            referer: event.referer.clone(),
            country: event.country.clone(),
            city: event.city.clone(),
            region: event.region.clone(),
            device: event.device.as_str().to_string(),
            is_bot: event.is_bot,
            bot_category: event.bot_category.clone(),
        }
    }

    pub fn device(&self) -> Option<Device> {
        Device::parse(&self.device)
    }
}
