use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Minimal projection of a published link, as seen by the click pipeline
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub link_id: String,
    pub owner_id: String,
    pub destination_url: String,
    pub clicks: i64,
    pub bot_clicks: i64,
    pub last_clicked_at: Option<i64>,
    pub created_at: i64,
}
