use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Password protection state for a single link
///
/// `password_hash` is an Argon2 PHC string and must never leave the server.
#[derive(Debug, Clone, FromRow)]
pub struct ProtectionRecord {
    pub link_id: String,
    pub password_hash: String,
    pub hint: Option<String>,
    pub failed_attempts: i64,
    pub locked_until: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProtectionRecord {
    pub fn is_locked_at(&self, now: i64) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

/// Public view of a link's protection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionInfo {
    pub is_protected: bool,
    pub hint: Option<String>,
    pub is_locked: bool,
    pub locked_until: Option<i64>,
}

impl ProtectionInfo {
    pub fn unprotected() -> Self {
        Self {
            is_protected: false,
            hint: None,
            is_locked: false,
            locked_until: None,
        }
    }

    pub fn from_record(record: &ProtectionRecord, now: i64) -> Self {
        let is_locked = record.is_locked_at(now);
        Self {
            is_protected: true,
            hint: record.hint.clone(),
            is_locked,
            locked_until: if is_locked { record.locked_until } else { None },
        }
    }
}
