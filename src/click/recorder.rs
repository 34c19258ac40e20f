//! Click recording pipeline
//!
//! validate token -> replay guard -> classify -> locate -> persist
//!
//! Enrichment never rejects a click. Only a bad token, a replay or an
//! unknown link do, and a rejected click leaves no trace in storage.

use anyhow::anyhow;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::analytics::ip_extractor::anonymize_ip_str;
use crate::analytics::{BotClassifier, GeoResolver, RequestMetadata};
use crate::cache::{Admission, Cache};
use crate::click::token::{ClickTokenCodec, TokenError};
use crate::config::AnalyticsConfig;
use crate::models::{ClickEvent, NewClickEvent};
use crate::storage::{Storage, StorageError};

const MAX_LINK_ID_LEN: usize = 256;
const MAX_ENCODED_DATA_LEN: usize = 4096;
const MAX_VALIDATION_LEN: usize = 512;

/// Click as posted by the browser
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickSubmission {
    pub link_id: String,
    pub encoded_data: String,
    pub timestamp: i64,
    pub validation: String,
}

#[derive(Debug)]
pub enum ClickOutcome {
    Recorded(ClickEvent),
    /// Bot traffic dropped because bot recording is disabled
    SuppressedBot,
}

#[derive(Debug, Error)]
pub enum ClickError {
    #[error("malformed click submission: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("click token was already redeemed")]
    Replayed,
    #[error("link does not exist")]
    UnknownLink,
    /// The replay guard is full of live markers and cannot vouch for new tokens
    #[error("replay guard is at capacity")]
    Overloaded,
    #[error("failed to persist click: {0}")]
    Storage(anyhow::Error),
}

impl ClickError {
    /// Whether the click was refused, as opposed to failing to persist
    pub fn is_rejection(&self) -> bool {
        !matches!(self, ClickError::Storage(_) | ClickError::Overloaded)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecorderPolicy {
    pub record_bots: bool,
    pub reject_replays: bool,
    pub anonymize_ip: bool,
    pub persist_retries: u32,
    /// Base delay between persistence attempts, multiplied by the attempt number
    pub retry_backoff: Duration,
}

impl Default for RecorderPolicy {
    fn default() -> Self {
        Self::from(&AnalyticsConfig::default())
    }
}

impl From<&AnalyticsConfig> for RecorderPolicy {
    fn from(config: &AnalyticsConfig) -> Self {
        Self {
            record_bots: config.record_bots,
            reject_replays: config.reject_replays,
            anonymize_ip: config.ip_anonymization,
            persist_retries: config.persist_retries.max(1),
            retry_backoff: Duration::from_millis(50),
        }
    }
}

pub struct ClickRecorder {
    codec: ClickTokenCodec,
    classifier: Arc<BotClassifier>,
    geo: Arc<GeoResolver>,
    storage: Arc<dyn Storage>,
    replays: Arc<dyn Cache<()>>,
    policy: RecorderPolicy,
}

fn check_field(value: &str, max_len: usize, what: &'static str) -> Result<(), ClickError> {
    if value.trim().is_empty() || value.len() > max_len {
        return Err(ClickError::Malformed(what));
    }
    Ok(())
}

impl ClickRecorder {
    pub fn new(
        codec: ClickTokenCodec,
        classifier: Arc<BotClassifier>,
        geo: Arc<GeoResolver>,
        storage: Arc<dyn Storage>,
        replays: Arc<dyn Cache<()>>,
        policy: RecorderPolicy,
    ) -> Self {
        Self {
            codec,
            classifier,
            geo,
            storage,
            replays,
            policy,
        }
    }

    pub fn codec(&self) -> &ClickTokenCodec {
        &self.codec
    }

    pub fn policy(&self) -> RecorderPolicy {
        self.policy
    }

    pub async fn record_click(
        &self,
        submission: &ClickSubmission,
        metadata: &RequestMetadata,
    ) -> Result<ClickOutcome, ClickError> {
        self.record_click_at(submission, metadata, chrono::Utc::now().timestamp_millis())
            .await
    }

    pub async fn record_click_at(
        &self,
        submission: &ClickSubmission,
        metadata: &RequestMetadata,
        now_ms: i64,
    ) -> Result<ClickOutcome, ClickError> {
        check_field(&submission.link_id, MAX_LINK_ID_LEN, "linkId")?;
        check_field(&submission.encoded_data, MAX_ENCODED_DATA_LEN, "encodedData")?;
        check_field(&submission.validation, MAX_VALIDATION_LEN, "validation")?;
        if submission.timestamp <= 0 {
            return Err(ClickError::Malformed("timestamp"));
        }

        let payload = self
            .codec
            .redeem(
                &submission.encoded_data,
                &submission.validation,
                &submission.link_id,
                now_ms,
            )
            .inspect_err(|e| {
                warn!(link_id = %submission.link_id, reason = %e, "click token rejected");
            })?;

        if payload.issued_at != submission.timestamp {
            warn!(
                link_id = %submission.link_id,
                issued_at = payload.issued_at,
                timestamp = submission.timestamp,
                "click timestamp does not match token"
            );
            return Err(TokenError::Mismatch.into());
        }

        if self.policy.reject_replays {
            // Keep the mark until the token could no longer be redeemed anyway
            let ttl = Duration::from_millis((self.codec.ttl_ms() + 60_000).max(0) as u64);
            match self
                .replays
                .insert_if_absent(&submission.validation, (), ttl)
            {
                Admission::Inserted => {}
                Admission::Present => {
                    warn!(link_id = %submission.link_id, "click token replayed");
                    return Err(ClickError::Replayed);
                }
                Admission::Full => {
                    warn!(
                        link_id = %submission.link_id,
                        "replay guard at capacity, refusing click"
                    );
                    return Err(ClickError::Overloaded);
                }
            }
        }

        let (classification, device) = self.classifier.inspect(&metadata.user_agent);
        if classification.is_bot && !self.policy.record_bots {
            debug!(
                link_id = %submission.link_id,
                category = classification.category.as_deref().unwrap_or("unknown"),
                "bot click suppressed"
            );
            return Ok(ClickOutcome::SuppressedBot);
        }

        let client_ip = metadata.client_ip();
        let location = self.geo.resolve(&client_ip).await;
        let stored_ip = if self.policy.anonymize_ip {
            anonymize_ip_str(&client_ip)
        } else {
            client_ip
        };

        let event = NewClickEvent {
            link_id: submission.link_id.clone(),
            timestamp: now_ms,
            ip: stored_ip,
            user_agent: metadata.user_agent.clone(),
            referer: metadata.referer.clone(),
            country: location.country,
            city: location.city,
            region: location.region,
            device,
            is_bot: classification.is_bot,
            bot_category: classification.category,
        };

        match self.persist(&event).await {
            Ok(recorded) => Ok(ClickOutcome::Recorded(recorded)),
            Err(e) => {
                if matches!(e, ClickError::Storage(_)) {
                    // Let the client retry the same token
                    self.replays.delete(&submission.validation);
                }
                Err(e)
            }
        }
    }

    async fn persist(&self, event: &NewClickEvent) -> Result<ClickEvent, ClickError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.storage.insert_click(event).await {
                Ok(recorded) => return Ok(recorded),
                Err(StorageError::LinkNotFound) => {
                    warn!(link_id = %event.link_id, "click for unknown link");
                    return Err(ClickError::UnknownLink);
                }
                Err(e) if attempt < self.policy.persist_retries => {
                    warn!(
                        link_id = %event.link_id,
                        attempt,
                        error = %e,
                        "failed to persist click, retrying"
                    );
                    tokio::time::sleep(self.policy.retry_backoff * attempt).await;
                }
                Err(e) => {
                    error!(
                        link_id = %event.link_id,
                        attempts = attempt,
                        error = %e,
                        "giving up persisting click"
                    );
                    return Err(ClickError::Storage(anyhow!(e)));
                }
            }
        }
    }
}
