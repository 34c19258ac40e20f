use crate::models::{ClickEvent, Link, NewClickEvent, ProtectionRecord};
use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("link already exists")]
    Conflict,
    #[error("link not found")]
    LinkNotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Other(err.into())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the storage (create tables, indexes)
    async fn init(&self) -> Result<()>;

    /// Register a link owned by `owner_id`
    async fn create_link(
        &self,
        link_id: &str,
        owner_id: &str,
        destination_url: &str,
    ) -> StorageResult<Link>;

    async fn get_link(&self, link_id: &str) -> Result<Option<Link>>;

    /// Delete a link together with its protection record and click events
    async fn delete_link(&self, link_id: &str) -> Result<bool>;

    /// Append a click event and bump the link's counters in one transaction.
    ///
    /// Fails with [`StorageError::LinkNotFound`] (and writes nothing) when
    /// the link does not exist.
    async fn insert_click(&self, event: &NewClickEvent) -> StorageResult<ClickEvent>;

    /// Most recent click events for a link, newest first
    async fn list_clicks(&self, link_id: &str, limit: i64) -> Result<Vec<ClickEvent>>;

    async fn get_protection(&self, link_id: &str) -> Result<Option<ProtectionRecord>>;

    /// Protection state read from the backing store, bypassing any cache.
    ///
    /// Password checks use this so that writes made by another process
    /// (the admin CLI, a second server) take effect immediately.
    async fn get_protection_fresh(&self, link_id: &str) -> Result<Option<ProtectionRecord>> {
        self.get_protection(link_id).await
    }

    /// Insert or fully replace a protection record
    async fn upsert_protection(&self, record: &ProtectionRecord) -> Result<()>;

    async fn delete_protection(&self, link_id: &str) -> Result<bool>;

    /// Conditionally write attempt state.
    ///
    /// Applies only if the stored `failed_attempts` still equals
    /// `expected_attempts`; returns false when another writer got there first
    /// or the record no longer exists.
    async fn update_protection_attempts(
        &self,
        link_id: &str,
        expected_attempts: i64,
        failed_attempts: i64,
        locked_until: Option<i64>,
    ) -> Result<bool>;
}
