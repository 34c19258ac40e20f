use crate::cache::{Cache, CacheStats};
use crate::models::{ClickEvent, Link, NewClickEvent, ProtectionRecord};
use crate::storage::{Storage, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Read-through cache for the hot lookups (link ownership/existence and
/// protection state)
///
/// Writes go straight to the inner storage and then refresh or invalidate the
/// affected cache entry. Click counters on cached links may lag behind the
/// database by up to `ttl`.
pub struct CachedStorage {
    /// Underlying storage implementation
    inner: Arc<dyn Storage>,
    links: Arc<dyn Cache<Option<Link>>>,
    protection: Arc<dyn Cache<Option<ProtectionRecord>>>,
    ttl: Duration,
}

impl CachedStorage {
    pub fn new(
        inner: Arc<dyn Storage>,
        links: Arc<dyn Cache<Option<Link>>>,
        protection: Arc<dyn Cache<Option<ProtectionRecord>>>,
        ttl: Duration,
    ) -> Self {
        Self {
            inner,
            links,
            protection,
            ttl,
        }
    }

    pub fn link_cache_stats(&self) -> CacheStats {
        self.links.stats()
    }

    pub fn protection_cache_stats(&self) -> CacheStats {
        self.protection.stats()
    }
}

#[async_trait]
impl Storage for CachedStorage {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn create_link(
        &self,
        link_id: &str,
        owner_id: &str,
        destination_url: &str,
    ) -> StorageResult<Link> {
        let link = self
            .inner
            .create_link(link_id, owner_id, destination_url)
            .await?;

        // Replaces a cached negative lookup, if any
        self.links.set(link_id, Some(link.clone()), self.ttl);

        Ok(link)
    }

    async fn get_link(&self, link_id: &str) -> Result<Option<Link>> {
        if let Some(cached) = self.links.get(link_id) {
            return Ok(cached);
        }

        let result = self.inner.get_link(link_id).await?;
        self.links.set(link_id, result.clone(), self.ttl);

        Ok(result)
    }

    async fn delete_link(&self, link_id: &str) -> Result<bool> {
        let deleted = self.inner.delete_link(link_id).await?;

        self.links.delete(link_id);
        self.protection.delete(link_id);

        Ok(deleted)
    }

    async fn insert_click(&self, event: &NewClickEvent) -> StorageResult<ClickEvent> {
        self.inner.insert_click(event).await
    }

    async fn list_clicks(&self, link_id: &str, limit: i64) -> Result<Vec<ClickEvent>> {
        self.inner.list_clicks(link_id, limit).await
    }

    async fn get_protection(&self, link_id: &str) -> Result<Option<ProtectionRecord>> {
        if let Some(cached) = self.protection.get(link_id) {
            return Ok(cached);
        }

        let result = self.inner.get_protection(link_id).await?;
        self.protection.set(link_id, result.clone(), self.ttl);

        Ok(result)
    }

    async fn get_protection_fresh(&self, link_id: &str) -> Result<Option<ProtectionRecord>> {
        let result = self.inner.get_protection_fresh(link_id).await?;
        self.protection.set(link_id, result.clone(), self.ttl);

        Ok(result)
    }

    async fn upsert_protection(&self, record: &ProtectionRecord) -> Result<()> {
        let result = self.inner.upsert_protection(record).await;
        // Invalidate even on failure; the write may have landed
        self.protection.delete(&record.link_id);
        result
    }

    async fn delete_protection(&self, link_id: &str) -> Result<bool> {
        let result = self.inner.delete_protection(link_id).await;
        self.protection.delete(link_id);
        result
    }

    async fn update_protection_attempts(
        &self,
        link_id: &str,
        expected_attempts: i64,
        failed_attempts: i64,
        locked_until: Option<i64>,
    ) -> Result<bool> {
        let result = self
            .inner
            .update_protection_attempts(link_id, expected_attempts, failed_attempts, locked_until)
            .await;
        // Conflicts also invalidate so the caller's retry reads fresh state
        self.protection.delete(link_id);
        result
    }
}
