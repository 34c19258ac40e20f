use crate::models::{ClickEvent, Link, NewClickEvent, ProtectionRecord};
use crate::storage::{Storage, StorageError, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

pub struct PostgresStorage {
    pool: Arc<PgPool>,
}

impl PostgresStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS links (
                link_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                destination_url TEXT NOT NULL,
                clicks BIGINT NOT NULL DEFAULT 0,
                bot_clicks BIGINT NOT NULL DEFAULT 0,
                last_clicked_at BIGINT,
                created_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_owner ON links(owner_id)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS link_protection (
                link_id TEXT PRIMARY KEY REFERENCES links(link_id) ON DELETE CASCADE,
                password_hash TEXT NOT NULL,
                hint TEXT,
                failed_attempts BIGINT NOT NULL DEFAULT 0,
                locked_until BIGINT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS click_events (
                id BIGSERIAL PRIMARY KEY,
                link_id TEXT NOT NULL REFERENCES links(link_id) ON DELETE CASCADE,
                timestamp BIGINT NOT NULL,
                ip TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                referer TEXT NOT NULL,
                country TEXT,
                city TEXT,
                region TEXT,
                device TEXT NOT NULL,
                is_bot BOOLEAN NOT NULL DEFAULT FALSE,
                bot_category TEXT
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_click_events_link_time ON click_events(link_id, timestamp)",
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn create_link(
        &self,
        link_id: &str,
        owner_id: &str,
        destination_url: &str,
    ) -> StorageResult<Link> {
        let link = sqlx::query_as::<_, Link>(
            r#"
            INSERT INTO links (link_id, owner_id, destination_url, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (link_id) DO NOTHING
            RETURNING link_id, owner_id, destination_url, clicks, bot_clicks, last_clicked_at, created_at
            "#,
        )
        .bind(link_id)
        .bind(owner_id)
        .bind(destination_url)
        .bind(now_secs())
        .fetch_optional(self.pool.as_ref())
        .await?;

        link.ok_or(StorageError::Conflict)
    }

    async fn get_link(&self, link_id: &str) -> Result<Option<Link>> {
        let link = sqlx::query_as::<_, Link>(
            r#"
            SELECT link_id, owner_id, destination_url, clicks, bot_clicks, last_clicked_at, created_at
            FROM links
            WHERE link_id = $1
            "#,
        )
        .bind(link_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(link)
    }

    async fn delete_link(&self, link_id: &str) -> Result<bool> {
        // Dependent rows go via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM links WHERE link_id = $1")
            .bind(link_id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_click(&self, event: &NewClickEvent) -> StorageResult<ClickEvent> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE links
            SET clicks = clicks + 1,
                bot_clicks = bot_clicks + $1,
                last_clicked_at = $2
            WHERE link_id = $3
            "#,
        )
        .bind(if event.is_bot { 1_i64 } else { 0_i64 })
        .bind(event.timestamp)
        .bind(&event.link_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::LinkNotFound);
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO click_events
                (link_id, timestamp, ip, user_agent, referer, country, city, region, device, is_bot, bot_category)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(&event.link_id)
        .bind(event.timestamp)
        .bind(&event.ip)
        .bind(&event.user_agent)
        .bind(&event.referer)
        .bind(&event.country)
        .bind(&event.city)
        .bind(&event.region)
        .bind(event.device.as_str())
        .bind(event.is_bot)
        .bind(&event.bot_category)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ClickEvent::from_new(id, event))
    }

    async fn list_clicks(&self, link_id: &str, limit: i64) -> Result<Vec<ClickEvent>> {
        let events = sqlx::query_as::<_, ClickEvent>(
            r#"
            SELECT id, link_id, timestamp, ip, user_agent, referer, country, city, region, device, is_bot, bot_category
            FROM click_events
            WHERE link_id = $1
            ORDER BY timestamp DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(link_id)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(events)
    }

    async fn get_protection(&self, link_id: &str) -> Result<Option<ProtectionRecord>> {
        let record = sqlx::query_as::<_, ProtectionRecord>(
            r#"
            SELECT link_id, password_hash, hint, failed_attempts, locked_until, created_at, updated_at
            FROM link_protection
            WHERE link_id = $1
            "#,
        )
        .bind(link_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(record)
    }

    async fn upsert_protection(&self, record: &ProtectionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO link_protection
                (link_id, password_hash, hint, failed_attempts, locked_until, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (link_id) DO UPDATE SET
                password_hash = EXCLUDED.password_hash,
                hint = EXCLUDED.hint,
                failed_attempts = EXCLUDED.failed_attempts,
                locked_until = EXCLUDED.locked_until,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.link_id)
        .bind(&record.password_hash)
        .bind(&record.hint)
        .bind(record.failed_attempts)
        .bind(record.locked_until)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn delete_protection(&self, link_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM link_protection WHERE link_id = $1")
            .bind(link_id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_protection_attempts(
        &self,
        link_id: &str,
        expected_attempts: i64,
        failed_attempts: i64,
        locked_until: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE link_protection
            SET failed_attempts = $1, locked_until = $2, updated_at = $3
            WHERE link_id = $4 AND failed_attempts = $5
            "#,
        )
        .bind(failed_attempts)
        .bind(locked_until)
        .bind(now_secs())
        .bind(link_id)
        .bind(expected_attempts)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
