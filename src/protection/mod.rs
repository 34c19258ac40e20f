//! Password gate for protected links
//!
//! Each protected link has one [`ProtectionRecord`]. Failed verifications
//! are counted; reaching the threshold locks the link until
//! `now + lockout`. While locked, no password is checked at all.
//!
//! Attempt accounting is serialized per link with an in-process mutex, and
//! every write is a conditional update on the previous attempt count so that
//! concurrent failures from several processes cannot both slip under the
//! threshold.
//!
//! Both password writes and verification read the record uncached, so a
//! password rotated by another process is honoured at once.

pub mod password;

use anyhow::anyhow;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ProtectionConfig;
use crate::models::{ProtectionInfo, ProtectionRecord};
use crate::storage::Storage;

pub use password::{hash_password, verify_password, PasswordHashError};

/// Conditional-update conflicts tolerated before giving up
const MAX_CONFLICT_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("link not found")]
    LinkNotFound,
    #[error("caller does not own this link")]
    NotOwner,
    #[error("link is not password protected")]
    NotProtected,
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("link is locked until {locked_until}")]
    Locked { locked_until: i64 },
    #[error("invalid password")]
    InvalidPassword {
        remaining_attempts: u32,
        /// Set when this failure triggered the lockout
        locked_until: Option<i64>,
    },
    #[error(transparent)]
    Hash(#[from] PasswordHashError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Certifies one successful verification
///
/// The HTTP layer turns this into a scoped cookie; the gate does not track it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationProof {
    pub link_id: String,
    pub verified_at: i64,
    pub expires_at: i64,
}

/// Lockout parameters
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub lockout_secs: i64,
    pub verified_ttl_secs: i64,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::from(&ProtectionConfig::default())
    }
}

impl From<&ProtectionConfig> for LockoutPolicy {
    fn from(config: &ProtectionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            lockout_secs: config.lockout_secs as i64,
            verified_ttl_secs: config.verified_ttl_secs as i64,
        }
    }
}

type LinkLocks = DashMap<String, Arc<Mutex<()>>>;

/// Handle on one link's mutex, shared by every caller working on that link.
///
/// Dropping the last handle removes the map entry, including when the
/// caller's future is cancelled while waiting.
struct LinkLock<'a> {
    locks: &'a LinkLocks,
    link_id: &'a str,
    mutex: Arc<Mutex<()>>,
}

impl Drop for LinkLock<'_> {
    fn drop(&mut self) {
        // Only the map and this handle left
        self.locks
            .remove_if(self.link_id, |_, m| Arc::strong_count(m) == 2);
    }
}

pub struct PasswordGate {
    storage: Arc<dyn Storage>,
    policy: LockoutPolicy,
    link_locks: LinkLocks,
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl PasswordGate {
    pub fn new(storage: Arc<dyn Storage>, policy: LockoutPolicy) -> Self {
        Self {
            storage,
            policy,
            link_locks: DashMap::new(),
        }
    }

    pub fn policy(&self) -> LockoutPolicy {
        self.policy
    }

    fn link_lock<'a>(&'a self, link_id: &'a str) -> LinkLock<'a> {
        let mutex = Arc::clone(
            self.link_locks
                .entry(link_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        LinkLock {
            locks: &self.link_locks,
            link_id,
            mutex,
        }
    }

    async fn ensure_owner(&self, link_id: &str, owner_id: &str) -> Result<(), ProtectionError> {
        let link = self
            .storage
            .get_link(link_id)
            .await?
            .ok_or(ProtectionError::LinkNotFound)?;

        if link.owner_id != owner_id {
            return Err(ProtectionError::NotOwner);
        }
        Ok(())
    }

    /// Enable (or replace) password protection on a link owned by `owner_id`
    pub async fn set_password(
        &self,
        link_id: &str,
        owner_id: &str,
        plaintext: &str,
        hint: Option<&str>,
    ) -> Result<ProtectionRecord, ProtectionError> {
        if plaintext.is_empty() {
            return Err(ProtectionError::EmptyPassword);
        }
        self.ensure_owner(link_id, owner_id).await?;

        let plaintext = plaintext.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&plaintext))
            .await
            .map_err(|e| anyhow!("password hashing task failed: {e}"))??;

        let lock = self.link_lock(link_id);
        let _guard = lock.mutex.lock().await;

        let now = now_secs();
        let created_at = self
            .storage
            .get_protection_fresh(link_id)
            .await?
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        let record = ProtectionRecord {
            link_id: link_id.to_string(),
            password_hash,
            hint: hint.map(str::trim).filter(|h| !h.is_empty()).map(String::from),
            failed_attempts: 0,
            locked_until: None,
            created_at,
            updated_at: now,
        };
        self.storage.upsert_protection(&record).await?;

        info!(link_id, owner_id, "password protection enabled");
        Ok(record)
    }

    /// Remove protection. Returns false when there is nothing to remove or
    /// the caller does not own the link.
    pub async fn remove_password(
        &self,
        link_id: &str,
        owner_id: &str,
    ) -> Result<bool, ProtectionError> {
        match self.ensure_owner(link_id, owner_id).await {
            Ok(()) => {}
            Err(ProtectionError::LinkNotFound | ProtectionError::NotOwner) => return Ok(false),
            Err(e) => return Err(e),
        }

        let removed = self.storage.delete_protection(link_id).await?;
        if removed {
            info!(link_id, owner_id, "password protection removed");
        }
        Ok(removed)
    }

    /// Verify a visitor's password for a protected link
    pub async fn verify_password(
        &self,
        link_id: &str,
        plaintext: &str,
        client_ip: &str,
    ) -> Result<VerificationProof, ProtectionError> {
        self.verify_password_at(link_id, plaintext, client_ip, now_secs())
            .await
    }

    pub async fn verify_password_at(
        &self,
        link_id: &str,
        plaintext: &str,
        client_ip: &str,
        now: i64,
    ) -> Result<VerificationProof, ProtectionError> {
        let lock = self.link_lock(link_id);
        let _guard = lock.mutex.lock().await;
        self.verify_serialized(link_id, plaintext, client_ip, now)
            .await
    }

    async fn verify_serialized(
        &self,
        link_id: &str,
        plaintext: &str,
        client_ip: &str,
        now: i64,
    ) -> Result<VerificationProof, ProtectionError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let record = self
                .storage
                .get_protection_fresh(link_id)
                .await?
                .ok_or(ProtectionError::NotProtected)?;

            if let Some(locked_until) = record.locked_until.filter(|until| now < *until) {
                warn!(link_id, client_ip, locked_until, "verification attempt while locked");
                return Err(ProtectionError::Locked { locked_until });
            }

            // An expired lock means the counter starts over with this attempt
            let prior_failures = if record.locked_until.is_some() {
                0
            } else {
                record.failed_attempts
            };

            let candidate = plaintext.to_string();
            let stored_hash = record.password_hash.clone();
            let matched =
                tokio::task::spawn_blocking(move || verify_password(&candidate, &stored_hash))
                    .await
                    .map_err(|e| anyhow!("password verification task failed: {e}"))??;

            if matched {
                let dirty = record.failed_attempts != 0 || record.locked_until.is_some();
                if dirty
                    && !self
                        .storage
                        .update_protection_attempts(link_id, record.failed_attempts, 0, None)
                        .await?
                {
                    continue;
                }

                return Ok(VerificationProof {
                    link_id: link_id.to_string(),
                    verified_at: now,
                    expires_at: now + self.policy.verified_ttl_secs,
                });
            }

            let failed_attempts = prior_failures + 1;
            let locked_until = (failed_attempts >= i64::from(self.policy.max_attempts))
                .then_some(now + self.policy.lockout_secs);

            if !self
                .storage
                .update_protection_attempts(
                    link_id,
                    record.failed_attempts,
                    failed_attempts,
                    locked_until,
                )
                .await?
            {
                continue;
            }

            let remaining_attempts =
                (i64::from(self.policy.max_attempts) - failed_attempts).max(0) as u32;
            warn!(
                link_id,
                client_ip,
                failed_attempts,
                locked = locked_until.is_some(),
                "invalid password for protected link"
            );

            return Err(ProtectionError::InvalidPassword {
                remaining_attempts,
                locked_until,
            });
        }

        Err(ProtectionError::Storage(anyhow!(
            "protection record for {link_id} kept changing during verification"
        )))
    }

    /// Public protection status; never includes the hash
    pub async fn get_protection_info(&self, link_id: &str) -> Result<ProtectionInfo, ProtectionError> {
        self.get_protection_info_at(link_id, now_secs()).await
    }

    pub async fn get_protection_info_at(
        &self,
        link_id: &str,
        now: i64,
    ) -> Result<ProtectionInfo, ProtectionError> {
        let info = match self.storage.get_protection(link_id).await? {
            Some(record) => ProtectionInfo::from_record(&record, now),
            None => ProtectionInfo::unprotected(),
        };
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    const NOW: i64 = 1_700_000_000;

    async fn setup(policy: LockoutPolicy) -> (Arc<dyn Storage>, PasswordGate) {
        let sqlite = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
        sqlite.init().await.unwrap();
        let storage: Arc<dyn Storage> = Arc::new(sqlite);
        storage
            .create_link("link1", "owner1", "https://example.com")
            .await
            .unwrap();

        let gate = PasswordGate::new(Arc::clone(&storage), policy);
        (storage, gate)
    }

    fn policy() -> LockoutPolicy {
        LockoutPolicy {
            max_attempts: 5,
            lockout_secs: 15 * 60,
            verified_ttl_secs: 24 * 60 * 60,
        }
    }

    #[tokio::test]
    async fn test_set_then_verify_round_trip() {
        let (_, gate) = setup(policy()).await;
        gate.set_password("link1", "owner1", "hunter2", Some("classic"))
            .await
            .unwrap();

        let proof = gate
            .verify_password_at("link1", "hunter2", "203.0.113.1", NOW)
            .await
            .unwrap();
        assert_eq!(proof.link_id, "link1");
        assert_eq!(proof.expires_at, NOW + 86_400);

        for wrong in ["hunter3", "Hunter2", "", "hunter2 "] {
            assert!(matches!(
                gate.verify_password_at("link1", wrong, "203.0.113.1", NOW).await,
                Err(ProtectionError::InvalidPassword { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_set_password_requires_owner() {
        let (_, gate) = setup(policy()).await;

        assert!(matches!(
            gate.set_password("link1", "intruder", "pw", None).await,
            Err(ProtectionError::NotOwner)
        ));
        assert!(matches!(
            gate.set_password("missing", "owner1", "pw", None).await,
            Err(ProtectionError::LinkNotFound)
        ));
        assert!(matches!(
            gate.set_password("link1", "owner1", "", None).await,
            Err(ProtectionError::EmptyPassword)
        ));
    }

    #[tokio::test]
    async fn test_unprotected_link() {
        let (_, gate) = setup(policy()).await;

        assert!(matches!(
            gate.verify_password_at("link1", "anything", "203.0.113.1", NOW).await,
            Err(ProtectionError::NotProtected)
        ));
        assert_eq!(
            gate.get_protection_info_at("link1", NOW).await.unwrap(),
            ProtectionInfo::unprotected()
        );
    }

    #[tokio::test]
    async fn test_lockout_after_threshold() {
        let (storage, gate) = setup(policy()).await;
        gate.set_password("link1", "owner1", "correct", None)
            .await
            .unwrap();

        for expected_remaining in (1..=4).rev() {
            match gate.verify_password_at("link1", "wrong", "203.0.113.1", NOW).await {
                Err(ProtectionError::InvalidPassword {
                    remaining_attempts,
                    locked_until: None,
                }) => assert_eq!(remaining_attempts, expected_remaining),
                other => panic!("unexpected result: {other:?}"),
            }
        }
        let info = gate.get_protection_info_at("link1", NOW).await.unwrap();
        assert!(!info.is_locked);

        // Fifth failure locks
        match gate.verify_password_at("link1", "wrong", "203.0.113.1", NOW).await {
            Err(ProtectionError::InvalidPassword {
                remaining_attempts: 0,
                locked_until: Some(until),
            }) => assert_eq!(until, NOW + 900),
            other => panic!("unexpected result: {other:?}"),
        }

        // Even the right password is refused while locked, counter untouched
        assert!(matches!(
            gate.verify_password_at("link1", "correct", "203.0.113.1", NOW + 60).await,
            Err(ProtectionError::Locked { locked_until }) if locked_until == NOW + 900
        ));
        let record = storage.get_protection("link1").await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 5);

        let info = gate.get_protection_info_at("link1", NOW + 60).await.unwrap();
        assert!(info.is_locked);
        assert_eq!(info.locked_until, Some(NOW + 900));
    }

    #[tokio::test]
    async fn test_lock_expiry_resets_counter() {
        let (storage, gate) = setup(policy()).await;
        gate.set_password("link1", "owner1", "correct", None)
            .await
            .unwrap();

        for _ in 0..5 {
            let _ = gate
                .verify_password_at("link1", "wrong", "203.0.113.1", NOW)
                .await;
        }

        let after = NOW + 901;
        assert!(!gate.get_protection_info_at("link1", after).await.unwrap().is_locked);

        // First failure after expiry counts from zero again
        match gate.verify_password_at("link1", "wrong", "203.0.113.1", after).await {
            Err(ProtectionError::InvalidPassword {
                remaining_attempts: 4,
                locked_until: None,
            }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        let record = storage.get_protection("link1").await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 1);
        assert_eq!(record.locked_until, None);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let (storage, gate) = setup(policy()).await;
        gate.set_password("link1", "owner1", "correct", None)
            .await
            .unwrap();

        for _ in 0..3 {
            let _ = gate
                .verify_password_at("link1", "wrong", "203.0.113.1", NOW)
                .await;
        }
        gate.verify_password_at("link1", "correct", "203.0.113.1", NOW)
            .await
            .unwrap();

        let record = storage.get_protection("link1").await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 0);
    }

    #[tokio::test]
    async fn test_concurrent_failures_never_skip_threshold() {
        let (storage, gate) = setup(policy()).await;
        gate.set_password("link1", "owner1", "correct", None)
            .await
            .unwrap();
        let gate = Arc::new(gate);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    gate.verify_password_at("link1", "wrong", "203.0.113.1", NOW)
                        .await
                })
            })
            .collect();

        let mut invalid = 0;
        let mut locked = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Err(ProtectionError::InvalidPassword { .. }) => invalid += 1,
                Err(ProtectionError::Locked { .. }) => locked += 1,
                other => panic!("unexpected result: {other:?}"),
            }
        }

        assert_eq!(invalid, 5);
        assert_eq!(locked, 3);
        let record = storage.get_protection("link1").await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 5);
        assert!(record.locked_until.is_some());
        assert!(gate.link_locks.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_link_lock() {
        let (_, gate) = setup(policy()).await;
        gate.set_password("link1", "owner1", "correct", None)
            .await
            .unwrap();

        let held = gate.link_lock("link1");
        let guard = held.mutex.lock().await;

        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            gate.verify_password_at("link1", "correct", "203.0.113.1", NOW),
        )
        .await;
        assert!(waiting.is_err());
        // The holder still owns the entry
        assert_eq!(gate.link_locks.len(), 1);

        drop(guard);
        drop(held);
        assert!(gate.link_locks.is_empty());

        assert!(gate
            .verify_password_at("link1", "correct", "203.0.113.1", NOW)
            .await
            .is_ok());
        assert!(gate.link_locks.is_empty());
    }

    #[tokio::test]
    async fn test_password_rotated_by_another_process_applies_at_once() {
        use crate::cache::TtlCache;
        use crate::storage::CachedStorage;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("gate.db").display());

        // The admin CLI talks to the database directly
        let cli_storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new(&url, 1).await.unwrap());
        cli_storage.init().await.unwrap();
        cli_storage
            .create_link("link1", "owner1", "https://example.com")
            .await
            .unwrap();
        let cli = PasswordGate::new(Arc::clone(&cli_storage), policy());

        // The server reads through its own cache
        let server_storage: Arc<dyn Storage> = Arc::new(CachedStorage::new(
            Arc::new(SqliteStorage::new(&url, 1).await.unwrap()),
            Arc::new(TtlCache::new(100)),
            Arc::new(TtlCache::new(100)),
            Duration::from_secs(60),
        ));
        let server = PasswordGate::new(server_storage, policy());

        cli.set_password("link1", "owner1", "old", None).await.unwrap();
        assert!(server
            .get_protection_info_at("link1", NOW)
            .await
            .unwrap()
            .is_protected);

        cli.set_password("link1", "owner1", "new", None).await.unwrap();

        assert!(matches!(
            server
                .verify_password_at("link1", "old", "203.0.113.1", NOW)
                .await,
            Err(ProtectionError::InvalidPassword { .. })
        ));
        assert!(server
            .verify_password_at("link1", "new", "203.0.113.1", NOW)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_set_password_resets_lock_and_keeps_hint() {
        let (_, gate) = setup(policy()).await;
        gate.set_password("link1", "owner1", "first", None)
            .await
            .unwrap();
        for _ in 0..5 {
            let _ = gate
                .verify_password_at("link1", "wrong", "203.0.113.1", NOW)
                .await;
        }

        gate.set_password("link1", "owner1", "second", Some("  new hint "))
            .await
            .unwrap();

        let info = gate.get_protection_info_at("link1", NOW).await.unwrap();
        assert!(info.is_protected);
        assert!(!info.is_locked);
        assert_eq!(info.hint.as_deref(), Some("new hint"));
        assert!(gate
            .verify_password_at("link1", "second", "203.0.113.1", NOW)
            .await
            .is_ok());
        assert!(gate
            .verify_password_at("link1", "first", "203.0.113.1", NOW)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_remove_password() {
        let (_, gate) = setup(policy()).await;

        assert!(!gate.remove_password("link1", "owner1").await.unwrap());

        gate.set_password("link1", "owner1", "pw", None)
            .await
            .unwrap();
        assert!(!gate.remove_password("link1", "intruder").await.unwrap());
        assert!(!gate.remove_password("missing", "owner1").await.unwrap());
        assert!(gate.remove_password("link1", "owner1").await.unwrap());

        assert!(!gate.get_protection_info("link1").await.unwrap().is_protected);
    }
}
