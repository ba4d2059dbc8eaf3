//! In-memory credential store for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::credential::Credential;
use crate::platforms::PlatformId;

use super::{CredentialStore, NewUsage, QuotaSnapshot, StoreError, UsageRecord};

/// HashMap-backed [`CredentialStore`]. State is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    credentials: Mutex<HashMap<(String, PlatformId), Credential>>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_credential<T>(
        &self,
        owner_id: &str,
        platform: PlatformId,
        apply: impl FnOnce(&mut Credential) -> T,
    ) -> Result<T, StoreError> {
        let mut credentials = lock_or_poisoned(&self.credentials);
        let credential = credentials
            .get_mut(&(owner_id.to_owned(), platform))
            .ok_or_else(|| StoreError::MissingCredential {
                owner_id: owner_id.to_owned(),
                platform,
            })?;
        Ok(apply(credential))
    }
}

/// Mutex poisoning only happens after a panic in another test thread; the
/// data is still coherent for the purposes of this store.
fn lock_or_poisoned<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Result<Option<Credential>, StoreError> {
        let credentials = lock_or_poisoned(&self.credentials);
        Ok(credentials.get(&(owner_id.to_owned(), platform)).cloned())
    }

    async fn upsert(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut credentials = lock_or_poisoned(&self.credentials);
        credentials.insert(
            (credential.owner_id.clone(), credential.platform),
            credential.clone(),
        );
        Ok(())
    }

    async fn delete(&self, owner_id: &str, platform: PlatformId) -> Result<bool, StoreError> {
        let mut credentials = lock_or_poisoned(&self.credentials);
        Ok(credentials
            .remove(&(owner_id.to_owned(), platform))
            .is_some())
    }

    async fn add_usage(
        &self,
        owner_id: &str,
        platform: PlatformId,
        tokens: u64,
    ) -> Result<QuotaSnapshot, StoreError> {
        self.with_credential(owner_id, platform, |credential| {
            credential.quota_used = credential.quota_used.saturating_add(tokens);
            credential.last_used_at = Some(Utc::now());
            QuotaSnapshot {
                quota_used: credential.quota_used,
                quota_limit: credential.quota_limit,
            }
        })
    }

    async fn mark_expired(&self, owner_id: &str, platform: PlatformId) -> Result<(), StoreError> {
        self.with_credential(owner_id, platform, |credential| {
            credential.is_expired = true;
        })
    }

    async fn mark_validated(
        &self,
        owner_id: &str,
        platform: PlatformId,
        valid: bool,
    ) -> Result<(), StoreError> {
        self.with_credential(owner_id, platform, |credential| {
            credential.is_expired = !valid;
            credential.last_validated_at = Some(Utc::now());
        })
    }

    async fn append_usage(&self, usage: NewUsage<'_>) -> Result<(), StoreError> {
        let mut records = lock_or_poisoned(&self.usage);
        let id = i64::try_from(records.len()).unwrap_or(i64::MAX).saturating_add(1);
        records.push(UsageRecord {
            id,
            owner_id: usage.owner_id.to_owned(),
            platform: usage.platform,
            model: usage.model.to_owned(),
            usage: usage.usage,
            latency_ms: usage.latency_ms,
            outcome: usage.outcome.to_owned(),
            error: usage.error.map(str::to_owned),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn recent_usage(
        &self,
        owner_id: &str,
        platform: Option<PlatformId>,
        limit: u32,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let records = lock_or_poisoned(&self.usage);
        Ok(records
            .iter()
            .rev()
            .filter(|record| {
                record.owner_id == owner_id
                    && platform.is_none_or(|wanted| record.platform == wanted)
            })
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}
