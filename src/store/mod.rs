//! Credential persistence and usage accounting.
//!
//! One credential row per `(owner_id, platform)` — enforced by the primary
//! key, so re-authorizing a platform replaces the previous credential instead
//! of accumulating stale ones. Every chat call appends a usage record, and
//! quota counters move through atomic in-database increments so concurrent
//! calls never lose an update.
//!
//! [`SqliteStore`] is the production backend; [`MemoryStore`] backs tests and
//! ephemeral runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::credential::Credential;
use crate::platforms::PlatformId;
use crate::schema::TokenUsage;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// An operation addressed a credential that is not stored.
    #[error("no stored credential for {owner_id} on {platform}")]
    MissingCredential {
        /// Owner whose credential was addressed.
        owner_id: String,
        /// Platform the credential was for.
        platform: PlatformId,
    },
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Quota counters after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    /// Tokens consumed so far.
    pub quota_used: u64,
    /// Token allowance.
    pub quota_limit: u64,
}

impl QuotaSnapshot {
    /// Whether the allowance is used up.
    pub fn exhausted(&self) -> bool {
        self.quota_used >= self.quota_limit
    }
}

/// One row of the usage log.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    /// Row identifier, monotonically increasing.
    pub id: i64,
    /// Owner the call was made for.
    pub owner_id: String,
    /// Platform the call went to.
    pub platform: PlatformId,
    /// Model that served (or would have served) the call.
    pub model: String,
    /// Token accounting for the call.
    pub usage: TokenUsage,
    /// Wall-clock latency of the call in milliseconds.
    pub latency_ms: u64,
    /// `"ok"`, `"expired"`, or `"error"`.
    pub outcome: String,
    /// Error detail for non-ok outcomes.
    pub error: Option<String>,
    /// When the call happened.
    pub created_at: DateTime<Utc>,
}

/// Parameters for appending a usage record.
#[derive(Debug, Clone)]
pub struct NewUsage<'a> {
    /// Owner the call was made for.
    pub owner_id: &'a str,
    /// Platform the call went to.
    pub platform: PlatformId,
    /// Model that served (or would have served) the call.
    pub model: &'a str,
    /// Token accounting for the call.
    pub usage: TokenUsage,
    /// Wall-clock latency of the call in milliseconds.
    pub latency_ms: u64,
    /// `"ok"`, `"expired"`, or `"error"`.
    pub outcome: &'a str,
    /// Error detail for non-ok outcomes.
    pub error: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Keyed credential persistence plus usage accounting.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the credential for `(owner_id, platform)`, if any.
    async fn get(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Result<Option<Credential>, StoreError>;

    /// Insert or replace the credential for its `(owner_id, platform)` key.
    async fn upsert(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Delete the credential. Returns whether a row existed.
    async fn delete(&self, owner_id: &str, platform: PlatformId) -> Result<bool, StoreError>;

    /// Atomically add `tokens` to the quota counter and stamp
    /// `last_used_at`. Returns the counters after the increment.
    async fn add_usage(
        &self,
        owner_id: &str,
        platform: PlatformId,
        tokens: u64,
    ) -> Result<QuotaSnapshot, StoreError>;

    /// Flip the credential to expired.
    async fn mark_expired(&self, owner_id: &str, platform: PlatformId) -> Result<(), StoreError>;

    /// Record a validation probe: stamps `last_validated_at` and sets
    /// `is_expired` to the opposite of `valid`.
    async fn mark_validated(
        &self,
        owner_id: &str,
        platform: PlatformId,
        valid: bool,
    ) -> Result<(), StoreError>;

    /// Append one usage record.
    async fn append_usage(&self, usage: NewUsage<'_>) -> Result<(), StoreError>;

    /// Newest usage records for an owner, most recent first, optionally
    /// narrowed to one platform.
    async fn recent_usage(
        &self,
        owner_id: &str,
        platform: Option<PlatformId>,
        limit: u32,
    ) -> Result<Vec<UsageRecord>, StoreError>;
}

/// Parse an RFC 3339 timestamp or return now.
pub(crate) fn parse_rfc3339_or_now(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
