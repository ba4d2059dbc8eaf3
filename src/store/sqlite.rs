//! SQLite-backed [`CredentialStore`].
//!
//! One pool for the process; the schema is bootstrapped on connect with
//! `CREATE TABLE IF NOT EXISTS` so the first run needs no migration step.
//! Quota increments go through a single `UPDATE ... RETURNING` statement so
//! concurrent dispatcher calls never read-modify-write a stale counter.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::credential::Credential;
use crate::platforms::PlatformId;
use crate::schema::TokenUsage;

use super::{
    parse_rfc3339_or_now, CredentialStore, NewUsage, QuotaSnapshot, StoreError, UsageRecord,
};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Bootstrap statements, executed in order on connect.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS credentials (
        owner_id          TEXT NOT NULL,
        platform          TEXT NOT NULL,
        cipher_blob       TEXT NOT NULL,
        issued_at         TEXT NOT NULL,
        last_validated_at TEXT,
        last_used_at      TEXT,
        is_expired        INTEGER NOT NULL DEFAULT 0,
        quota_used        INTEGER NOT NULL DEFAULT 0,
        quota_limit       INTEGER NOT NULL,
        PRIMARY KEY (owner_id, platform)
    )",
    "CREATE TABLE IF NOT EXISTS usage_log (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id          TEXT NOT NULL,
        platform          TEXT NOT NULL,
        model             TEXT NOT NULL,
        prompt_tokens     INTEGER NOT NULL,
        completion_tokens INTEGER NOT NULL,
        latency_ms        INTEGER NOT NULL,
        outcome           TEXT NOT NULL,
        error             TEXT,
        created_at        TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_usage_log_owner ON usage_log(owner_id, platform)",
];

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Credential and usage persistence backed by a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and bootstrap the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened or a
    /// bootstrap statement fails.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        bootstrap(&pool).await?;
        debug!(path = %path.display(), "credential store ready");
        Ok(Self { pool })
    }

    /// Open an in-memory database for tests and ephemeral runs.
    ///
    /// Capped at one connection — each SQLite in-memory connection is its own
    /// database, so a larger pool would scatter rows across several.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a bootstrap statement fails.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        bootstrap(&pool).await?;
        Ok(Self { pool })
    }
}

/// Run the bootstrap statements in order.
async fn bootstrap(pool: &SqlitePool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Build a [`Credential`] from a `credentials` row.
///
/// The caller supplies the platform — it is part of the lookup key, so
/// re-parsing the column would only manufacture an error path.
fn credential_from_row(row: &SqliteRow, owner_id: &str, platform: PlatformId) -> Credential {
    Credential {
        owner_id: owner_id.to_owned(),
        platform,
        cipher_blob: row.get("cipher_blob"),
        issued_at: parse_rfc3339_or_now(&row.get::<String, _>("issued_at")),
        last_validated_at: row
            .get::<Option<String>, _>("last_validated_at")
            .as_deref()
            .map(parse_rfc3339_or_now),
        last_used_at: row
            .get::<Option<String>, _>("last_used_at")
            .as_deref()
            .map(parse_rfc3339_or_now),
        is_expired: row.get::<i64, _>("is_expired") != 0,
        quota_used: read_u64(row, "quota_used"),
        quota_limit: read_u64(row, "quota_limit"),
    }
}

/// Build a [`UsageRecord`] from a `usage_log` row.
///
/// Returns `None` (with a warning) when the platform column does not parse —
/// a row written by some other version of the schema should not poison the
/// whole listing.
fn usage_from_row(row: &SqliteRow) -> Option<UsageRecord> {
    let platform_column: String = row.get("platform");
    let Ok(platform) = platform_column.parse::<PlatformId>() else {
        warn!(platform = %platform_column, "skipping usage row with unknown platform");
        return None;
    };
    Some(UsageRecord {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        platform,
        model: row.get("model"),
        usage: TokenUsage {
            prompt_tokens: read_u64(row, "prompt_tokens"),
            completion_tokens: read_u64(row, "completion_tokens"),
        },
        latency_ms: read_u64(row, "latency_ms"),
        outcome: row.get("outcome"),
        error: row.get("error"),
        created_at: parse_rfc3339_or_now(&row.get::<String, _>("created_at")),
    })
}

/// Read an INTEGER column as `u64`, clamping negatives to zero.
fn read_u64(row: &SqliteRow, column: &str) -> u64 {
    u64::try_from(row.get::<i64, _>(column)).unwrap_or(0)
}

/// Clamp a `u64` counter into SQLite's signed integer range.
fn bind_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn get(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Result<Option<Credential>, StoreError> {
        let row = sqlx::query(
            "SELECT cipher_blob, issued_at, last_validated_at, last_used_at, \
             is_expired, quota_used, quota_limit \
             FROM credentials WHERE owner_id = ?1 AND platform = ?2",
        )
        .bind(owner_id)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| credential_from_row(&row, owner_id, platform)))
    }

    async fn upsert(&self, credential: &Credential) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO credentials \
             (owner_id, platform, cipher_blob, issued_at, last_validated_at, \
              last_used_at, is_expired, quota_used, quota_limit) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&credential.owner_id)
        .bind(credential.platform.as_str())
        .bind(&credential.cipher_blob)
        .bind(credential.issued_at.to_rfc3339())
        .bind(credential.last_validated_at.map(|dt| dt.to_rfc3339()))
        .bind(credential.last_used_at.map(|dt| dt.to_rfc3339()))
        .bind(i64::from(credential.is_expired))
        .bind(bind_u64(credential.quota_used))
        .bind(bind_u64(credential.quota_limit))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, owner_id: &str, platform: PlatformId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM credentials WHERE owner_id = ?1 AND platform = ?2")
            .bind(owner_id)
            .bind(platform.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_usage(
        &self,
        owner_id: &str,
        platform: PlatformId,
        tokens: u64,
    ) -> Result<QuotaSnapshot, StoreError> {
        let row = sqlx::query(
            "UPDATE credentials \
             SET quota_used = quota_used + ?3, last_used_at = ?4 \
             WHERE owner_id = ?1 AND platform = ?2 \
             RETURNING quota_used, quota_limit",
        )
        .bind(owner_id)
        .bind(platform.as_str())
        .bind(bind_u64(tokens))
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::MissingCredential {
            owner_id: owner_id.to_owned(),
            platform,
        })?;

        Ok(QuotaSnapshot {
            quota_used: read_u64(&row, "quota_used"),
            quota_limit: read_u64(&row, "quota_limit"),
        })
    }

    async fn mark_expired(&self, owner_id: &str, platform: PlatformId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE credentials SET is_expired = 1 WHERE owner_id = ?1 AND platform = ?2",
        )
        .bind(owner_id)
        .bind(platform.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MissingCredential {
                owner_id: owner_id.to_owned(),
                platform,
            });
        }
        Ok(())
    }

    async fn mark_validated(
        &self,
        owner_id: &str,
        platform: PlatformId,
        valid: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE credentials SET last_validated_at = ?3, is_expired = ?4 \
             WHERE owner_id = ?1 AND platform = ?2",
        )
        .bind(owner_id)
        .bind(platform.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(i64::from(!valid))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MissingCredential {
                owner_id: owner_id.to_owned(),
                platform,
            });
        }
        Ok(())
    }

    async fn append_usage(&self, usage: NewUsage<'_>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO usage_log \
             (owner_id, platform, model, prompt_tokens, completion_tokens, \
              latency_ms, outcome, error, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(usage.owner_id)
        .bind(usage.platform.as_str())
        .bind(usage.model)
        .bind(bind_u64(usage.usage.prompt_tokens))
        .bind(bind_u64(usage.usage.completion_tokens))
        .bind(bind_u64(usage.latency_ms))
        .bind(usage.outcome)
        .bind(usage.error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_usage(
        &self,
        owner_id: &str,
        platform: Option<PlatformId>,
        limit: u32,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        const COLUMNS: &str = "id, owner_id, platform, model, prompt_tokens, \
             completion_tokens, latency_ms, outcome, error, created_at";

        let rows = match platform {
            Some(platform) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM usage_log \
                     WHERE owner_id = ?1 AND platform = ?2 \
                     ORDER BY id DESC LIMIT ?3"
                ))
                .bind(owner_id)
                .bind(platform.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM usage_log \
                     WHERE owner_id = ?1 ORDER BY id DESC LIMIT ?2"
                ))
                .bind(owner_id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().filter_map(usage_from_row).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
