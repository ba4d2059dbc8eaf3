//! Credential records and harvested session payloads.
//!
//! A [`CredentialPayload`] is the plaintext form of what a login flow
//! harvests: cookies, interesting localStorage entries, and the browser's
//! user agent. It exists in memory only — persistence always goes through
//! [`crate::cipher::CredentialCipher`], and its `Debug` impl never prints
//! cookie or token values.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::platforms::PlatformId;

/// Plaintext session artifacts harvested from a browser context.
///
/// Cookie and storage maps are ordered so serialization (and therefore the
/// encrypted blob and the `Cookie` header) is deterministic for equal
/// payloads.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPayload {
    /// Session cookies by name.
    pub cookies: BTreeMap<String, String>,
    /// localStorage entries that look like auth material.
    #[serde(default)]
    pub storage_tokens: BTreeMap<String, String>,
    /// The user agent the cookies were issued to.
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl CredentialPayload {
    /// Build a payload from plain cookie pairs.
    pub fn from_cookies<K, V>(cookies: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            cookies: cookies
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            storage_tokens: BTreeMap::new(),
            user_agent: None,
        }
    }

    /// Render the cookies as a `Cookie` request-header value.
    pub fn cookie_header(&self) -> String {
        let mut header = String::new();
        for (name, value) in &self.cookies {
            if !header.is_empty() {
                header.push_str("; ");
            }
            header.push_str(name);
            header.push('=');
            header.push_str(value);
        }
        header
    }

    /// True when no cookies were harvested at all.
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

impl fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPayload")
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field(
                "storage_tokens",
                &self.storage_tokens.keys().collect::<Vec<_>>(),
            )
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// A persisted, encrypted credential for one (owner, platform) pair.
///
/// Created and replaced by the session manager; the dispatcher and validator
/// touch only `quota_used`, `is_expired`, and the bookkeeping timestamps.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Owner the credential belongs to.
    pub owner_id: String,
    /// Platform the credential authenticates against.
    pub platform: PlatformId,
    /// Encrypted payload, base64(nonce ‖ ciphertext).
    pub cipher_blob: String,
    /// When the login flow (or manual submission) produced this credential.
    pub issued_at: DateTime<Utc>,
    /// Last successful liveness check, if any.
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Last successful dispatcher call, if any.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Whether the platform has rejected or a check has invalidated it.
    pub is_expired: bool,
    /// Tokens consumed so far.
    pub quota_used: u64,
    /// Token allowance before the credential stops being used.
    pub quota_limit: u64,
}

impl Credential {
    /// A freshly issued credential: unused quota, never validated, not
    /// expired, issued now.
    pub fn fresh(
        owner_id: impl Into<String>,
        platform: PlatformId,
        cipher_blob: String,
        quota_limit: u64,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            platform,
            cipher_blob,
            issued_at: Utc::now(),
            last_validated_at: None,
            last_used_at: None,
            is_expired: false,
            quota_used: 0,
            quota_limit,
        }
    }

    /// Whether the quota allowance is used up.
    pub fn quota_exhausted(&self) -> bool {
        self.quota_used >= self.quota_limit
    }

    /// Usable means not expired and quota remaining.
    pub fn is_usable(&self) -> bool {
        !self.is_expired && !self.quota_exhausted()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The blob is ciphertext, but there is no reason to splash it into
        // logs; show its size instead.
        f.debug_struct("Credential")
            .field("owner_id", &self.owner_id)
            .field("platform", &self.platform)
            .field("cipher_blob", &format_args!("<{} bytes>", self.cipher_blob.len()))
            .field("issued_at", &self.issued_at)
            .field("last_validated_at", &self.last_validated_at)
            .field("last_used_at", &self.last_used_at)
            .field("is_expired", &self.is_expired)
            .field("quota_used", &self.quota_used)
            .field("quota_limit", &self.quota_limit)
            .finish()
    }
}
