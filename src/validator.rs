//! Credential liveness probes.
//!
//! A probe issues one authenticated GET against the platform's validation
//! endpoint and classifies the answer: an authenticated 2xx keeps the
//! credential alive, a login wall or outright rejection flips `is_expired`.
//! Probes never touch quota counters — checking a credential must not spend
//! the allowance it is checking.
//!
//! Redirects are never followed. A bounce to a login page is the signal this
//! module exists to catch, and following it would dissolve that signal into
//! a 200.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::LOCATION;
use reqwest::StatusCode;
use tracing::{error, info, warn};

use crate::cipher::{CipherError, CredentialCipher};
use crate::platforms::{self, PlatformId};
use crate::store::{CredentialStore, StoreError};

/// Probe attempts before giving up on a transport-level failure.
const PROBE_ATTEMPTS: u32 = 3;

/// Initial backoff between probe attempts, in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 250;

/// Maximum backoff between probe attempts, in milliseconds.
const MAX_BACKOFF_MS: u64 = 2_000;

/// Connect timeout for the probe request.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Overall timeout for the probe request.
const REQUEST_TIMEOUT_SECS: u64 = 20;

/// Path fragments that mark a redirect target as a login wall.
const LOGIN_WALL_MARKERS: &[&str] = &["login", "signin", "sign-in", "passport", "sso", "auth"];

// ---------------------------------------------------------------------------
// Errors and verdicts
// ---------------------------------------------------------------------------

/// Errors from the validation layer.
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    /// No credential is stored for the addressed key.
    #[error("no stored credential for {owner_id} on {platform}")]
    NotFound {
        /// Owner whose credential was addressed.
        owner_id: String,
        /// Platform the credential was for.
        platform: PlatformId,
    },
    /// The stored blob failed authenticated decryption.
    #[error("stored credential for {platform} is unreadable: {source}")]
    Undecryptable {
        /// Platform the credential was for.
        platform: PlatformId,
        /// The cipher failure.
        #[source]
        source: CipherError,
    },
    /// The probe HTTP client could not be built.
    #[error("failed to build validation HTTP client: {0}")]
    Client(String),
    /// The platform never gave a conclusive answer.
    #[error("validation probe inconclusive after {attempts} attempts: {detail}")]
    Probe {
        /// How many attempts were made.
        attempts: u32,
        /// The last transport failure or non-verdict status.
        detail: String,
    },
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Conclusive answer from a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    /// The platform answered as an authenticated user.
    Valid,
    /// The platform rejected the cookies or bounced to a login wall.
    Invalid {
        /// What the platform answered.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Probes stored credentials against their platform's validation endpoint.
pub struct CredentialValidator {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<CredentialCipher>,
    client: reqwest::Client,
}

impl std::fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialValidator").finish()
    }
}

impl CredentialValidator {
    /// Build a validator over the given store and cipher.
    ///
    /// # Errors
    ///
    /// Returns [`ValidatorError::Client`] if the redirect-free HTTP client
    /// cannot be constructed.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<CredentialCipher>,
    ) -> Result<Self, ValidatorError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ValidatorError::Client(e.to_string()))?;
        Ok(Self {
            store,
            cipher,
            client,
        })
    }

    /// Probe the stored credential for `(owner_id, platform)` and record the
    /// verdict.
    ///
    /// A conclusive verdict stamps `last_validated_at` and sets `is_expired`
    /// accordingly. A transport failure records nothing — an unreachable
    /// platform says nothing about the cookies.
    ///
    /// # Errors
    ///
    /// [`ValidatorError::NotFound`] when nothing is stored,
    /// [`ValidatorError::Undecryptable`] when the blob will not decrypt (the
    /// credential is flipped to expired first), and
    /// [`ValidatorError::Probe`] when every attempt was inconclusive.
    pub async fn check(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Result<Validity, ValidatorError> {
        let credential = self
            .store
            .get(owner_id, platform)
            .await?
            .ok_or_else(|| ValidatorError::NotFound {
                owner_id: owner_id.to_owned(),
                platform,
            })?;

        let payload = match self.cipher.decrypt(&credential.cipher_blob) {
            Ok(payload) => payload,
            Err(source) => {
                error!(
                    owner_id,
                    platform = %platform,
                    "stored credential failed authenticated decryption, marking expired"
                );
                self.store.mark_expired(owner_id, platform).await?;
                return Err(ValidatorError::Undecryptable { platform, source });
            }
        };

        let descriptor = platforms::descriptor(platform);
        let verdict = self
            .probe(descriptor.validation_url, platforms::wire_headers(descriptor, &payload))
            .await?;

        match &verdict {
            Validity::Valid => {
                info!(owner_id, platform = %platform, "credential validated");
                self.store.mark_validated(owner_id, platform, true).await?;
            }
            Validity::Invalid { reason } => {
                warn!(owner_id, platform = %platform, reason, "credential invalid");
                self.store.mark_validated(owner_id, platform, false).await?;
            }
        }
        Ok(verdict)
    }

    /// Issue the GET probe, retrying transport failures with backoff.
    async fn probe(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> Result<Validity, ValidatorError> {
        let mut backoff_ms: u64 = INITIAL_BACKOFF_MS;
        let mut last_failure = String::new();

        for attempt in 1..=PROBE_ATTEMPTS {
            let mut request = self.client.get(url);
            for (name, value) in &headers {
                request = request.header(name, value);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let location = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    if let Some(validity) = classify_probe(status, location.as_deref()) {
                        return Ok(validity);
                    }
                    last_failure = format!("platform answered {status}");
                }
                Err(e) => {
                    last_failure = e.to_string();
                }
            }

            if attempt < PROBE_ATTEMPTS {
                warn!(
                    attempt,
                    backoff_ms,
                    failure = %last_failure,
                    "validation probe inconclusive, backing off"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
            }
        }

        Err(ValidatorError::Probe {
            attempts: PROBE_ATTEMPTS,
            detail: last_failure,
        })
    }
}

// ---------------------------------------------------------------------------
// Probe classification
// ---------------------------------------------------------------------------

/// Map a probe answer to a verdict, or `None` when the answer says nothing
/// about the credential (server errors, throttling, statuses outside the
/// authentication contract).
fn classify_probe(status: StatusCode, location: Option<&str>) -> Option<Validity> {
    if status.is_success() {
        return Some(Validity::Valid);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Some(Validity::Invalid {
            reason: format!("platform answered {status}"),
        });
    }
    if status.is_redirection() {
        let target = location?;
        if looks_like_login_wall(target) {
            return Some(Validity::Invalid {
                reason: format!("bounced to login wall: {target}"),
            });
        }
        // An authenticated redirect (regional mirror, canonical host) still
        // means the cookies were accepted.
        return Some(Validity::Valid);
    }
    None
}

/// Whether a redirect target points at a login page.
///
/// Shared with the dispatcher, which treats a login-wall redirect on a chat
/// endpoint the same way a probe does.
pub(crate) fn looks_like_login_wall(location: &str) -> bool {
    let lowered = location.to_lowercase();
    LOGIN_WALL_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
