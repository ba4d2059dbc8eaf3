//! One front door over the whole credential lifecycle.
//!
//! The broker owns the session manager, validator, and dispatcher, and is
//! what callers (the CLI, an embedding service) talk to. Platform names
//! cross this boundary as strings and are parsed exactly once; everything
//! behind it works in [`PlatformId`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cipher::{CipherError, CredentialCipher};
use crate::credential::{Credential, CredentialPayload};
use crate::dispatch::{ChatOutcome, DispatchError, RequestDispatcher};
use crate::engine::{AutomationEngine, QrSnapshot};
use crate::platforms::{self, PlatformError, PlatformId};
use crate::schema::ChatRequest;
use crate::session::{SessionError, SessionManager, SessionStatus};
use crate::store::{CredentialStore, StoreError, UsageRecord};
use crate::validator::{CredentialValidator, Validity, ValidatorError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Any failure a broker operation can surface.
///
/// Transparent over the component errors; callers match on the component
/// that matters to them and show the rest.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Unknown platform name or rejected credential shape.
    #[error(transparent)]
    Platform(#[from] PlatformError),
    /// Authorization session failure.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Credential liveness probe failure.
    #[error(transparent)]
    Validator(#[from] ValidatorError),
    /// Chat dispatch failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Encryption failure.
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Facade wiring the session manager, validator, and dispatcher over one
/// store and cipher.
pub struct SessionBroker {
    sessions: Arc<SessionManager>,
    validator: CredentialValidator,
    dispatcher: RequestDispatcher,
    store: Arc<dyn CredentialStore>,
    cipher: Arc<CredentialCipher>,
}

impl std::fmt::Debug for SessionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBroker")
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl SessionBroker {
    /// Wire a broker over the given engine, store, and cipher.
    ///
    /// `session_ttl` is the wall-clock deadline for every authorization
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] when the validator's or dispatcher's HTTP
    /// client cannot be built.
    pub fn new(
        engine: Arc<AutomationEngine>,
        store: Arc<dyn CredentialStore>,
        cipher: Arc<CredentialCipher>,
        session_ttl: Duration,
    ) -> Result<Self, BrokerError> {
        let sessions = Arc::new(SessionManager::new(
            engine,
            Arc::clone(&store),
            Arc::clone(&cipher),
            session_ttl,
        ));
        let validator = CredentialValidator::new(Arc::clone(&store), Arc::clone(&cipher))?;
        let dispatcher = RequestDispatcher::new(Arc::clone(&store), Arc::clone(&cipher))?;
        Ok(Self {
            sessions,
            validator,
            dispatcher,
            store,
            cipher,
        })
    }

    /// The session manager, for driving the expiry sweep.
    pub fn session_manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    // ------------------------------------------------------------------
    // Authorization
    // ------------------------------------------------------------------

    /// Start (or restart) a login session for the owner on a platform.
    ///
    /// # Errors
    ///
    /// Unknown platform names and session failures surface.
    pub async fn start_authorization(
        &self,
        owner_id: &str,
        platform: &str,
    ) -> Result<SessionStatus, BrokerError> {
        let platform = parse_platform(platform)?;
        Ok(self.sessions.start_authorization(owner_id, platform).await?)
    }

    /// Capture a fresh QR snapshot from the owner's login session.
    ///
    /// # Errors
    ///
    /// Valid only while the session awaits login.
    pub async fn qr_snapshot(
        &self,
        owner_id: &str,
        platform: &str,
    ) -> Result<QrSnapshot, BrokerError> {
        let platform = parse_platform(platform)?;
        Ok(self.sessions.qr_snapshot(owner_id, platform).await?)
    }

    /// Check once whether the owner finished logging in.
    ///
    /// # Errors
    ///
    /// Session failures surface; an expired session is reported and gone.
    pub async fn poll_authorization(
        &self,
        owner_id: &str,
        platform: &str,
    ) -> Result<SessionStatus, BrokerError> {
        let platform = parse_platform(platform)?;
        Ok(self.sessions.poll_authorization(owner_id, platform).await?)
    }

    /// Extract, encrypt, and store the credential from a logged-in session.
    ///
    /// # Errors
    ///
    /// Shape rejections leave one retry; see
    /// [`SessionManager::finalize_authorization`].
    pub async fn finalize_authorization(
        &self,
        owner_id: &str,
        platform: &str,
    ) -> Result<Credential, BrokerError> {
        let platform = parse_platform(platform)?;
        Ok(self
            .sessions
            .finalize_authorization(owner_id, platform)
            .await?)
    }

    /// Cancel the owner's login session and close its browser context.
    ///
    /// # Errors
    ///
    /// Reports when no session is live for the key.
    pub async fn cancel_authorization(
        &self,
        owner_id: &str,
        platform: &str,
    ) -> Result<(), BrokerError> {
        let platform = parse_platform(platform)?;
        Ok(self
            .sessions
            .cancel_authorization(owner_id, platform)
            .await?)
    }

    /// Current snapshot of the owner's login session, if one is live.
    ///
    /// # Errors
    ///
    /// Only unknown platform names fail; no session is `Ok(None)`.
    pub async fn session_status(
        &self,
        owner_id: &str,
        platform: &str,
    ) -> Result<Option<SessionStatus>, BrokerError> {
        let platform = parse_platform(platform)?;
        Ok(self.sessions.session_status(owner_id, platform).await)
    }

    /// Store a credential the owner assembled by hand — cookies pasted from
    /// their own browser, plus whatever storage tokens and user agent they
    /// chose to bring — bypassing the browser flow.
    ///
    /// The same shape rules as the automated path apply; the quota allowance
    /// starts at the platform default.
    ///
    /// # Errors
    ///
    /// Shape rejections, encryption, and store failures surface.
    pub async fn submit_credentials(
        &self,
        owner_id: &str,
        platform: &str,
        payload: CredentialPayload,
    ) -> Result<Credential, BrokerError> {
        let platform = parse_platform(platform)?;
        platforms::validate_credential_shape(platform, &payload.cookies)?;

        let cipher_blob = self.cipher.encrypt(&payload)?;
        let descriptor = platforms::descriptor(platform);
        let credential =
            Credential::fresh(owner_id, platform, cipher_blob, descriptor.default_quota);
        self.store.upsert(&credential).await?;
        info!(owner_id, platform = %platform, "pasted credential stored");
        Ok(credential)
    }

    // ------------------------------------------------------------------
    // Credential lifecycle
    // ------------------------------------------------------------------

    /// Probe whether the stored credential still works on the platform.
    ///
    /// # Errors
    ///
    /// Missing credentials, undecryptable blobs, and inconclusive probes
    /// surface; see [`CredentialValidator::check`].
    pub async fn check_credential(
        &self,
        owner_id: &str,
        platform: &str,
    ) -> Result<Validity, BrokerError> {
        let platform = parse_platform(platform)?;
        Ok(self.validator.check(owner_id, platform).await?)
    }

    /// Delete the stored credential. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Unknown platform names and store failures surface.
    pub async fn revoke_credential(
        &self,
        owner_id: &str,
        platform: &str,
    ) -> Result<bool, BrokerError> {
        let platform = parse_platform(platform)?;
        let removed = self.store.delete(owner_id, platform).await?;
        if removed {
            info!(owner_id, platform = %platform, "credential revoked");
        }
        Ok(removed)
    }

    /// The stored credential's metadata, if any.
    ///
    /// # Errors
    ///
    /// Unknown platform names and store failures surface.
    pub async fn credential(
        &self,
        owner_id: &str,
        platform: &str,
    ) -> Result<Option<Credential>, BrokerError> {
        let platform = parse_platform(platform)?;
        Ok(self.store.get(owner_id, platform).await?)
    }

    /// Newest usage records for the owner, most recent first, optionally
    /// narrowed to one platform.
    ///
    /// # Errors
    ///
    /// Unknown platform names and store failures surface.
    pub async fn recent_usage(
        &self,
        owner_id: &str,
        platform: Option<&str>,
        limit: u32,
    ) -> Result<Vec<UsageRecord>, BrokerError> {
        let platform = platform.map(parse_platform).transpose()?;
        Ok(self.store.recent_usage(owner_id, platform, limit).await?)
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    /// Execute one chat call as the owner on a platform.
    ///
    /// # Errors
    ///
    /// Fails before any network call when the credential is missing,
    /// expired, or out of quota; see [`RequestDispatcher::chat`].
    pub async fn chat_completion(
        &self,
        owner_id: &str,
        platform: &str,
        request: ChatRequest,
    ) -> Result<ChatOutcome, BrokerError> {
        let platform = parse_platform(platform)?;
        Ok(self.dispatcher.chat(owner_id, platform, request).await?)
    }
}

/// Parse a platform name at the string boundary.
fn parse_platform(name: &str) -> Result<PlatformId, BrokerError> {
    Ok(name.parse::<PlatformId>()?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
