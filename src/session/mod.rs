//! Authorization session state machine.
//!
//! One session per `(owner_id, platform)` drives a human login through a
//! browser context: `Created → AwaitingLogin → LoggedIn → Finalized`, with
//! `Expired` (deadline or second shape failure) and `Cancelled` (explicit)
//! as the other terminal states. The map holds at most one live session per
//! key — starting over force-cancels whatever was there.
//!
//! Every session carries a hard wall-clock deadline independent of any
//! single operation's own budget. Operations check it on entry, the
//! [`SessionManager::expire_overdue`] sweep catches sessions nobody is
//! polling, and expiry always closes the browser context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::cipher::{CipherError, CredentialCipher};
use crate::credential::Credential;
use crate::engine::{AutomationEngine, ContextLease, EngineError, QrSnapshot};
use crate::platforms::{self, PlatformError, PlatformId};
use crate::store::{CredentialStore, StoreError};

/// Pause between login polls when a caller loops on
/// [`SessionManager::poll_authorization`]; exposed so callers and the CLI
/// agree on one cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// States and errors
// ---------------------------------------------------------------------------

/// Lifecycle states of one authorization session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// Session exists; the browser context is still being prepared.
    Created,
    /// Login page is up; waiting for the human to complete the login.
    AwaitingLogin,
    /// Login detected; credential not yet extracted.
    LoggedIn,
    /// Credential extracted, encrypted, and stored. Terminal.
    Finalized,
    /// Deadline passed or extraction gave up. Terminal.
    Expired,
    /// Explicitly cancelled. Terminal.
    Cancelled,
}

impl AuthState {
    /// Whether the session can never progress again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Expired | Self::Cancelled)
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::AwaitingLogin => "awaiting_login",
            Self::LoggedIn => "logged_in",
            Self::Finalized => "finalized",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Errors from the authorization flow.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session exists for the key.
    #[error("no authorization session for {owner_id} on {platform}")]
    NoSession {
        /// Owner the session would belong to.
        owner_id: String,
        /// Platform the session would be for.
        platform: PlatformId,
    },
    /// The operation is not valid in the session's current state.
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        /// Current session state.
        state: AuthState,
        /// The rejected operation.
        operation: &'static str,
    },
    /// The session hit its wall-clock deadline; the context is closed.
    #[error("authorization session expired after {seconds}s; restart the login")]
    SessionExpired {
        /// The deadline that was exceeded.
        seconds: u64,
    },
    /// Extracted cookies failed the platform's shape requirements.
    ///
    /// Raised once with the session left alive for a single re-extraction;
    /// a second failure expires the session.
    #[error("extracted credential rejected: {0}")]
    ShapeInvalid(#[source] PlatformError),
    /// Browser automation failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Credential encryption failure.
    #[error(transparent)]
    Cipher(#[from] CipherError),
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Session record
// ---------------------------------------------------------------------------

type SessionKey = (String, PlatformId);

/// One live authorization flow.
struct AuthSession {
    owner_id: String,
    platform: PlatformId,
    state: AuthState,
    lease: Option<ContextLease>,
    started_at: Instant,
    deadline: Duration,
    reextraction_used: bool,
}

impl AuthSession {
    fn remaining(&self) -> Duration {
        self.deadline.saturating_sub(self.started_at.elapsed())
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            owner_id: self.owner_id.clone(),
            platform: self.platform,
            state: self.state,
            seconds_remaining: self.remaining().as_secs(),
        }
    }
}

/// Caller-facing snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Owner the session belongs to.
    pub owner_id: String,
    /// Platform being authorized.
    pub platform: PlatformId,
    /// Current lifecycle state.
    pub state: AuthState,
    /// Wall-clock seconds left before the deadline.
    pub seconds_remaining: u64,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns every live authorization session and the transitions between their
/// states.
pub struct SessionManager {
    engine: Arc<AutomationEngine>,
    store: Arc<dyn CredentialStore>,
    cipher: Arc<CredentialCipher>,
    sessions: Mutex<HashMap<SessionKey, Arc<AsyncMutex<AuthSession>>>>,
    session_ttl: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_ttl", &self.session_ttl)
            .finish()
    }
}

impl SessionManager {
    /// Build a manager over the given engine, store, and cipher.
    ///
    /// `session_ttl` is the hard wall-clock deadline per session.
    pub fn new(
        engine: Arc<AutomationEngine>,
        store: Arc<dyn CredentialStore>,
        cipher: Arc<CredentialCipher>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            engine,
            store,
            cipher,
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
        }
    }

    /// Start (or restart) the authorization flow for `(owner_id, platform)`.
    ///
    /// Any existing live session for the key is cancelled first. On success
    /// the session is in [`AuthState::AwaitingLogin`] with the platform's
    /// login page up and the login affordance clicked.
    ///
    /// # Errors
    ///
    /// Engine failures tear the fresh session down and surface; the caller
    /// can start again.
    pub async fn start_authorization(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Result<SessionStatus, SessionError> {
        let key = (owner_id.to_owned(), platform);

        let stale = lock_or_poisoned(&self.sessions).remove(&key);
        if let Some(stale) = stale {
            let mut stale = stale.lock().await;
            if !stale.state.is_terminal() {
                info!(
                    owner_id,
                    platform = %platform,
                    state = %stale.state,
                    "cancelling stale session before restart"
                );
                close_lease(&mut stale).await;
                stale.state = AuthState::Cancelled;
            }
        }

        let session = Arc::new(AsyncMutex::new(AuthSession {
            owner_id: owner_id.to_owned(),
            platform,
            state: AuthState::Created,
            lease: None,
            started_at: Instant::now(),
            deadline: self.session_ttl,
            reextraction_used: false,
        }));
        let mut guard = session.lock().await;
        lock_or_poisoned(&self.sessions).insert(key.clone(), Arc::clone(&session));

        if let Err(e) = self.drive_start(&mut guard).await {
            close_lease(&mut guard).await;
            lock_or_poisoned(&self.sessions).remove(&key);
            return Err(e);
        }

        guard.state = AuthState::AwaitingLogin;
        info!(owner_id, platform = %platform, "authorization session awaiting login");
        Ok(guard.status())
    }

    /// Open the context, bring up the login page, and poke the login dialog.
    async fn drive_start(&self, session: &mut AuthSession) -> Result<(), SessionError> {
        let descriptor = platforms::descriptor(session.platform);

        let lease = self.engine.open_context(session.remaining()).await?;
        session.lease = Some(lease);

        let lease = session_lease(session, "start authorization")?;
        self.engine
            .navigate(lease, descriptor.login_url, session.remaining())
            .await?;
        self.engine
            .click_login_affordance(lease, session.remaining())
            .await?;
        Ok(())
    }

    /// Capture a fresh QR snapshot for the human to scan.
    ///
    /// Captured on demand rather than cached — several platforms rotate the
    /// code while the page is open.
    ///
    /// # Errors
    ///
    /// Valid only in [`AuthState::AwaitingLogin`]; expired sessions are torn
    /// down and reported.
    pub async fn qr_snapshot(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Result<QrSnapshot, SessionError> {
        let (key, session) = self.lookup(owner_id, platform)?;
        let mut session = session.lock().await;
        self.ensure_live(&key, &mut session).await?;

        if session.state != AuthState::AwaitingLogin {
            return Err(SessionError::InvalidState {
                state: session.state,
                operation: "capture a QR snapshot",
            });
        }

        let descriptor = platforms::descriptor(platform);
        let remaining = session.remaining();
        let lease = session_lease(&session, "capture a QR snapshot")?;
        let result = self
            .engine
            .capture_qr(lease, descriptor.qr_selector, remaining)
            .await;
        self.surface_engine_result(&key, &mut session, result).await
    }

    /// Check once whether the human has completed the login.
    ///
    /// In [`AuthState::AwaitingLogin`] this probes the page and moves to
    /// [`AuthState::LoggedIn`] on success; in any other state it just
    /// reports the session unchanged, so callers can poll their way through
    /// the whole flow.
    ///
    /// # Errors
    ///
    /// Expired sessions are torn down and reported; driver failures surface.
    pub async fn poll_authorization(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Result<SessionStatus, SessionError> {
        let (key, session) = self.lookup(owner_id, platform)?;
        let mut session = session.lock().await;
        self.ensure_live(&key, &mut session).await?;

        if session.state == AuthState::AwaitingLogin {
            let descriptor = platforms::descriptor(platform);
            let remaining = session.remaining();
            let lease = session_lease(&session, "poll login state")?;
            let result = self
                .engine
                .poll_login_state(lease, &descriptor.login_detect, remaining)
                .await;
            let logged_in = self.surface_engine_result(&key, &mut session, result).await?;
            if logged_in {
                info!(owner_id, platform = %platform, "login detected");
                session.state = AuthState::LoggedIn;
            }
        }
        Ok(session.status())
    }

    /// Extract, validate, encrypt, and store the credential, finishing the
    /// session.
    ///
    /// A shape failure leaves the session in [`AuthState::LoggedIn`] for
    /// exactly one more attempt; failing again expires it.
    ///
    /// # Errors
    ///
    /// Valid only in [`AuthState::LoggedIn`].
    /// [`SessionError::ShapeInvalid`] as described; engine, cipher, and
    /// store failures surface with the session left alive for a retry.
    pub async fn finalize_authorization(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Result<Credential, SessionError> {
        let (key, session) = self.lookup(owner_id, platform)?;
        let mut session = session.lock().await;
        self.ensure_live(&key, &mut session).await?;

        if session.state != AuthState::LoggedIn {
            return Err(SessionError::InvalidState {
                state: session.state,
                operation: "finalize authorization",
            });
        }

        let descriptor = platforms::descriptor(platform);
        let remaining = session.remaining();
        let lease = session_lease(&session, "finalize authorization")?;
        let result = self
            .engine
            .extract_credential(lease, descriptor, remaining)
            .await;
        let payload = self.surface_engine_result(&key, &mut session, result).await?;

        if let Err(shape) = platforms::validate_credential_shape(platform, &payload.cookies) {
            if session.reextraction_used {
                warn!(
                    owner_id,
                    platform = %platform,
                    "second extraction failed shape validation, expiring session"
                );
                self.expire_in_place(&key, &mut session).await;
            } else {
                warn!(
                    owner_id,
                    platform = %platform,
                    "extraction failed shape validation, one retry left"
                );
                session.reextraction_used = true;
            }
            return Err(SessionError::ShapeInvalid(shape));
        }

        let cipher_blob = self.cipher.encrypt(&payload)?;
        let credential =
            Credential::fresh(owner_id, platform, cipher_blob, descriptor.default_quota);
        self.store.upsert(&credential).await?;

        session.state = AuthState::Finalized;
        close_lease(&mut session).await;
        lock_or_poisoned(&self.sessions).remove(&key);
        info!(owner_id, platform = %platform, "authorization finalized, credential stored");
        Ok(credential)
    }

    /// Cancel the session and close its context.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoSession`] when nothing is live for the key.
    pub async fn cancel_authorization(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Result<(), SessionError> {
        let key = (owner_id.to_owned(), platform);
        let session = lock_or_poisoned(&self.sessions).remove(&key).ok_or_else(|| {
            SessionError::NoSession {
                owner_id: owner_id.to_owned(),
                platform,
            }
        })?;
        let mut session = session.lock().await;
        close_lease(&mut session).await;
        session.state = AuthState::Cancelled;
        info!(owner_id, platform = %platform, "authorization session cancelled");
        Ok(())
    }

    /// Current snapshot of the session for the key, if one is live.
    pub async fn session_status(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Option<SessionStatus> {
        let (_, session) = self.lookup(owner_id, platform).ok()?;
        let session = session.lock().await;
        Some(session.status())
    }

    /// Expire every overdue session, closing contexts. Returns how many
    /// were expired.
    ///
    /// Sessions currently inside an operation are skipped — they check the
    /// deadline themselves on entry, and their operation budget is already
    /// capped by the remaining wall-clock.
    pub async fn expire_overdue(&self) -> usize {
        let candidates: Vec<(SessionKey, Arc<AsyncMutex<AuthSession>>)> = lock_or_poisoned(
            &self.sessions,
        )
        .iter()
        .map(|(key, session)| (key.clone(), Arc::clone(session)))
        .collect();

        let mut expired = 0_usize;
        for (key, session) in candidates {
            let Ok(mut session) = session.try_lock() else {
                continue;
            };
            if session.state.is_terminal() || !session.remaining().is_zero() {
                continue;
            }
            info!(
                owner_id = %key.0,
                platform = %key.1,
                state = %session.state,
                "expiring overdue authorization session"
            );
            self.expire_in_place(&key, &mut session).await;
            expired = expired.saturating_add(1);
        }
        expired
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Fetch the live session handle for a key.
    fn lookup(
        &self,
        owner_id: &str,
        platform: PlatformId,
    ) -> Result<(SessionKey, Arc<AsyncMutex<AuthSession>>), SessionError> {
        let key = (owner_id.to_owned(), platform);
        let session = lock_or_poisoned(&self.sessions)
            .get(&key)
            .map(Arc::clone)
            .ok_or_else(|| SessionError::NoSession {
                owner_id: owner_id.to_owned(),
                platform,
            })?;
        Ok((key, session))
    }

    /// Reject terminal sessions and expire overdue ones on operation entry.
    async fn ensure_live(
        &self,
        key: &SessionKey,
        session: &mut AuthSession,
    ) -> Result<(), SessionError> {
        if session.state.is_terminal() {
            return Err(SessionError::InvalidState {
                state: session.state,
                operation: "proceed",
            });
        }
        if session.remaining().is_zero() {
            self.expire_in_place(key, session).await;
            return Err(SessionError::SessionExpired {
                seconds: session.deadline.as_secs(),
            });
        }
        Ok(())
    }

    /// Map an engine result, expiring the session when the engine hit the
    /// wall-clock deadline mid-operation.
    async fn surface_engine_result<T>(
        &self,
        key: &SessionKey,
        session: &mut AuthSession,
        result: Result<T, EngineError>,
    ) -> Result<T, SessionError> {
        match result {
            Ok(value) => Ok(value),
            Err(EngineError::AutomationTimeout { seconds }) => {
                warn!(
                    owner_id = %key.0,
                    platform = %key.1,
                    seconds,
                    "operation hit the session deadline, expiring session"
                );
                self.expire_in_place(key, session).await;
                Err(EngineError::AutomationTimeout { seconds }.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close the context, mark the session expired, and drop it from the map.
    async fn expire_in_place(&self, key: &SessionKey, session: &mut AuthSession) {
        close_lease(session).await;
        session.state = AuthState::Expired;
        lock_or_poisoned(&self.sessions).remove(key);
    }
}

/// Run the session expiry sweep as a background loop.
///
/// Ticks every `every` and expires overdue sessions nobody is polling, so
/// abandoned logins cannot pin browser contexts past the deadline. Exits
/// when the shutdown signal is received or the watch channel closes.
pub async fn run_expiry_sweep(
    manager: Arc<SessionManager>,
    every: Duration,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    info!(every_secs = every.as_secs(), "session expiry sweep started");
    let mut interval = tokio::time::interval(every);

    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let expired = manager.expire_overdue().await;
                if expired > 0 {
                    debug!(expired, "expiry sweep closed overdue sessions");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("session expiry sweep shutting down");
                    break;
                }
            }
        }
    }
}

/// Close and clear the session's context lease, if any.
async fn close_lease(session: &mut AuthSession) {
    if let Some(lease) = session.lease.take() {
        if let Err(e) = lease.close().await {
            warn!(
                owner_id = %session.owner_id,
                platform = %session.platform,
                error = %e,
                "browser context close failed"
            );
        }
    }
}

/// Borrow the session's lease; absence means the state machine was broken.
fn session_lease<'a>(
    session: &'a AuthSession,
    operation: &'static str,
) -> Result<&'a ContextLease, SessionError> {
    session.lease.as_ref().ok_or(SessionError::InvalidState {
        state: session.state,
        operation,
    })
}

/// Lock a mutex, riding through poisoning — session records stay usable
/// even if a panicking task died holding the map.
fn lock_or_poisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
