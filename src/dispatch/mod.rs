//! Chat-completion dispatch against stored credentials.
//!
//! The dispatcher is the only component that puts a credential on the wire.
//! Before any network traffic it re-reads the stored row and fails fast with
//! [`DispatchError::CredentialUnusable`] when the credential is expired or
//! the quota allowance is used up — a rejected call costs zero requests.
//!
//! After a successful call the consumed tokens are added to the quota
//! counter through a single atomic increment, one usage record is appended,
//! and crossing the allowance flips `is_expired` so the next call
//! short-circuits. Generation calls are never retried: a duplicate reply is
//! paid-for work, so transient failures surface to the caller and
//! resubmission stays a caller decision.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, LOCATION};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::cipher::{CipherError, CredentialCipher};
use crate::platforms::{self, PlatformAdapter, PlatformError, PlatformId, StreamState, WireRequest};
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason, TokenUsage};
use crate::store::{CredentialStore, NewUsage, StoreError};
use crate::validator::looks_like_login_wall;

mod sse;

pub use sse::{SseEvent, SseFrameReader};

/// Rough characters-per-token divisor for platforms that report no usage.
const CHARS_PER_TOKEN: u64 = 4;

/// Buffered chunks between the reader task and a streaming caller.
const CHUNK_CHANNEL_CAPACITY: usize = 32;

/// Connect timeout for platform calls.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Overall deadline for one platform call, including a full streamed reply.
const RESPONSE_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a credential was rejected before any network call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusableReason {
    /// Nothing is stored for the key.
    NotFound,
    /// The credential is marked expired.
    Expired,
    /// The quota allowance is used up.
    QuotaExhausted,
}

impl fmt::Display for UnusableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotFound => "no stored credential",
            Self::Expired => "credential is marked expired",
            Self::QuotaExhausted => "quota allowance is used up",
        };
        f.write_str(text)
    }
}

/// Errors from the dispatch layer.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The stored credential cannot be used; no network call was made.
    /// Reauthorize (or raise the quota) to proceed.
    #[error("credential unusable: {reason}")]
    CredentialUnusable {
        /// Why the credential was rejected.
        reason: UnusableReason,
    },
    /// The platform rejected the credential mid-call. It is now marked
    /// expired; reauthorize to proceed.
    #[error("platform rejected the credential; it is now marked expired")]
    CredentialExpired,
    /// The stored blob failed authenticated decryption.
    #[error("stored credential is unreadable")]
    Undecryptable(#[source] CipherError),
    /// Adapter failure building the wire request or parsing the reply.
    #[error(transparent)]
    Platform(#[from] PlatformError),
    /// Transport-level failure talking to the platform.
    #[error("platform request failed: {0}")]
    Transport(String),
    /// The platform answered with an error status outside the
    /// authentication contract.
    #[error("platform answered {status}: {body}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body excerpt.
        body: String,
    },
    /// The dispatch HTTP client could not be built.
    #[error("failed to build dispatch HTTP client: {0}")]
    Client(String),
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Live chunk stream handed to a streaming caller.
pub type ChunkStream = ReceiverStream<Result<ChatChunk, DispatchError>>;

/// Result of one chat call, buffered or streamed per the caller's request.
#[derive(Debug)]
pub enum ChatOutcome {
    /// Buffered reply.
    Complete(ChatResponse),
    /// Chunk stream; quota settles when the stream ends.
    Stream(ChunkStream),
}

/// Running totals while a streamed reply is consumed.
#[derive(Debug, Default)]
struct StreamTotals {
    content: String,
    finish: Option<FinishReason>,
    usage: Option<TokenUsage>,
}

impl StreamTotals {
    fn absorb(&mut self, chunk: &ChatChunk) {
        self.content.push_str(&chunk.delta);
        if let Some(reason) = &chunk.finish_reason {
            self.finish = Some(reason.clone());
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Executes chat calls with stored credentials and keeps quota honest.
pub struct RequestDispatcher {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<CredentialCipher>,
    client: reqwest::Client,
    endpoint_override: Option<String>,
}

impl fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDispatcher").finish()
    }
}

impl RequestDispatcher {
    /// Build a dispatcher over the given store and cipher.
    ///
    /// Redirects are never followed: on these platforms a redirect on a chat
    /// endpoint is a logout signal, and it is classified here rather than
    /// silently chased.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Client`] if the HTTP client cannot be built.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<CredentialCipher>,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(RESPONSE_TIMEOUT_SECS))
            .build()
            .map_err(|e| DispatchError::Client(e.to_string()))?;
        Ok(Self {
            store,
            cipher,
            client,
            endpoint_override: None,
        })
    }

    /// Send every outbound call to `url` instead of the platform endpoint.
    #[doc(hidden)]
    pub fn override_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_override = Some(url.into());
        self
    }

    /// Execute one chat call for `(owner_id, platform)`.
    ///
    /// Returns [`ChatOutcome::Stream`] when `request.stream` is set,
    /// [`ChatOutcome::Complete`] otherwise — independent of whether the
    /// platform itself answers buffered or streamed; the dispatcher bridges
    /// the difference.
    ///
    /// # Errors
    ///
    /// [`DispatchError::CredentialUnusable`] before any network call when the
    /// credential is missing, expired, or out of quota;
    /// [`DispatchError::CredentialExpired`] when the platform rejects the
    /// cookies (the credential is flipped to expired first); transport,
    /// upstream, and adapter errors otherwise.
    pub async fn chat(
        &self,
        owner_id: &str,
        platform: PlatformId,
        request: ChatRequest,
    ) -> Result<ChatOutcome, DispatchError> {
        let credential = self.store.get(owner_id, platform).await?.ok_or(
            DispatchError::CredentialUnusable {
                reason: UnusableReason::NotFound,
            },
        )?;
        if credential.is_expired {
            debug!(owner_id, platform = %platform, "rejecting call on expired credential");
            return Err(DispatchError::CredentialUnusable {
                reason: UnusableReason::Expired,
            });
        }
        if credential.quota_exhausted() {
            debug!(
                owner_id,
                platform = %platform,
                quota_used = credential.quota_used,
                quota_limit = credential.quota_limit,
                "rejecting call on exhausted quota"
            );
            return Err(DispatchError::CredentialUnusable {
                reason: UnusableReason::QuotaExhausted,
            });
        }

        let payload = match self.cipher.decrypt(&credential.cipher_blob) {
            Ok(payload) => payload,
            Err(source) => {
                error!(
                    owner_id,
                    platform = %platform,
                    "stored credential failed authenticated decryption, marking expired"
                );
                self.store.mark_expired(owner_id, platform).await?;
                return Err(DispatchError::Undecryptable(source));
            }
        };

        let adapter = platforms::adapter(platform);
        let model = adapter.descriptor().resolve_model(&request);
        let wire = adapter.build_chat_request(&payload, &request)?;
        debug!(
            owner_id,
            platform = %platform,
            model,
            wire_stream = wire.stream,
            "dispatching chat call"
        );

        let started = Instant::now();
        let response = match self.execute(&wire).await {
            Ok(response) => response,
            Err(e) => {
                record_failure(
                    self.store.as_ref(),
                    owner_id,
                    platform,
                    &model,
                    elapsed_ms(started),
                    "error",
                    &e.to_string(),
                )
                .await;
                return Err(e);
            }
        };

        let status = response.status();
        if credential_rejected(status, &response) {
            warn!(
                owner_id,
                platform = %platform,
                status = %status,
                "platform rejected the credential, marking expired"
            );
            self.store.mark_expired(owner_id, platform).await?;
            record_failure(
                self.store.as_ref(),
                owner_id,
                platform,
                &model,
                elapsed_ms(started),
                "expired",
                &format!("platform answered {status}"),
            )
            .await;
            return Err(DispatchError::CredentialExpired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = sanitize_error_body(&body);
            record_failure(
                self.store.as_ref(),
                owner_id,
                platform,
                &model,
                elapsed_ms(started),
                "error",
                &detail,
            )
            .await;
            return Err(DispatchError::Upstream {
                status: status.as_u16(),
                body: detail,
            });
        }

        if wire.stream {
            if request.stream {
                Ok(ChatOutcome::Stream(self.spawn_stream(
                    owner_id.to_owned(),
                    platform,
                    model,
                    request,
                    adapter,
                    response,
                    started,
                )))
            } else {
                let reply = self
                    .buffer_stream(owner_id, platform, &model, &request, adapter, response, started)
                    .await?;
                Ok(ChatOutcome::Complete(reply))
            }
        } else {
            let reply = self
                .buffered_reply(owner_id, platform, &model, &request, adapter, response, started)
                .await?;
            if request.stream {
                Ok(ChatOutcome::Stream(synthesized_stream(reply)))
            } else {
                Ok(ChatOutcome::Complete(reply))
            }
        }
    }

    /// Issue the wire request.
    async fn execute(&self, wire: &WireRequest) -> Result<reqwest::Response, DispatchError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &wire.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                warn!(header = %name, "skipping header with invalid name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                warn!(header = %name, "skipping header with invalid value");
                continue;
            };
            headers.insert(name, value);
        }
        if wire.stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }

        let url = self.endpoint_override.as_deref().unwrap_or(&wire.url);
        self.client
            .request(wire.method.clone(), url)
            .headers(headers)
            .json(&wire.body)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))
    }

    /// Consume a buffered JSON reply.
    #[allow(clippy::too_many_arguments)]
    async fn buffered_reply(
        &self,
        owner_id: &str,
        platform: PlatformId,
        model: &str,
        request: &ChatRequest,
        adapter: &'static dyn PlatformAdapter,
        response: reqwest::Response,
        started: Instant,
    ) -> Result<ChatResponse, DispatchError> {
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let detail = e.to_string();
                record_failure(
                    self.store.as_ref(),
                    owner_id,
                    platform,
                    model,
                    elapsed_ms(started),
                    "error",
                    &detail,
                )
                .await;
                return Err(DispatchError::Transport(detail));
            }
        };

        let mut reply = match adapter.parse_chat_response(&body) {
            Ok(reply) => reply,
            Err(e) => {
                record_failure(
                    self.store.as_ref(),
                    owner_id,
                    platform,
                    model,
                    elapsed_ms(started),
                    "error",
                    &e.to_string(),
                )
                .await;
                return Err(e.into());
            }
        };

        let usage = reply
            .usage
            .unwrap_or_else(|| estimate_usage(request, &reply.content));
        reply.usage = Some(usage);
        settle_consumed(
            self.store.as_ref(),
            owner_id,
            platform,
            model,
            usage,
            elapsed_ms(started),
            "ok",
            None,
        )
        .await?;
        Ok(reply)
    }

    /// Consume a streamed reply into one buffered response.
    #[allow(clippy::too_many_arguments)]
    async fn buffer_stream(
        &self,
        owner_id: &str,
        platform: PlatformId,
        model: &str,
        request: &ChatRequest,
        adapter: &'static dyn PlatformAdapter,
        response: reqwest::Response,
        started: Instant,
    ) -> Result<ChatResponse, DispatchError> {
        let mut totals = StreamTotals::default();
        let mut state = StreamState::new();
        let mut reader = SseFrameReader::new();
        let mut bytes = response.bytes_stream();

        'read: loop {
            let Some(next) = bytes.next().await else {
                break;
            };
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(e) => {
                    let detail = e.to_string();
                    record_failure(
                        self.store.as_ref(),
                        owner_id,
                        platform,
                        model,
                        elapsed_ms(started),
                        "error",
                        &detail,
                    )
                    .await;
                    return Err(DispatchError::Transport(detail));
                }
            };
            for event in reader.feed(&chunk) {
                match event {
                    SseEvent::Done => break 'read,
                    SseEvent::Payload(payload) => {
                        match adapter.parse_stream_payload(&payload, &mut state) {
                            Ok(Some(chunk)) => totals.absorb(&chunk),
                            Ok(None) => {}
                            Err(e) => {
                                record_failure(
                                    self.store.as_ref(),
                                    owner_id,
                                    platform,
                                    model,
                                    elapsed_ms(started),
                                    "error",
                                    &e.to_string(),
                                )
                                .await;
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        for event in reader.finish() {
            if let SseEvent::Payload(payload) = event {
                if let Ok(Some(chunk)) = adapter.parse_stream_payload(&payload, &mut state) {
                    totals.absorb(&chunk);
                }
            }
        }

        let usage = totals
            .usage
            .unwrap_or_else(|| estimate_usage(request, &totals.content));
        settle_consumed(
            self.store.as_ref(),
            owner_id,
            platform,
            model,
            usage,
            elapsed_ms(started),
            "ok",
            None,
        )
        .await?;

        Ok(ChatResponse {
            content: totals.content,
            model: model.to_owned(),
            finish_reason: totals.finish.unwrap_or(FinishReason::Stop),
            usage: Some(usage),
        })
    }

    /// Forward a streamed reply chunk by chunk, settling quota when the
    /// stream ends.
    ///
    /// Tokens streamed before a mid-stream failure were still consumed, so
    /// they are charged; bookkeeping failures after delivery are logged
    /// rather than injected into an already-finished stream.
    #[allow(clippy::too_many_arguments)]
    fn spawn_stream(
        &self,
        owner_id: String,
        platform: PlatformId,
        model: String,
        request: ChatRequest,
        adapter: &'static dyn PlatformAdapter,
        response: reqwest::Response,
        started: Instant,
    ) -> ChunkStream {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let mut totals = StreamTotals::default();
            let mut state = StreamState::new();
            let mut reader = SseFrameReader::new();
            let mut bytes = response.bytes_stream();
            let mut failure: Option<String> = None;

            'read: loop {
                let Some(next) = bytes.next().await else {
                    break;
                };
                let chunk = match next {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let detail = e.to_string();
                        let _ = tx.send(Err(DispatchError::Transport(detail.clone()))).await;
                        failure = Some(detail);
                        break;
                    }
                };
                for event in reader.feed(&chunk) {
                    match event {
                        SseEvent::Done => break 'read,
                        SseEvent::Payload(payload) => {
                            match adapter.parse_stream_payload(&payload, &mut state) {
                                Ok(Some(chunk)) => {
                                    totals.absorb(&chunk);
                                    if tx.send(Ok(chunk)).await.is_err() {
                                        debug!("chunk receiver dropped, abandoning stream");
                                        break 'read;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    let detail = e.to_string();
                                    let _ = tx.send(Err(e.into())).await;
                                    failure = Some(detail);
                                    break 'read;
                                }
                            }
                        }
                    }
                }
            }
            if failure.is_none() {
                for event in reader.finish() {
                    if let SseEvent::Payload(payload) = event {
                        if let Ok(Some(chunk)) = adapter.parse_stream_payload(&payload, &mut state)
                        {
                            totals.absorb(&chunk);
                            let _ = tx.send(Ok(chunk)).await;
                        }
                    }
                }
            }

            let usage = totals
                .usage
                .unwrap_or_else(|| estimate_usage(&request, &totals.content));
            let outcome = if failure.is_some() { "error" } else { "ok" };
            if let Err(e) = settle_consumed(
                store.as_ref(),
                &owner_id,
                platform,
                &model,
                usage,
                elapsed_ms(started),
                outcome,
                failure.as_deref(),
            )
            .await
            {
                error!(
                    owner_id,
                    platform = %platform,
                    error = %e,
                    "failed to settle streamed call"
                );
            }
        });

        ReceiverStream::new(rx)
    }
}

// ---------------------------------------------------------------------------
// Accounting
// ---------------------------------------------------------------------------

/// Charge consumed tokens, flip expiry when the allowance is crossed, and
/// append the usage record.
#[allow(clippy::too_many_arguments)]
async fn settle_consumed(
    store: &dyn CredentialStore,
    owner_id: &str,
    platform: PlatformId,
    model: &str,
    usage: TokenUsage,
    latency_ms: u64,
    outcome: &str,
    error_detail: Option<&str>,
) -> Result<(), StoreError> {
    let snapshot = store.add_usage(owner_id, platform, usage.total()).await?;
    if snapshot.exhausted() {
        info!(
            owner_id,
            platform = %platform,
            quota_used = snapshot.quota_used,
            quota_limit = snapshot.quota_limit,
            "quota allowance crossed, marking credential expired"
        );
        store.mark_expired(owner_id, platform).await?;
    }
    store
        .append_usage(NewUsage {
            owner_id,
            platform,
            model,
            usage,
            latency_ms,
            outcome,
            error: error_detail,
        })
        .await?;
    Ok(())
}

/// Append a usage record for a call that consumed nothing.
///
/// A failure to write the record must not mask the call's own error, so it
/// is logged and swallowed.
async fn record_failure(
    store: &dyn CredentialStore,
    owner_id: &str,
    platform: PlatformId,
    model: &str,
    latency_ms: u64,
    outcome: &str,
    detail: &str,
) {
    let result = store
        .append_usage(NewUsage {
            owner_id,
            platform,
            model,
            usage: TokenUsage::default(),
            latency_ms,
            outcome,
            error: Some(detail),
        })
        .await;
    if let Err(e) = result {
        warn!(owner_id, platform = %platform, error = %e, "failed to append usage record");
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Whether the platform's answer means the cookies were rejected.
///
/// 401/403 is the explicit contract; a redirect whose target is a login
/// wall is the same statement made politely.
fn credential_rejected(status: StatusCode, response: &reqwest::Response) -> bool {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return true;
    }
    if status.is_redirection() {
        return response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(looks_like_login_wall);
    }
    false
}

/// Estimate token usage for platforms that report none.
fn estimate_usage(request: &ChatRequest, completion: &str) -> TokenUsage {
    let completion_chars = u64::try_from(completion.chars().count()).unwrap_or(u64::MAX);
    TokenUsage {
        prompt_tokens: request.content_chars().saturating_div(CHARS_PER_TOKEN).max(1),
        completion_tokens: completion_chars.saturating_div(CHARS_PER_TOKEN).max(1),
    }
}

/// Elapsed wall-clock milliseconds since `started`.
fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Collapse, redact, and truncate an upstream error body before it reaches
/// logs or callers.
fn sanitize_error_body(raw: &str) -> String {
    const MAX_ERROR_BODY_CHARS: usize = 256;

    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    // Long token-shaped runs could be echoed cookies or session ids.
    let mut sanitized = collapsed;
    if let Ok(regex) = Regex::new(r"[A-Za-z0-9+/=_\-]{40,}") {
        sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
    }

    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    sanitized
}

/// Wrap an already-buffered reply as a single-chunk stream.
fn synthesized_stream(reply: ChatResponse) -> ChunkStream {
    let (tx, rx) = mpsc::channel(1);
    let chunk = ChatChunk {
        delta: reply.content,
        finish_reason: Some(reply.finish_reason),
        usage: reply.usage,
    };
    let _ = tx.try_send(Ok(chunk));
    ReceiverStream::new(rx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
