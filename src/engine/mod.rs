//! Browser automation engine.
//!
//! Drives interactive logins through a Playwright sidecar (see [`sidecar`])
//! reached over HTTP (see [`bridge`]). The engine itself is generic over
//! [`BrowserDriver`], so session-state tests run against an in-process stub
//! with no browser anywhere near them.
//!
//! Browser contexts are expensive: a [`tokio::sync::Semaphore`] caps how many
//! are live at once, and every context is wrapped in a [`ContextLease`] whose
//! `Drop` closes it even when a login flow ends by error, timeout, or
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::credential::CredentialPayload;
use crate::platforms::{LoginDetect, PlatformDescriptor, DEFAULT_USER_AGENT};

pub mod bridge;
pub mod sidecar;

/// Selectors tried, in order, to surface the login dialog on landing pages
/// that need a click before showing it. Clicking is best-effort: platforms
/// that open the dialog on their own match none of these and that is fine.
const LOGIN_AFFORDANCE_SELECTORS: &[&str] = &[
    "button:has-text('登录')",
    "a:has-text('登录')",
    ".login-btn",
    "[class*='login']",
];

/// Cookie reads right after login can race the platform's own bookkeeping
/// requests, so the harvest retries a few times before giving up.
const COOKIE_READ_ATTEMPTS: u32 = 3;
const COOKIE_READ_DELAY: Duration = Duration::from_millis(500);

/// localStorage keys worth harvesting alongside cookies.
const STORAGE_TOKEN_TAGS: &[&str] = &["token", "auth", "session", "user"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by browser automation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The browser driver call failed.
    #[error("browser driver call failed: {0}")]
    Driver(String),
    /// The step did not finish within its share of the session deadline.
    #[error("automation step timed out after {seconds}s")]
    AutomationTimeout {
        /// Time budget that was exceeded, in seconds.
        seconds: u64,
    },
    /// The harvest found no cookies scoped to the platform domain.
    #[error("credential harvest found no cookies for {domain}")]
    EmptyHarvest {
        /// Platform cookie domain that came up empty.
        domain: String,
    },
}

// ---------------------------------------------------------------------------
// Driver seam
// ---------------------------------------------------------------------------

/// Fixed browser fingerprint used for every login context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextProfile {
    /// Viewport width in pixels.
    pub width: u32,
    /// Viewport height in pixels.
    pub height: u32,
    /// Navigator user agent.
    pub user_agent: String,
    /// BCP 47 locale.
    pub locale: String,
    /// IANA timezone.
    pub timezone: String,
}

impl Default for ContextProfile {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            locale: "zh-CN".to_owned(),
            timezone: "Asia/Shanghai".to_owned(),
        }
    }
}

/// A cookie as reported by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverCookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Domain the cookie is scoped to.
    #[serde(default)]
    pub domain: String,
}

/// Low-level browser operations, one isolated context per login flow.
///
/// The production implementation is [`bridge::BridgeClient`]; tests plug in
/// stubs.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open an isolated context (own cookie jar and storage) with a page.
    async fn create_context(&self, context_id: &str, profile: &ContextProfile)
        -> Result<(), EngineError>;
    /// Navigate the context's page and return the settled URL.
    async fn goto(&self, context_id: &str, url: &str) -> Result<String, EngineError>;
    /// Click the first element matching `selector`.
    async fn click(&self, context_id: &str, selector: &str) -> Result<(), EngineError>;
    /// Screenshot the element matching `selector`, or the whole page when
    /// `None`. Returns PNG bytes, base64-encoded.
    async fn screenshot(&self, context_id: &str, selector: Option<&str>)
        -> Result<String, EngineError>;
    /// Evaluate JavaScript in the page and return its JSON value.
    async fn evaluate(&self, context_id: &str, javascript: &str)
        -> Result<serde_json::Value, EngineError>;
    /// The page's current URL.
    async fn current_url(&self, context_id: &str) -> Result<String, EngineError>;
    /// All cookies visible to the context.
    async fn cookies(&self, context_id: &str) -> Result<Vec<DriverCookie>, EngineError>;
    /// Close the context and release its browser resources.
    async fn close_context(&self, context_id: &str) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// Context lease
// ---------------------------------------------------------------------------

/// A live browser context plus the concurrency permit it occupies.
///
/// Dropping the lease closes the context in the background and releases the
/// permit only after the close finishes, so the context cap holds at the
/// browser too. Prefer [`ContextLease::close`] when an error can be observed.
pub struct ContextLease {
    context_id: String,
    driver: Arc<dyn BrowserDriver>,
    permit: Option<OwnedSemaphorePermit>,
    closed: bool,
}

impl ContextLease {
    /// Driver-side identifier of this context.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Close the context now.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Driver`] when the driver fails to close; the
    /// permit is released regardless.
    pub async fn close(mut self) -> Result<(), EngineError> {
        self.closed = true;
        self.driver.close_context(&self.context_id).await
    }
}

impl std::fmt::Debug for ContextLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLease")
            .field("context_id", &self.context_id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let driver = Arc::clone(&self.driver);
        let context_id = std::mem::take(&mut self.context_id);
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = driver.close_context(&context_id).await {
                        warn!(context = %context_id, error = %error, "background context close failed");
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(context = %context_id, "context dropped outside a runtime; close skipped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// QR snapshot
// ---------------------------------------------------------------------------

/// A screenshot of the login page or its QR element, for relay to the user.
#[derive(Debug, Clone, Serialize)]
pub struct QrSnapshot {
    /// PNG image, base64-encoded.
    pub png_base64: String,
    /// When the screenshot was taken.
    pub captured_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Semaphore-bounded browser automation over a [`BrowserDriver`].
///
/// Every operation takes a `remaining` budget — the caller's share of the
/// session deadline — and fails with [`EngineError::AutomationTimeout`] when
/// it runs out, including time spent waiting for a context permit.
pub struct AutomationEngine {
    driver: Arc<dyn BrowserDriver>,
    permits: Arc<Semaphore>,
    profile: ContextProfile,
}

impl AutomationEngine {
    /// Create an engine capped at `max_contexts` live browser contexts.
    pub fn new(driver: Arc<dyn BrowserDriver>, max_contexts: usize) -> Self {
        Self {
            driver,
            permits: Arc::new(Semaphore::new(max_contexts)),
            profile: ContextProfile::default(),
        }
    }

    /// Number of context permits currently free.
    pub fn available_contexts(&self) -> usize {
        self.permits.available_permits()
    }

    /// Acquire a permit and open a fresh browser context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AutomationTimeout`] when no permit frees up in
    /// time, or [`EngineError::Driver`] when context creation fails.
    pub async fn open_context(&self, remaining: Duration) -> Result<ContextLease, EngineError> {
        let seconds = remaining.as_secs();
        let permit = tokio::time::timeout(remaining, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| EngineError::AutomationTimeout { seconds })?
            .map_err(|_| EngineError::Driver("context semaphore closed".to_owned()))?;

        let context_id = Uuid::new_v4().to_string();
        if let Err(error) = self
            .driver
            .create_context(&context_id, &self.profile)
            .await
        {
            drop(permit);
            return Err(error);
        }
        Ok(ContextLease {
            context_id,
            driver: Arc::clone(&self.driver),
            permit: Some(permit),
            closed: false,
        })
    }

    /// Navigate the context to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on driver failure or timeout.
    pub async fn navigate(
        &self,
        lease: &ContextLease,
        url: &str,
        remaining: Duration,
    ) -> Result<(), EngineError> {
        with_deadline(remaining, async {
            self.driver.goto(&lease.context_id, url).await.map(|_| ())
        })
        .await
    }

    /// Try to surface the login dialog.
    ///
    /// Best-effort: selectors that match nothing are skipped, and a page that
    /// opens its dialog unprompted is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AutomationTimeout`] only; click failures are
    /// logged and swallowed.
    pub async fn click_login_affordance(
        &self,
        lease: &ContextLease,
        remaining: Duration,
    ) -> Result<(), EngineError> {
        with_deadline(remaining, async {
            for selector in LOGIN_AFFORDANCE_SELECTORS {
                match self.driver.click(&lease.context_id, selector).await {
                    Ok(()) => {
                        debug!(context = lease.context_id(), selector, "login affordance clicked");
                        return Ok(());
                    }
                    Err(error) => {
                        debug!(context = lease.context_id(), selector, %error, "login affordance miss");
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Screenshot the QR element when the platform names one, falling back
    /// to the full page so the user always has something to scan.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when even the full-page screenshot fails.
    pub async fn capture_qr(
        &self,
        lease: &ContextLease,
        qr_selector: Option<&str>,
        remaining: Duration,
    ) -> Result<QrSnapshot, EngineError> {
        with_deadline(remaining, async {
            let png_base64 = match qr_selector {
                Some(selector) => {
                    match self.driver.screenshot(&lease.context_id, Some(selector)).await {
                        Ok(image) => image,
                        Err(error) => {
                            debug!(context = lease.context_id(), selector, %error, "QR element screenshot failed, using full page");
                            self.driver.screenshot(&lease.context_id, None).await?
                        }
                    }
                }
                None => self.driver.screenshot(&lease.context_id, None).await?,
            };
            Ok(QrSnapshot {
                png_base64,
                captured_at: Utc::now(),
            })
        })
        .await
    }

    /// One login poll using the platform's detection strategy.
    ///
    /// Returns `true` once the user has completed the login in the context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on driver failure or timeout.
    pub async fn poll_login_state(
        &self,
        lease: &ContextLease,
        detect: &LoginDetect,
        remaining: Duration,
    ) -> Result<bool, EngineError> {
        with_deadline(remaining, async {
            match detect.probe_script() {
                Some(script) => {
                    let value = self.driver.evaluate(&lease.context_id, &script).await?;
                    Ok(value.as_bool().unwrap_or(false))
                }
                None => {
                    let url = self.driver.current_url(&lease.context_id).await?;
                    Ok(detect.url_matches(&url))
                }
            }
        })
        .await
    }

    /// Harvest the credential from a logged-in context: cookies scoped to
    /// the platform domain, auth-looking localStorage entries, and the
    /// context's user agent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::EmptyHarvest`] when no in-scope cookie shows
    /// up within the retry budget, or [`EngineError`] on driver failure or
    /// timeout.
    pub async fn extract_credential(
        &self,
        lease: &ContextLease,
        descriptor: &PlatformDescriptor,
        remaining: Duration,
    ) -> Result<CredentialPayload, EngineError> {
        with_deadline(remaining, async {
            let mut scoped: Vec<DriverCookie> = Vec::new();
            for attempt in 1..=COOKIE_READ_ATTEMPTS {
                let cookies = self.driver.cookies(&lease.context_id).await?;
                scoped = cookies
                    .into_iter()
                    .filter(|cookie| cookie_domain_matches(&cookie.domain, descriptor.cookie_domain))
                    .collect();
                if !scoped.is_empty() {
                    break;
                }
                debug!(
                    context = lease.context_id(),
                    attempt,
                    domain = descriptor.cookie_domain,
                    "no in-scope cookies yet"
                );
                if attempt < COOKIE_READ_ATTEMPTS {
                    tokio::time::sleep(COOKIE_READ_DELAY).await;
                }
            }
            if scoped.is_empty() {
                return Err(EngineError::EmptyHarvest {
                    domain: descriptor.cookie_domain.to_owned(),
                });
            }

            let mut payload = CredentialPayload::from_cookies(
                scoped.into_iter().map(|cookie| (cookie.name, cookie.value)),
            );

            match self
                .driver
                .evaluate(&lease.context_id, &storage_harvest_script())
                .await
            {
                Ok(serde_json::Value::Object(entries)) => {
                    for (key, value) in entries {
                        if let serde_json::Value::String(value) = value {
                            payload.storage_tokens.insert(key, value);
                        }
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(context = lease.context_id(), %error, "storage harvest failed");
                }
            }

            match self
                .driver
                .evaluate(&lease.context_id, "navigator.userAgent")
                .await
            {
                Ok(serde_json::Value::String(user_agent)) if !user_agent.is_empty() => {
                    payload.user_agent = Some(user_agent);
                }
                _ => {}
            }

            Ok(payload)
        })
        .await
    }
}

impl std::fmt::Debug for AutomationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationEngine")
            .field("available_contexts", &self.available_contexts())
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

async fn with_deadline<T>(
    remaining: Duration,
    fut: impl std::future::Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    let seconds = remaining.as_secs();
    match tokio::time::timeout(remaining, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::AutomationTimeout { seconds }),
    }
}

/// JavaScript harvesting auth-looking localStorage entries.
fn storage_harvest_script() -> String {
    let tags = serde_json::to_string(STORAGE_TOKEN_TAGS).unwrap_or_else(|_| "[]".to_owned());
    format!(
        "(() => {{\
           const tags = {tags};\
           const out = {{}};\
           for (let i = 0; i < window.localStorage.length; i++) {{\
             const key = window.localStorage.key(i);\
             if (!key) continue;\
             const lower = key.toLowerCase();\
             if (tags.some(tag => lower.includes(tag))) {{\
               const value = window.localStorage.getItem(key);\
               if (value) out[key] = value;\
             }}\
           }}\
           return out;\
         }})()"
    )
}

fn cookie_domain_matches(cookie_domain: &str, platform_domain: &str) -> bool {
    let cookie = cookie_domain.trim_start_matches('.');
    let platform = platform_domain.trim_start_matches('.');
    if cookie == platform {
        return true;
    }
    cookie
        .strip_suffix(platform)
        .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Decode a base64 PNG screenshot into raw bytes.
///
/// # Errors
///
/// Returns [`EngineError::Driver`] when the driver handed back something
/// that is not base64.
pub fn decode_png(png_base64: &str) -> Result<Vec<u8>, EngineError> {
    BASE64
        .decode(png_base64.trim())
        .map_err(|e| EngineError::Driver(format!("screenshot was not valid base64: {e}")))
}
