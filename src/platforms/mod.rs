//! Platform adapter registry.
//!
//! One adapter per supported web chat platform. An adapter owns everything
//! platform-specific: where the login page lives, how a completed login is
//! recognized, which cookies constitute a usable credential, and how the
//! canonical chat schema maps onto the platform's private wire protocol.
//!
//! Dispatch is an exhaustive `match` on [`PlatformId`], so registering a new
//! platform without wiring it into [`adapter`] refuses to compile. Unknown
//! platform names exist only at the string boundary ([`PlatformId::from_str`])
//! and fail there with [`PlatformError::UnknownPlatform`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse};

pub mod baidu;
pub mod chatqwen;
pub mod claude;
pub mod doubao;
pub mod gemini;
pub mod openai;
pub mod qianwen;
pub mod qwen;
pub mod spark;
pub mod zhipu;

/// User agent presented when a harvested credential carries none of its own.
///
/// Matches the browser profile the automation engine logs in with, so wire
/// calls look like the same client that obtained the cookies.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

// ---------------------------------------------------------------------------
// Platform identity
// ---------------------------------------------------------------------------

/// Identifier of a supported platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformId {
    /// Doubao web chat (doubao.com).
    Doubao,
    /// Tongyi Qianwen classic web (tongyi.aliyun.com).
    Qwen,
    /// Qwen chat, current generation (chat.qwen.ai).
    ChatQwen,
    /// qianwen.com web chat.
    Qianwen,
    /// ChatGPT web (chatgpt.com).
    OpenAi,
    /// Claude web (claude.ai).
    Claude,
    /// Gemini web (gemini.google.com).
    Gemini,
    /// ChatGLM web (chatglm.cn).
    Zhipu,
    /// ERNIE Bot web (yiyan.baidu.com).
    Baidu,
    /// iFlytek Spark web (xinghuo.xfyun.cn).
    Spark,
}

impl PlatformId {
    /// Every registered platform, in registry order.
    pub const ALL: [PlatformId; 10] = [
        PlatformId::Doubao,
        PlatformId::Qwen,
        PlatformId::ChatQwen,
        PlatformId::Qianwen,
        PlatformId::OpenAi,
        PlatformId::Claude,
        PlatformId::Gemini,
        PlatformId::Zhipu,
        PlatformId::Baidu,
        PlatformId::Spark,
    ];

    /// Stable lowercase name, matching the serde representation and the
    /// persistence layer's key column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Doubao => "doubao",
            Self::Qwen => "qwen",
            Self::ChatQwen => "chatqwen",
            Self::Qianwen => "qianwen",
            Self::OpenAi => "openai",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Zhipu => "zhipu",
            Self::Baidu => "baidu",
            Self::Spark => "spark",
        }
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PlatformId {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| PlatformError::UnknownPlatform(s.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors originating in the adapter layer.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The platform name does not match any registered adapter.
    #[error("unknown platform {0:?}")]
    UnknownPlatform(String),
    /// The harvested cookies do not form a usable credential.
    #[error("credential for {platform} is missing required cookies: {}", missing.join(", "))]
    ShapeInvalid {
        /// Platform whose shape check failed.
        platform: PlatformId,
        /// Required cookie names that were absent or empty.
        missing: Vec<String>,
    },
    /// A platform reply did not match the shape the adapter expects.
    #[error("{platform} response did not match the expected shape: {detail}")]
    Parse {
        /// Platform whose reply failed to parse.
        platform: PlatformId,
        /// What was wrong, without reproducing the body.
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Login detection
// ---------------------------------------------------------------------------

/// How a completed login is recognized, chosen per platform.
///
/// The engine interprets the strategy generically; hardening one platform's
/// detection never touches shared code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginDetect {
    /// The page URL changes on login and matches this glob.
    ///
    /// `**` crosses `/` boundaries, `*` does not.
    UrlPattern(&'static str),
    /// The URL never changes; poll in-page state instead.
    Settle {
        /// localStorage keys that appear once a user is signed in.
        storage_keys: &'static [&'static str],
        /// DOM selectors that appear once a user is signed in.
        markers: &'static [&'static str],
    },
}

impl LoginDetect {
    /// Whether `url` satisfies a [`LoginDetect::UrlPattern`] rule.
    ///
    /// Always `false` for [`LoginDetect::Settle`]; callers should consult
    /// [`probe_script`](Self::probe_script) for those.
    pub fn url_matches(&self, url: &str) -> bool {
        match self {
            Self::UrlPattern(pattern) => Regex::new(&glob_to_regex(pattern))
                .map(|re| re.is_match(url))
                .unwrap_or(false),
            Self::Settle { .. } => false,
        }
    }

    /// JavaScript probe returning `true` once the user is signed in.
    ///
    /// `None` for URL-pattern platforms.
    pub fn probe_script(&self) -> Option<String> {
        match self {
            Self::UrlPattern(_) => None,
            Self::Settle {
                storage_keys,
                markers,
            } => {
                let keys = serde_json::to_string(storage_keys).unwrap_or_else(|_| "[]".to_owned());
                let selectors = serde_json::to_string(markers).unwrap_or_else(|_| "[]".to_owned());
                Some(format!(
                    "(() => {{\
                       const keys = {keys};\
                       for (const k of keys) {{\
                         if (window.localStorage.getItem(k)) return true;\
                       }}\
                       const selectors = {selectors};\
                       for (const s of selectors) {{\
                         try {{ if (document.querySelector(s)) return true; }} catch (e) {{}}\
                       }}\
                       return false;\
                     }})()"
                ))
            }
        }
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '.' | '^' | '$' | '|' | '?' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '\\' => {
                regex.push('\\');
                regex.push(c);
            }
            other => regex.push(other),
        }
    }
    regex.push('$');
    regex
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Immutable description of one platform, loaded at compile time.
#[derive(Debug, Clone, Copy)]
pub struct PlatformDescriptor {
    /// Registry identifier.
    pub id: PlatformId,
    /// Human-readable platform name.
    pub display_name: &'static str,
    /// Interactive login page the engine navigates to.
    pub login_url: &'static str,
    /// How a completed login is recognized.
    pub login_detect: LoginDetect,
    /// Cookies that must be present for a credential to be usable.
    pub required_cookies: &'static [&'static str],
    /// Cookies worth harvesting but not load-bearing.
    pub optional_cookies: &'static [&'static str],
    /// Domain the session cookies are scoped to.
    pub cookie_domain: &'static str,
    /// Lightweight endpoint for liveness checks.
    pub validation_url: &'static str,
    /// Selector of the login QR element, when the platform shows one.
    pub qr_selector: Option<&'static str>,
    /// Chat completion endpoint.
    pub chat_url: &'static str,
    /// `Origin` header value for wire calls.
    pub origin: &'static str,
    /// `Referer` header value for wire calls.
    pub referer: &'static str,
    /// Models selectable through this platform.
    pub models: &'static [&'static str],
    /// Model used when the request names none.
    pub default_model: &'static str,
    /// Token allowance granted to a freshly issued credential.
    pub default_quota: u64,
}

impl PlatformDescriptor {
    /// Resolve the effective model for a request.
    pub fn resolve_model(&self, request: &ChatRequest) -> String {
        match request.model.as_deref() {
            Some(model) if !model.is_empty() => model.to_owned(),
            _ => self.default_model.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire request
// ---------------------------------------------------------------------------

/// A fully built outbound request for one platform call.
///
/// `Debug` redacts credential-bearing headers; the cookie map itself never
/// appears here in plaintext form other than inside the `Cookie` header.
#[derive(Clone)]
pub struct WireRequest {
    /// HTTP method.
    pub method: reqwest::Method,
    /// Absolute endpoint URL.
    pub url: String,
    /// Request headers, including the credential `Cookie` header.
    pub headers: Vec<(String, String)>,
    /// JSON request body.
    pub body: serde_json::Value,
    /// Whether the platform will answer with an SSE stream.
    pub stream: bool,
}

fn header_is_sensitive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "cookie" || lower == "authorization" || lower.contains("token") || lower.contains("key")
}

impl fmt::Debug for WireRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                if header_is_sensitive(name) {
                    (name.as_str(), "[REDACTED]")
                } else {
                    (name.as_str(), value.as_str())
                }
            })
            .collect();
        f.debug_struct("WireRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &headers)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

/// Standard header set for a platform wire call.
///
/// `Cookie` from the payload, the payload's own user agent (falling back to
/// [`DEFAULT_USER_AGENT`]), plus the descriptor's `Referer`/`Origin` and JSON
/// content negotiation.
pub fn wire_headers(
    descriptor: &PlatformDescriptor,
    payload: &CredentialPayload,
) -> Vec<(String, String)> {
    let user_agent = payload
        .user_agent
        .clone()
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_owned());
    vec![
        ("Cookie".to_owned(), payload.cookie_header()),
        ("User-Agent".to_owned(), user_agent),
        ("Referer".to_owned(), descriptor.referer.to_owned()),
        ("Origin".to_owned(), descriptor.origin.to_owned()),
        ("Accept".to_owned(), "application/json, text/plain, */*".to_owned()),
        ("Content-Type".to_owned(), "application/json".to_owned()),
    ]
}

// ---------------------------------------------------------------------------
// Streaming state
// ---------------------------------------------------------------------------

/// Per-call accumulator for platforms whose stream frames carry the full
/// reply-so-far instead of a delta.
///
/// The dispatcher creates one per streamed call and threads it through
/// [`PlatformAdapter::parse_stream_payload`]; adapters for true-delta
/// platforms ignore it.
#[derive(Debug, Default)]
pub struct StreamState {
    chars_emitted: usize,
}

impl StreamState {
    /// Fresh state for one streamed call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Given the full reply-so-far, return only the not-yet-emitted suffix.
    ///
    /// Counts characters rather than bytes; snapshot frames from CJK
    /// platforms would otherwise split multi-byte sequences.
    pub fn delta_from_snapshot(&mut self, full_text: &str) -> String {
        let delta: String = full_text.chars().skip(self.chars_emitted).collect();
        self.chars_emitted = self.chars_emitted.saturating_add(delta.chars().count());
        delta
    }
}

// ---------------------------------------------------------------------------
// Adapter trait + registry
// ---------------------------------------------------------------------------

/// Per-platform capability interface.
///
/// Build and parse functions are pure: the dispatcher owns HTTP execution and
/// the outer SSE framing, adapters own only their platform's shapes. They
/// must not mutate the credential payload and must not copy secret values
/// into anything but the wire headers.
pub trait PlatformAdapter: Send + Sync {
    /// The platform's static descriptor.
    fn descriptor(&self) -> &'static PlatformDescriptor;

    /// Build the wire request for one canonical chat request.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] when the request cannot be expressed for
    /// this platform.
    fn build_chat_request(
        &self,
        payload: &CredentialPayload,
        request: &ChatRequest,
    ) -> Result<WireRequest, PlatformError>;

    /// Parse a buffered (non-streaming) reply body.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Parse`] when the body does not match the
    /// platform's reply shape.
    fn parse_chat_response(&self, body: &str) -> Result<ChatResponse, PlatformError>;

    /// Parse one SSE inner payload (the text after `data: `, never the
    /// framing itself and never the `[DONE]` sentinel).
    ///
    /// `Ok(None)` skips bookkeeping frames. `state` supports platforms whose
    /// frames are snapshots rather than deltas.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Parse`] only for frames that are structurally
    /// claimed by the platform shape yet unusable; unrecognized frames should
    /// be skipped instead.
    fn parse_stream_payload(
        &self,
        payload: &str,
        state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError>;
}

/// Resolve the adapter for a platform.
///
/// Exhaustive over [`PlatformId`]; a platform cannot be declared without
/// being resolvable here.
pub fn adapter(id: PlatformId) -> &'static dyn PlatformAdapter {
    match id {
        PlatformId::Doubao => &doubao::Doubao,
        PlatformId::Qwen => &qwen::Qwen,
        PlatformId::ChatQwen => &chatqwen::ChatQwen,
        PlatformId::Qianwen => &qianwen::Qianwen,
        PlatformId::OpenAi => &openai::OpenAi,
        PlatformId::Claude => &claude::Claude,
        PlatformId::Gemini => &gemini::Gemini,
        PlatformId::Zhipu => &zhipu::Zhipu,
        PlatformId::Baidu => &baidu::Baidu,
        PlatformId::Spark => &spark::Spark,
    }
}

/// The platform's static descriptor.
pub fn descriptor(id: PlatformId) -> &'static PlatformDescriptor {
    adapter(id).descriptor()
}

/// Descriptors for every registered platform, in registry order.
pub fn all_descriptors() -> impl Iterator<Item = &'static PlatformDescriptor> {
    PlatformId::ALL.into_iter().map(descriptor)
}

/// Check that harvested cookies form a usable credential for the platform.
///
/// Every required cookie must be present with a non-empty value. Missing
/// optional cookies are logged and tolerated.
///
/// # Errors
///
/// Returns [`PlatformError::ShapeInvalid`] naming the missing cookies.
pub fn validate_credential_shape(
    id: PlatformId,
    cookies: &BTreeMap<String, String>,
) -> Result<(), PlatformError> {
    let descriptor = descriptor(id);
    let missing: Vec<String> = descriptor
        .required_cookies
        .iter()
        .filter(|name| cookies.get(**name).is_none_or(|value| value.is_empty()))
        .map(|name| (*name).to_owned())
        .collect();
    if !missing.is_empty() {
        return Err(PlatformError::ShapeInvalid {
            platform: id,
            missing,
        });
    }
    for name in descriptor.optional_cookies {
        if !cookies.contains_key(*name) {
            warn!(platform = %id, cookie = name, "optional cookie absent from harvest");
        }
    }
    Ok(())
}
