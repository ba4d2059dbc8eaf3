//! Doubao adapter (doubao.com).

use serde::Deserialize;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason};

use super::{
    wire_headers, LoginDetect, PlatformAdapter, PlatformDescriptor, PlatformError, PlatformId,
    StreamState, WireRequest,
};

/// Default web bot behind the chat endpoint.
const BOT_ID: &str = "7358044466096914465";

/// Doubao keeps the user on the landing page through login, so completion is
/// detected by in-page state rather than a URL change.
const STORAGE_KEYS: &[&str] = &[
    "user_info", "token", "auth", "session", "user", "userId", "userInfo",
];
const LOGIN_MARKERS: &[&str] = &[
    "[class*='avatar']",
    "[class*='user-info']",
    "[class*='username']",
];

static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::Doubao,
    display_name: "Doubao",
    login_url: "https://www.doubao.com/",
    login_detect: LoginDetect::Settle {
        storage_keys: STORAGE_KEYS,
        markers: LOGIN_MARKERS,
    },
    required_cookies: &["sessionid", "sessionid_ss", "s_v_web_id"],
    optional_cookies: &["tt_webid"],
    cookie_domain: ".doubao.com",
    validation_url: "https://www.doubao.com/",
    qr_selector: Some("img[src*='qrcode'], canvas.qrcode, .qrcode img"),
    chat_url: "https://www.doubao.com/api/chat/stream",
    origin: "https://www.doubao.com",
    referer: "https://www.doubao.com/",
    models: &[
        "doubao-lite-4k",
        "doubao-lite-32k",
        "doubao-pro-4k",
        "doubao-pro-32k",
    ],
    default_model: "doubao-lite-4k",
    default_quota: 1_000_000,
};

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// One frame of the Doubao event stream. Frames carry incremental text.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct DoubaoFrame {
    /// Newly generated text since the previous frame.
    #[serde(default)]
    pub text: Option<String>,
    /// Set on the final frame of a reply.
    #[serde(default)]
    pub is_finish: Option<bool>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Doubao web chat.
#[derive(Debug, Clone, Copy)]
pub struct Doubao;

impl PlatformAdapter for Doubao {
    fn descriptor(&self) -> &'static PlatformDescriptor {
        &DESCRIPTOR
    }

    fn build_chat_request(
        &self,
        payload: &CredentialPayload,
        request: &ChatRequest,
    ) -> Result<WireRequest, PlatformError> {
        Ok(WireRequest {
            method: reqwest::Method::POST,
            url: DESCRIPTOR.chat_url.to_owned(),
            headers: wire_headers(&DESCRIPTOR, payload),
            body: serde_json::json!({
                "conversation_id": "",
                "bot_id": BOT_ID,
                "user_input": request.flattened_prompt(),
                "stream": true,
            }),
            stream: true,
        })
    }

    fn parse_chat_response(&self, _body: &str) -> Result<ChatResponse, PlatformError> {
        Err(PlatformError::Parse {
            platform: PlatformId::Doubao,
            detail: "replies are always delivered as an event stream".to_owned(),
        })
    }

    fn parse_stream_payload(
        &self,
        payload: &str,
        _state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError> {
        let Ok(frame) = serde_json::from_str::<DoubaoFrame>(payload) else {
            return Ok(None);
        };
        let delta = frame.text.unwrap_or_default();
        let finished = frame.is_finish.unwrap_or(false);
        if delta.is_empty() && !finished {
            return Ok(None);
        }
        Ok(Some(ChatChunk {
            delta,
            finish_reason: finished.then_some(FinishReason::Stop),
            usage: None,
        }))
    }
}
