//! qianwen.com web chat adapter.

use serde::Deserialize;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason};

use super::{
    wire_headers, LoginDetect, PlatformAdapter, PlatformDescriptor, PlatformError, PlatformId,
    StreamState, WireRequest,
};

static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::Qianwen,
    display_name: "Qianwen",
    login_url: "https://www.qianwen.com/",
    login_detect: LoginDetect::UrlPattern("**/qianwen.com/**"),
    required_cookies: &["tongyi_sso_ticket"],
    optional_cookies: &[
        "cna",
        "isg",
        "tfstk",
        "login_aliyunid",
        "login_aliyunid_csrf",
        "login_aliyunid_pk",
        "login_aliyunid_ticket",
        "aliyun_choice",
        "aliyun_lang",
    ],
    cookie_domain: ".qianwen.com",
    validation_url: "https://www.qianwen.com/",
    qr_selector: None,
    chat_url: "https://www.qianwen.com/api/chat",
    origin: "https://www.qianwen.com",
    referer: "https://www.qianwen.com/",
    models: &["qianwen-v1"],
    default_model: "qianwen-v1",
    default_quota: 1_000_000,
};

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// One frame of the chat stream. Frames are snapshots of the reply so far.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct QianwenFrame {
    /// Frame payload; absent on bookkeeping frames.
    #[serde(default)]
    pub data: Option<QianwenData>,
}

/// Payload of a stream frame.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct QianwenData {
    /// Full reply text generated so far.
    #[serde(default)]
    pub text: String,
    /// Set on the last frame of a reply.
    #[serde(default)]
    pub is_end: Option<bool>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// qianwen.com web chat.
#[derive(Debug, Clone, Copy)]
pub struct Qianwen;

impl PlatformAdapter for Qianwen {
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
                "prompt": request.flattened_prompt(),
                "sessionId": "",
                "model": DESCRIPTOR.resolve_model(request),
            }),
            stream: true,
        })
    }

    fn parse_chat_response(&self, _body: &str) -> Result<ChatResponse, PlatformError> {
        Err(PlatformError::Parse {
            platform: PlatformId::Qianwen,
            detail: "replies are always delivered as an event stream".to_owned(),
        })
    }

    fn parse_stream_payload(
        &self,
        payload: &str,
        state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError> {
        let Ok(frame) = serde_json::from_str::<QianwenFrame>(payload) else {
            return Ok(None);
        };
        let Some(data) = frame.data else {
            return Ok(None);
        };
        let delta = state.delta_from_snapshot(&data.text);
        let finished = data.is_end.unwrap_or(false);
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
