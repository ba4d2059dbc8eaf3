//! Claude web adapter (claude.ai).

use serde::Deserialize;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason};

use super::{
    wire_headers, LoginDetect, PlatformAdapter, PlatformDescriptor, PlatformError, PlatformId,
    StreamState, WireRequest,
};

static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::Claude,
    display_name: "Claude",
    login_url: "https://claude.ai/",
    login_detect: LoginDetect::UrlPattern("**/claude.ai/**"),
    required_cookies: &["sessionKey", "__cf_bm", "_cfuvid"],
    optional_cookies: &["cf_clearance", "activitySessionId"],
    cookie_domain: ".claude.ai",
    validation_url: "https://claude.ai/api/organizations",
    qr_selector: None,
    chat_url: "https://claude.ai/api/append_message",
    origin: "https://claude.ai",
    referer: "https://claude.ai/",
    models: &["claude-2.1", "claude-2.0", "claude-instant-1.2"],
    default_model: "claude-2.1",
    default_quota: 1_000_000,
};

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// One frame of the completion stream. Frames carry incremental text.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ClaudeFrame {
    /// Newly generated text since the previous frame.
    #[serde(default)]
    pub completion: Option<String>,
    /// Set on the final frame, e.g. `"stop_sequence"` or `"max_tokens"`.
    #[serde(default)]
    pub stop_reason: Option<String>,
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "stop_sequence" | "end_turn" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        other => FinishReason::Other(other.to_owned()),
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Claude web chat.
#[derive(Debug, Clone, Copy)]
pub struct Claude;

impl PlatformAdapter for Claude {
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
                "model": DESCRIPTOR.resolve_model(request),
                "timezone": "Asia/Shanghai",
                "attachments": [],
            }),
            stream: true,
        })
    }

    fn parse_chat_response(&self, _body: &str) -> Result<ChatResponse, PlatformError> {
        Err(PlatformError::Parse {
            platform: PlatformId::Claude,
            detail: "replies are always delivered as an event stream".to_owned(),
        })
    }

    fn parse_stream_payload(
        &self,
        payload: &str,
        _state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError> {
        let Ok(frame) = serde_json::from_str::<ClaudeFrame>(payload) else {
            return Ok(None);
        };
        let delta = frame.completion.unwrap_or_default();
        let finish_reason = frame.stop_reason.as_deref().map(map_stop_reason);
        if delta.is_empty() && finish_reason.is_none() {
            return Ok(None);
        }
        Ok(Some(ChatChunk {
            delta,
            finish_reason,
            usage: None,
        }))
    }
}
