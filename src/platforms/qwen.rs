//! Tongyi Qianwen classic web adapter (tongyi.aliyun.com).

use serde::Deserialize;
use uuid::Uuid;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason};

use super::{
    wire_headers, LoginDetect, PlatformAdapter, PlatformDescriptor, PlatformError, PlatformId,
    StreamState, WireRequest,
};

static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::Qwen,
    display_name: "Tongyi Qianwen",
    login_url: "https://tongyi.aliyun.com/qianwen/",
    login_detect: LoginDetect::UrlPattern("**/tongyi.aliyun.com/qianwen/**"),
    required_cookies: &[
        "login_aliyunid_ticket",
        "cna",
        "isg",
        "aliyun_choice",
        "aliyun_lang",
        "login_aliyunid_csrf",
        "login_aliyunid_pk",
        "tfstk",
    ],
    optional_cookies: &["login_aliyunid", "atpsida"],
    cookie_domain: ".aliyun.com",
    validation_url: "https://tongyi.aliyun.com/qianwen/",
    qr_selector: None,
    chat_url: "https://qianwen.biz.aliyun.com/dialog/conversation",
    origin: "https://tongyi.aliyun.com",
    referer: "https://tongyi.aliyun.com/qianwen/",
    models: &["qwen-v2", "qwen-v1"],
    default_model: "qwen-v2",
    default_quota: 1_000_000,
};

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// One frame of the conversation stream.
///
/// Frames are snapshots: `contents` carries the whole reply generated so far,
/// not a delta.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct QwenFrame {
    /// Reply content blocks, full text so far.
    #[serde(default)]
    pub contents: Vec<QwenContent>,
    /// `"generating"` while streaming, `"finished"` on the last frame.
    #[serde(rename = "msgStatus", default)]
    pub msg_status: Option<String>,
}

/// A content block inside a stream frame.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct QwenContent {
    /// Block text.
    #[serde(default)]
    pub content: String,
    /// Block kind; replies use `"text"`.
    #[serde(rename = "contentType", default)]
    pub content_type: Option<String>,
    /// Block author role.
    #[serde(default)]
    pub role: Option<String>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Tongyi Qianwen classic web chat.
#[derive(Debug, Clone, Copy)]
pub struct Qwen;

impl PlatformAdapter for Qwen {
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
                "action": "next",
                "mode": "chat",
                "model": "",
                "requestId": Uuid::new_v4().to_string(),
                "sessionId": "",
                "sessionType": "text_chat",
                "parentMsgId": "",
                "contents": [{
                    "content": request.flattened_prompt(),
                    "contentType": "text",
                    "role": "user",
                }],
            }),
            stream: true,
        })
    }

    fn parse_chat_response(&self, _body: &str) -> Result<ChatResponse, PlatformError> {
        Err(PlatformError::Parse {
            platform: PlatformId::Qwen,
            detail: "replies are always delivered as an event stream".to_owned(),
        })
    }

    fn parse_stream_payload(
        &self,
        payload: &str,
        state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError> {
        let Ok(frame) = serde_json::from_str::<QwenFrame>(payload) else {
            return Ok(None);
        };
        let snapshot: String = frame
            .contents
            .iter()
            .filter(|block| {
                block.content_type.as_deref().unwrap_or("text") == "text"
                    && block.role.as_deref().unwrap_or("assistant") == "assistant"
            })
            .map(|block| block.content.as_str())
            .collect();
        let delta = state.delta_from_snapshot(&snapshot);
        let finished = frame.msg_status.as_deref() == Some("finished");
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
