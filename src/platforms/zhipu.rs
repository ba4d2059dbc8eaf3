//! ChatGLM web adapter (chatglm.cn).

use serde::Deserialize;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason};

use super::{
    wire_headers, LoginDetect, PlatformAdapter, PlatformDescriptor, PlatformError, PlatformId,
    StreamState, WireRequest,
};

/// Default web assistant behind the stream endpoint.
const ASSISTANT_ID: &str = "65940acff94777010aa6b796";

static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::Zhipu,
    display_name: "ChatGLM",
    login_url: "https://chatglm.cn/",
    login_detect: LoginDetect::UrlPattern("**/chatglm.cn/**"),
    required_cookies: &["chatglm_token", "chatglm_refresh_token", "chatglm_user_id"],
    optional_cookies: &["chatglm_token_expires", "acw_tc"],
    cookie_domain: ".chatglm.cn",
    validation_url: "https://chatglm.cn/chatglm/backend-api/v1/user/info",
    qr_selector: None,
    chat_url: "https://chatglm.cn/chatglm/backend-api/assistant/stream",
    origin: "https://chatglm.cn",
    referer: "https://chatglm.cn/",
    models: &["glm-4-flash", "glm-4", "glm-4v"],
    default_model: "glm-4-flash",
    default_quota: 1_000_000,
};

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// One frame of the assistant stream.
///
/// Frames are snapshots: each part's text blocks carry the whole reply
/// generated so far.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ZhipuFrame {
    /// Reply parts in their current state.
    #[serde(default)]
    pub parts: Vec<ZhipuPart>,
    /// `"generating"` while streaming, `"finish"` on the last frame.
    #[serde(default)]
    pub status: Option<String>,
}

/// One reply part.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ZhipuPart {
    /// Content blocks of the part.
    #[serde(default)]
    pub content: Vec<ZhipuBlock>,
}

/// One content block.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ZhipuBlock {
    /// Block kind; replies use `"text"`.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Block text, full reply so far.
    #[serde(default)]
    pub text: String,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// ChatGLM web chat.
#[derive(Debug, Clone, Copy)]
pub struct Zhipu;

impl PlatformAdapter for Zhipu {
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
                "assistant_id": ASSISTANT_ID,
                "conversation_id": "",
                "meta_data": {"is_test": false, "mention_conversation_id": ""},
                "messages": [{
                    "role": "user",
                    "content": [{"type": "text", "text": request.flattened_prompt()}],
                }],
            }),
            stream: true,
        })
    }

    fn parse_chat_response(&self, _body: &str) -> Result<ChatResponse, PlatformError> {
        Err(PlatformError::Parse {
            platform: PlatformId::Zhipu,
            detail: "replies are always delivered as an event stream".to_owned(),
        })
    }

    fn parse_stream_payload(
        &self,
        payload: &str,
        state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError> {
        let Ok(frame) = serde_json::from_str::<ZhipuFrame>(payload) else {
            return Ok(None);
        };
        let snapshot: String = frame
            .parts
            .iter()
            .flat_map(|part| part.content.iter())
            .filter(|block| block.kind.as_deref().unwrap_or("text") == "text")
            .map(|block| block.text.as_str())
            .collect();
        let delta = state.delta_from_snapshot(&snapshot);
        let finished = frame.status.as_deref() == Some("finish");
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
