//! ERNIE Bot web adapter (yiyan.baidu.com).

use serde::Deserialize;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason};

use super::{
    wire_headers, LoginDetect, PlatformAdapter, PlatformDescriptor, PlatformError, PlatformId,
    StreamState, WireRequest,
};

static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::Baidu,
    display_name: "ERNIE Bot",
    login_url: "https://yiyan.baidu.com/",
    login_detect: LoginDetect::UrlPattern("**/yiyan.baidu.com/**"),
    required_cookies: &["BAIDUID", "BDUSS", "BDUSS_BFESS", "STOKEN", "PTOKEN"],
    optional_cookies: &["BAIDUID_BFESS", "H_PS_PSSID"],
    cookie_domain: ".baidu.com",
    validation_url: "https://yiyan.baidu.com/eb/user/info",
    qr_selector: None,
    chat_url: "https://yiyan.baidu.com/eb/chat/new",
    origin: "https://yiyan.baidu.com",
    referer: "https://yiyan.baidu.com/",
    models: &["ernie-bot-turbo", "ernie-bot"],
    default_model: "ernie-bot-turbo",
    default_quota: 1_000_000,
};

/// Public model names map onto the chat backend's internal slugs.
fn model_slug(model: &str) -> &str {
    match model {
        "ernie-bot-turbo" => "eb-turbo-pro-v1",
        "ernie-bot" => "eb-pro-v1",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// One frame of the chat stream. Frames carry incremental text.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct BaiduFrame {
    /// Frame payload; absent on bookkeeping frames.
    #[serde(default)]
    pub data: Option<BaiduData>,
}

/// Payload of a stream frame.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct BaiduData {
    /// Newly generated text since the previous frame.
    #[serde(default)]
    pub text: String,
    /// `1` on the last frame of a reply.
    #[serde(default)]
    pub is_end: Option<i64>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// ERNIE Bot web chat.
#[derive(Debug, Clone, Copy)]
pub struct Baidu;

impl PlatformAdapter for Baidu {
    fn descriptor(&self) -> &'static PlatformDescriptor {
        &DESCRIPTOR
    }

    fn build_chat_request(
        &self,
        payload: &CredentialPayload,
        request: &ChatRequest,
    ) -> Result<WireRequest, PlatformError> {
        let model = DESCRIPTOR.resolve_model(request);
        Ok(WireRequest {
            method: reqwest::Method::POST,
            url: DESCRIPTOR.chat_url.to_owned(),
            headers: wire_headers(&DESCRIPTOR, payload),
            body: serde_json::json!({
                "text": request.flattened_prompt(),
                "sessionId": "",
                "model": model_slug(&model),
            }),
            stream: true,
        })
    }

    fn parse_chat_response(&self, _body: &str) -> Result<ChatResponse, PlatformError> {
        Err(PlatformError::Parse {
            platform: PlatformId::Baidu,
            detail: "replies are always delivered as an event stream".to_owned(),
        })
    }

    fn parse_stream_payload(
        &self,
        payload: &str,
        _state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError> {
        let Ok(frame) = serde_json::from_str::<BaiduFrame>(payload) else {
            return Ok(None);
        };
        let Some(data) = frame.data else {
            return Ok(None);
        };
        let finished = data.is_end.unwrap_or(0) == 1;
        if data.text.is_empty() && !finished {
            return Ok(None);
        }
        Ok(Some(ChatChunk {
            delta: data.text,
            finish_reason: finished.then_some(FinishReason::Stop),
            usage: None,
        }))
    }
}
