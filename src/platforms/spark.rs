//! iFlytek Spark web adapter (xinghuo.xfyun.cn).
//!
//! Spark's stream payloads are not JSON: each frame carries a base64-encoded
//! text fragment, and the literal payload `<end>` closes the reply.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason};

use super::{
    wire_headers, LoginDetect, PlatformAdapter, PlatformDescriptor, PlatformError, PlatformId,
    StreamState, WireRequest,
};

/// Payload of the final stream frame.
const END_SENTINEL: &str = "<end>";

static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::Spark,
    display_name: "iFlytek Spark",
    login_url: "https://xinghuo.xfyun.cn/",
    login_detect: LoginDetect::UrlPattern("**/xinghuo.xfyun.cn/**"),
    required_cookies: &["ssoSessionId", "refreshToken", "accessToken"],
    optional_cookies: &["gr_user_id", "account_id"],
    cookie_domain: ".xfyun.cn",
    validation_url: "https://xinghuo.xfyun.cn/iflygpt/u/user/info",
    qr_selector: None,
    chat_url: "https://xinghuo.xfyun.cn/iflygpt-chat/u/chat_message/chat",
    origin: "https://xinghuo.xfyun.cn",
    referer: "https://xinghuo.xfyun.cn/",
    models: &["spark-lite", "spark-pro", "spark-max"],
    default_model: "spark-lite",
    default_quota: 1_000_000,
};

/// Public model names map onto the chat backend's internal slugs.
fn model_slug(model: &str) -> &str {
    match model {
        "spark-lite" => "general",
        "spark-pro" => "generalv3",
        "spark-max" => "generalv3.5",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// iFlytek Spark web chat.
#[derive(Debug, Clone, Copy)]
pub struct Spark;

impl PlatformAdapter for Spark {
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
                "chatId": "",
                "text": request.flattened_prompt(),
                "model": model_slug(&model),
            }),
            stream: true,
        })
    }

    fn parse_chat_response(&self, _body: &str) -> Result<ChatResponse, PlatformError> {
        Err(PlatformError::Parse {
            platform: PlatformId::Spark,
            detail: "replies are always delivered as an event stream".to_owned(),
        })
    }

    fn parse_stream_payload(
        &self,
        payload: &str,
        _state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError> {
        if payload == END_SENTINEL {
            return Ok(Some(ChatChunk {
                delta: String::new(),
                finish_reason: Some(FinishReason::Stop),
                usage: None,
            }));
        }
        // Frames that fail to decode are bookkeeping, not reply text.
        let Ok(raw) = BASE64.decode(payload.trim()) else {
            return Ok(None);
        };
        let Ok(delta) = String::from_utf8(raw) else {
            return Ok(None);
        };
        if delta.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChatChunk {
            delta,
            finish_reason: None,
            usage: None,
        }))
    }
}
