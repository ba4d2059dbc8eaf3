//! ChatGPT web adapter (chatgpt.com).

use serde::Deserialize;
use uuid::Uuid;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason};

use super::{
    wire_headers, LoginDetect, PlatformAdapter, PlatformDescriptor, PlatformError, PlatformId,
    StreamState, WireRequest,
};

static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::OpenAi,
    display_name: "ChatGPT",
    login_url: "https://chatgpt.com/",
    login_detect: LoginDetect::UrlPattern("**/chatgpt.com/**"),
    required_cookies: &[
        "__Secure-next-auth.session-token",
        "__Secure-next-auth.callback-url",
        "__Host-next-auth.csrf-token",
        "_cfuvid",
    ],
    optional_cookies: &["__cf_bm", "cf_clearance"],
    cookie_domain: ".chatgpt.com",
    validation_url: "https://chatgpt.com/api/auth/session",
    qr_selector: None,
    chat_url: "https://chatgpt.com/backend-api/conversation",
    origin: "https://chatgpt.com",
    referer: "https://chatgpt.com/",
    models: &["gpt-3.5-turbo", "gpt-4", "gpt-4-turbo"],
    default_model: "gpt-3.5-turbo",
    default_quota: 1_000_000,
};

/// Public model names map onto the conversation backend's internal slugs.
fn model_slug(model: &str) -> &str {
    match model {
        "gpt-3.5-turbo" => "text-davinci-002-render-sha",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// One frame of the conversation stream.
///
/// Frames are snapshots: `message.content.parts` holds the whole reply
/// generated so far.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct OpenAiFrame {
    /// The assistant message in its current state.
    #[serde(default)]
    pub message: Option<OpenAiMessage>,
}

/// The assistant message inside a stream frame.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct OpenAiMessage {
    /// Message author.
    #[serde(default)]
    pub author: Option<OpenAiAuthor>,
    /// Message content.
    #[serde(default)]
    pub content: Option<OpenAiContent>,
    /// `"in_progress"` while generating, `"finished_successfully"` at the
    /// end.
    #[serde(default)]
    pub status: Option<String>,
}

/// Author of a conversation message.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct OpenAiAuthor {
    /// Author role.
    #[serde(default)]
    pub role: Option<String>,
}

/// Content of a conversation message.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct OpenAiContent {
    /// Content kind; replies use `"text"`.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Text parts, full reply so far.
    #[serde(default)]
    pub parts: Vec<String>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// ChatGPT web chat.
#[derive(Debug, Clone, Copy)]
pub struct OpenAi;

impl PlatformAdapter for OpenAi {
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
                "action": "next",
                "messages": [{
                    "id": Uuid::new_v4().to_string(),
                    "author": {"role": "user"},
                    "content": {
                        "content_type": "text",
                        "parts": [request.flattened_prompt()],
                    },
                }],
                "model": model_slug(&model),
                "parent_message_id": Uuid::new_v4().to_string(),
                "history_and_training_disabled": true,
            }),
            stream: true,
        })
    }

    fn parse_chat_response(&self, _body: &str) -> Result<ChatResponse, PlatformError> {
        Err(PlatformError::Parse {
            platform: PlatformId::OpenAi,
            detail: "replies are always delivered as an event stream".to_owned(),
        })
    }

    fn parse_stream_payload(
        &self,
        payload: &str,
        state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError> {
        let Ok(frame) = serde_json::from_str::<OpenAiFrame>(payload) else {
            return Ok(None);
        };
        let Some(message) = frame.message else {
            return Ok(None);
        };
        let is_assistant = message
            .author
            .as_ref()
            .and_then(|author| author.role.as_deref())
            == Some("assistant");
        if !is_assistant {
            return Ok(None);
        }
        let Some(content) = message.content else {
            return Ok(None);
        };
        if content.content_type.as_deref().unwrap_or("text") != "text" {
            return Ok(None);
        }
        let snapshot = content.parts.first().map(String::as_str).unwrap_or("");
        let delta = state.delta_from_snapshot(snapshot);
        let finished = message.status.as_deref() == Some("finished_successfully");
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
