//! Qwen chat adapter, current generation (chat.qwen.ai).
//!
//! The only registered platform whose private API follows the OpenAI
//! completion shape, including real token usage in replies. Both buffered
//! and streamed calls are supported on the wire.

use serde::Deserialize;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason, TokenUsage};

use super::{
    wire_headers, LoginDetect, PlatformAdapter, PlatformDescriptor, PlatformError, PlatformId,
    StreamState, WireRequest,
};

static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::ChatQwen,
    display_name: "Qwen Chat",
    login_url: "https://chat.qwen.ai/",
    login_detect: LoginDetect::UrlPattern("**/chat.qwen.ai/**"),
    required_cookies: &["login_aliyunid_ticket", "t"],
    optional_cookies: &[
        "cna",
        "isg",
        "tfstk",
        "login_aliyunid",
        "login_aliyunid_csrf",
        "login_aliyunid_pk",
        "aliyun_choice",
        "aliyun_lang",
        "atpsida",
    ],
    cookie_domain: ".qwen.ai",
    validation_url: "https://chat.qwen.ai/",
    qr_selector: None,
    chat_url: "https://chat.qwen.ai/api/chat/completions",
    origin: "https://chat.qwen.ai",
    referer: "https://chat.qwen.ai/",
    models: &["qwen-max", "qwen-plus", "qwen-turbo"],
    default_model: "qwen-max",
    default_quota: 1_000_000,
};

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Buffered completion reply.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatQwenResponse {
    /// Completion choices; the first one carries the reply.
    pub choices: Vec<ChatQwenChoice>,
    /// Model that served the reply.
    #[serde(default)]
    pub model: Option<String>,
    /// Token usage for the call.
    #[serde(default)]
    pub usage: Option<ChatQwenUsage>,
}

/// One buffered completion choice.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatQwenChoice {
    /// The reply message.
    pub message: ChatQwenMessage,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The reply message of a buffered choice.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatQwenMessage {
    /// Reply text.
    #[serde(default)]
    pub content: String,
}

/// One frame of a streamed reply.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatQwenStreamFrame {
    /// Stream choices; the first one carries the delta.
    #[serde(default)]
    pub choices: Vec<ChatQwenStreamChoice>,
    /// Usage totals, present on the final frame when the platform reports
    /// them.
    #[serde(default)]
    pub usage: Option<ChatQwenUsage>,
}

/// One streamed completion choice.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatQwenStreamChoice {
    /// Incremental content.
    #[serde(default)]
    pub delta: ChatQwenDelta,
    /// Why generation stopped; set on the final content frame.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Incremental content of a stream choice.
#[doc(hidden)]
#[derive(Debug, Default, Deserialize)]
pub struct ChatQwenDelta {
    /// Newly generated text.
    #[serde(default)]
    pub content: Option<String>,
}

/// Token usage as the platform reports it.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatQwenUsage {
    /// Prompt tokens consumed.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Completion tokens generated.
    #[serde(default)]
    pub completion_tokens: u64,
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_owned()),
    }
}

fn map_usage(usage: ChatQwenUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Qwen chat, current generation.
#[derive(Debug, Clone, Copy)]
pub struct ChatQwen;

impl PlatformAdapter for ChatQwen {
    fn descriptor(&self) -> &'static PlatformDescriptor {
        &DESCRIPTOR
    }

    fn build_chat_request(
        &self,
        payload: &CredentialPayload,
        request: &ChatRequest,
    ) -> Result<WireRequest, PlatformError> {
        let mut body = serde_json::json!({
            "model": DESCRIPTOR.resolve_model(request),
            "messages": request.messages,
            "stream": request.stream,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        Ok(WireRequest {
            method: reqwest::Method::POST,
            url: DESCRIPTOR.chat_url.to_owned(),
            headers: wire_headers(&DESCRIPTOR, payload),
            body,
            stream: request.stream,
        })
    }

    fn parse_chat_response(&self, body: &str) -> Result<ChatResponse, PlatformError> {
        let reply: ChatQwenResponse =
            serde_json::from_str(body).map_err(|e| PlatformError::Parse {
                platform: PlatformId::ChatQwen,
                detail: e.to_string(),
            })?;
        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::Parse {
                platform: PlatformId::ChatQwen,
                detail: "reply carried no choices".to_owned(),
            })?;
        Ok(ChatResponse {
            content: choice.message.content,
            model: reply
                .model
                .unwrap_or_else(|| DESCRIPTOR.default_model.to_owned()),
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map_or(FinishReason::Stop, map_finish_reason),
            usage: reply.usage.map(map_usage),
        })
    }

    fn parse_stream_payload(
        &self,
        payload: &str,
        _state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError> {
        let Ok(frame) = serde_json::from_str::<ChatQwenStreamFrame>(payload) else {
            return Ok(None);
        };
        let usage = frame.usage.map(map_usage);
        let Some(choice) = frame.choices.into_iter().next() else {
            // The trailing usage-only frame has no choices.
            return Ok(usage.map(|usage| ChatChunk {
                delta: String::new(),
                finish_reason: None,
                usage: Some(usage),
            }));
        };
        let delta = choice.delta.content.unwrap_or_default();
        let finish_reason = choice.finish_reason.as_deref().map(map_finish_reason);
        if delta.is_empty() && finish_reason.is_none() && usage.is_none() {
            return Ok(None);
        }
        Ok(Some(ChatChunk {
            delta,
            finish_reason,
            usage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> CredentialPayload {
        CredentialPayload::from_cookies([("login_aliyunid_ticket", "t"), ("t", "v")])
    }

    #[test]
    fn wire_stream_flag_follows_the_request() {
        let buffered = ChatQwen
            .build_chat_request(&payload(), &ChatRequest::from_prompt("hi"))
            .unwrap();
        assert!(!buffered.stream);
        assert_eq!(buffered.body["model"], "qwen-max");

        let mut streaming = ChatRequest::from_prompt("hi");
        streaming.stream = true;
        streaming.model = Some("qwen-turbo".to_owned());
        let wire = ChatQwen.build_chat_request(&payload(), &streaming).unwrap();
        assert!(wire.stream);
        assert_eq!(wire.body["model"], "qwen-turbo");
    }

    #[test]
    fn buffered_reply_parses_content_and_usage() {
        let body = r#"{
            "choices": [{"message": {"content": "four"}, "finish_reason": "stop"}],
            "model": "qwen-max",
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }"#;
        let reply = ChatQwen.parse_chat_response(body).unwrap();
        assert_eq!(reply.content, "four");
        assert_eq!(reply.finish_reason, FinishReason::Stop);
        let usage = reply.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn reply_without_choices_is_a_parse_error() {
        let err = ChatQwen.parse_chat_response(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, PlatformError::Parse { .. }));
    }

    #[test]
    fn stream_frames_carry_deltas_then_usage() {
        let mut state = StreamState::new();
        let chunk = ChatQwen
            .parse_stream_payload(
                r#"{"choices":[{"delta":{"content":"fo"},"finish_reason":null}]}"#,
                &mut state,
            )
            .unwrap()
            .unwrap();
        assert_eq!(chunk.delta, "fo");

        let last = ChatQwen
            .parse_stream_payload(
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                &mut state,
            )
            .unwrap()
            .unwrap();
        assert_eq!(last.finish_reason, Some(FinishReason::Stop));

        let usage_frame = ChatQwen
            .parse_stream_payload(
                r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2}}"#,
                &mut state,
            )
            .unwrap()
            .unwrap();
        assert_eq!(usage_frame.usage.unwrap().completion_tokens, 2);
    }
}
