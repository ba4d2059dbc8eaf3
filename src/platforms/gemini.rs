//! Gemini web adapter (gemini.google.com).
//!
//! Gemini's web endpoint answers with a single JSON document rather than an
//! event stream; streamed callers get the whole reply as one chunk.

use serde::Deserialize;

use crate::credential::CredentialPayload;
use crate::schema::{ChatChunk, ChatRequest, ChatResponse, FinishReason, TokenUsage};

use super::{
    wire_headers, LoginDetect, PlatformAdapter, PlatformDescriptor, PlatformError, PlatformId,
    StreamState, WireRequest,
};

static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    id: PlatformId::Gemini,
    display_name: "Gemini",
    login_url: "https://gemini.google.com/",
    login_detect: LoginDetect::UrlPattern("**/gemini.google.com/**"),
    required_cookies: &[
        "SID",
        "HSID",
        "SSID",
        "APISID",
        "SAPISID",
        "__Secure-1PSID",
        "__Secure-3PSID",
    ],
    optional_cookies: &["NID", "__Secure-1PSIDTS", "__Secure-3PSIDTS"],
    cookie_domain: ".google.com",
    validation_url: "https://gemini.google.com/",
    qr_selector: None,
    chat_url: "https://gemini.google.com/api/chat",
    origin: "https://gemini.google.com",
    referer: "https://gemini.google.com/",
    models: &["gemini-pro", "gemini-pro-vision"],
    default_model: "gemini-pro",
    default_quota: 1_000_000,
};

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Buffered reply body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct GeminiResponse {
    /// Reply candidates; the first one carries the reply.
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    /// Token accounting for the call.
    #[serde(rename = "usageMetadata", default)]
    pub usage_metadata: Option<GeminiUsage>,
}

/// One reply candidate.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct GeminiCandidate {
    /// Candidate content.
    #[serde(default)]
    pub content: Option<GeminiContent>,
    /// `"STOP"`, `"MAX_TOKENS"`, or `"SAFETY"`.
    #[serde(rename = "finishReason", default)]
    pub finish_reason: Option<String>,
}

/// Content of a candidate.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct GeminiContent {
    /// Text parts of the reply.
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

/// One text part.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct GeminiPart {
    /// Part text.
    #[serde(default)]
    pub text: String,
}

/// Token accounting as the platform reports it.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct GeminiUsage {
    /// Prompt tokens consumed.
    #[serde(rename = "promptTokenCount", default)]
    pub prompt_token_count: u64,
    /// Reply tokens generated.
    #[serde(rename = "candidatesTokenCount", default)]
    pub candidates_token_count: u64,
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_owned()),
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Gemini web chat.
#[derive(Debug, Clone, Copy)]
pub struct Gemini;

impl PlatformAdapter for Gemini {
    fn descriptor(&self) -> &'static PlatformDescriptor {
        &DESCRIPTOR
    }

    fn build_chat_request(
        &self,
        payload: &CredentialPayload,
        request: &ChatRequest,
    ) -> Result<WireRequest, PlatformError> {
        let mut generation_config = serde_json::Map::new();
        if let Some(temperature) = request.temperature {
            generation_config.insert("temperature".to_owned(), serde_json::json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            generation_config.insert("maxOutputTokens".to_owned(), serde_json::json!(max_tokens));
        }
        Ok(WireRequest {
            method: reqwest::Method::POST,
            url: DESCRIPTOR.chat_url.to_owned(),
            headers: wire_headers(&DESCRIPTOR, payload),
            body: serde_json::json!({
                "model": DESCRIPTOR.resolve_model(request),
                "contents": [{
                    "role": "user",
                    "parts": [{"text": request.flattened_prompt()}],
                }],
                "generationConfig": generation_config,
            }),
            stream: false,
        })
    }

    fn parse_chat_response(&self, body: &str) -> Result<ChatResponse, PlatformError> {
        let reply: GeminiResponse =
            serde_json::from_str(body).map_err(|e| PlatformError::Parse {
                platform: PlatformId::Gemini,
                detail: e.to_string(),
            })?;
        let candidate = reply
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::Parse {
                platform: PlatformId::Gemini,
                detail: "reply carried no candidates".to_owned(),
            })?;
        let content = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .iter()
                    .map(|part| part.text.as_str())
                    .collect::<String>()
            })
            .unwrap_or_default();
        Ok(ChatResponse {
            content,
            model: DESCRIPTOR.default_model.to_owned(),
            finish_reason: candidate
                .finish_reason
                .as_deref()
                .map_or(FinishReason::Stop, map_finish_reason),
            usage: reply.usage_metadata.map(|usage| TokenUsage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
            }),
        })
    }

    fn parse_stream_payload(
        &self,
        _payload: &str,
        _state: &mut StreamState,
    ) -> Result<Option<ChatChunk>, PlatformError> {
        Err(PlatformError::Parse {
            platform: PlatformId::Gemini,
            detail: "replies are never delivered as an event stream".to_owned(),
        })
    }
}
