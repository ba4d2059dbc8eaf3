//! Canonical chat-completion schema.
//!
//! Every platform adapter maps these types into its own wire shape and back.
//! Nothing in here is platform-specific, stateful, or secret-bearing; the
//! types cross the caller boundary as plain data.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction.
    System,
    /// Human user message.
    User,
    /// Assistant reply.
    Assistant,
}

impl Role {
    /// Lowercase wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// Plain text content.
    pub content: String,
}

impl ChatMessage {
    /// Convenience constructor for a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Convenience constructor for a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A canonical chat-completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation history including the latest user message.
    pub messages: Vec<ChatMessage>,
    /// Requested model; `None` selects the platform's default model.
    #[serde(default)]
    pub model: Option<String>,
    /// Whether the caller wants a chunk stream instead of a buffered reply.
    #[serde(default)]
    pub stream: bool,
    /// Sampling temperature, if the platform honors one.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens, if the platform honors one.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Single-turn request with one user message.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(prompt)],
            model: None,
            stream: false,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Collapse the conversation into one prompt string.
    ///
    /// Several web platforms accept only a single text input per turn;
    /// adapters for those flatten the history with role prefixes, keeping a
    /// bare prompt unprefixed when the conversation is a single user message.
    pub fn flattened_prompt(&self) -> String {
        if let [only] = self.messages.as_slice() {
            if only.role == Role::User {
                return only.content.clone();
            }
        }
        let mut prompt = String::new();
        for message in &self.messages {
            if !prompt.is_empty() {
                prompt.push('\n');
            }
            prompt.push_str(message.role.as_str());
            prompt.push_str(": ");
            prompt.push_str(&message.content);
        }
        prompt
    }

    /// Total characters across all message contents, for token estimation.
    pub fn content_chars(&self) -> u64 {
        self.messages
            .iter()
            .map(|m| u64::try_from(m.content.chars().count()).unwrap_or(u64::MAX))
            .fold(0, u64::saturating_add)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Why a completion stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Normal end of the reply.
    Stop,
    /// Token limit reached.
    Length,
    /// The platform filtered the content.
    ContentFilter,
    /// Platform-specific other reason.
    Other(String),
}

/// Token usage reported by (or estimated for) one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated in the reply.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Prompt plus completion tokens.
    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// A buffered (non-streaming) chat reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Reply text.
    pub content: String,
    /// Model that served the reply, as reported or requested.
    pub model: String,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
    /// Token usage when the platform reports it.
    pub usage: Option<TokenUsage>,
}

/// One chunk of a streamed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Incremental reply text. May be empty on bookkeeping chunks.
    pub delta: String,
    /// Present on the final chunk.
    pub finish_reason: Option<FinishReason>,
    /// Usage totals, when the platform attaches them to a chunk.
    pub usage: Option<TokenUsage>,
}
