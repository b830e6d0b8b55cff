//! Provider-facing request and response types, and the `LlmProvider` trait.
//!
//! Requests are strongly typed per capability (chat, extraction) and
//! validated at construction — no ad-hoc JSON payloads cross this boundary.

use async_trait::async_trait;

use crate::crm::MessageRole;
use crate::error::ProviderError;

/// One message in a provider chat request.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Model,
            content: content.into(),
        }
    }
}

/// Generation settings derived from the workspace's budget tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Conversation history plus the current user message, oldest first.
    /// Never empty.
    pub messages: Vec<ChatMessage>,
    pub system_instruction: Option<String>,
    pub settings: GenerationSettings,
    pub tools_enabled: bool,
}

impl ChatRequest {
    /// Build a request. Fails on an empty message list — a chat call with
    /// nothing to respond to is always a caller bug.
    pub fn new(
        messages: Vec<ChatMessage>,
        settings: GenerationSettings,
    ) -> Result<Self, ProviderError> {
        if messages.is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: "request".into(),
                reason: "chat request requires at least one message".into(),
            });
        }
        Ok(Self {
            messages,
            system_instruction: None,
            settings,
            tools_enabled: false,
        })
    }

    pub fn with_system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_tools(mut self, enabled: bool) -> Self {
        self.tools_enabled = enabled;
        self
    }
}

/// A structured-extraction request: the provider must answer with a single
/// JSON object matching `instruction`.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// Transcript to distill, oldest first. Never empty.
    pub transcript: Vec<ChatMessage>,
    /// Describes the exact JSON shape expected back.
    pub instruction: String,
    pub settings: GenerationSettings,
}

impl ExtractionRequest {
    pub fn new(
        transcript: Vec<ChatMessage>,
        instruction: impl Into<String>,
        settings: GenerationSettings,
    ) -> Result<Self, ProviderError> {
        if transcript.is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: "request".into(),
                reason: "extraction request requires a non-empty transcript".into(),
            });
        }
        Ok(Self {
            transcript,
            instruction: instruction.into(),
            settings,
        })
    }
}

/// Token usage from a provider call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Which backend and model produced a response.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub provider: String,
    pub model: String,
}

/// A chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    /// Provider-reported confidence in the draft, when available. The
    /// post-generation gate consumes this; absence means the check passes.
    pub confidence: Option<f32>,
    pub usage: TokenUsage,
    pub provider_info: ProviderInfo,
}

/// Abstraction over LLM backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// The model identifier this provider targets.
    fn model_name(&self) -> &str;

    /// Run a chat completion.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Run a structured extraction, returning the parsed JSON object.
    async fn extract(&self, request: ExtractionRequest)
        -> Result<serde_json::Value, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> GenerationSettings {
        GenerationSettings {
            max_tokens: 512,
            temperature: 0.5,
        }
    }

    #[test]
    fn chat_request_rejects_empty_messages() {
        assert!(ChatRequest::new(vec![], settings()).is_err());
        assert!(ChatRequest::new(vec![ChatMessage::user("hi")], settings()).is_ok());
    }

    #[test]
    fn chat_request_builders() {
        let request = ChatRequest::new(vec![ChatMessage::user("hi")], settings())
            .unwrap()
            .with_system("Be brief.")
            .with_tools(true);
        assert_eq!(request.system_instruction.as_deref(), Some("Be brief."));
        assert!(request.tools_enabled);
    }

    #[test]
    fn extraction_request_rejects_empty_transcript() {
        assert!(ExtractionRequest::new(vec![], "shape", settings()).is_err());
    }

    #[test]
    fn usage_total() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
        };
        assert_eq!(usage.total(), 120);
    }
}
