//! Bridges rig's `CompletionModel` trait to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::message::AssistantContent;

use crate::crm::MessageRole;
use crate::error::ProviderError;
use crate::llm::provider::{
    ChatMessage, ChatRequest, ChatResponse, ExtractionRequest, LlmProvider, ProviderInfo,
    TokenUsage,
};

/// Adapter wrapping a rig completion model.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }

    fn request_failed(&self, e: impl std::fmt::Display) -> ProviderError {
        ProviderError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        }
    }

    fn invalid_response(&self, reason: impl Into<String>) -> ProviderError {
        ProviderError::InvalidResponse {
            provider: self.model_name.clone(),
            reason: reason.into(),
        }
    }

    /// Split our message list into rig history + final prompt message.
    fn to_rig_messages(messages: &[ChatMessage]) -> Option<(Vec<RigMessage>, RigMessage)> {
        let (last, history) = messages.split_last()?;
        let history = history
            .iter()
            .map(|m| match m.role {
                MessageRole::Model => RigMessage::assistant(m.content.clone()),
                // Tool transcripts are replayed as user context; the engine
                // never sends live tool results through this adapter.
                MessageRole::User | MessageRole::Tool => RigMessage::user(m.content.clone()),
            })
            .collect();
        let prompt = match last.role {
            MessageRole::Model => RigMessage::assistant(last.content.clone()),
            MessageRole::User | MessageRole::Tool => RigMessage::user(last.content.clone()),
        };
        Some((history, prompt))
    }

    async fn complete_text(
        &self,
        messages: &[ChatMessage],
        system_instruction: Option<&str>,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<(String, TokenUsage), ProviderError> {
        let (history, prompt) = Self::to_rig_messages(messages)
            .ok_or_else(|| self.invalid_response("no messages to send"))?;

        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .temperature(temperature as f64)
            .max_tokens(max_tokens as u64);
        if let Some(instruction) = system_instruction {
            builder = builder.preamble(instruction.to_string());
        }

        let response = self
            .model
            .completion(builder.build())
            .await
            .map_err(|e| self.request_failed(e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|part| match part {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(self.invalid_response("empty completion"));
        }

        let usage = TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        };
        Ok((content, usage))
    }
}

#[async_trait]
impl<M: CompletionModel + 'static> LlmProvider for RigAdapter<M> {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let (content, usage) = self
            .complete_text(
                &request.messages,
                request.system_instruction.as_deref(),
                request.settings.max_tokens,
                request.settings.temperature,
            )
            .await?;

        Ok(ChatResponse {
            content,
            // rig's chat surface carries no confidence signal; the post-gen
            // gate treats a missing score as passing.
            confidence: None,
            usage,
            provider_info: ProviderInfo {
                provider: "rig".into(),
                model: self.model_name.clone(),
            },
        })
    }

    async fn extract(
        &self,
        request: ExtractionRequest,
    ) -> Result<serde_json::Value, ProviderError> {
        let instruction = format!(
            "{}\nRespond with a single JSON object and nothing else.",
            request.instruction
        );

        let (content, _usage) = self
            .complete_text(
                &request.transcript,
                Some(&instruction),
                request.settings.max_tokens,
                request.settings.temperature,
            )
            .await?;

        parse_json_object(&content)
            .ok_or_else(|| self.invalid_response("extraction output is not a JSON object"))
    }
}

/// Parse the first JSON object out of a completion, tolerating code fences
/// and leading prose.
fn parse_json_object(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
        && value.is_object()
    {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &trimmed[start..=end];
    serde_json::from_str::<serde_json::Value>(candidate)
        .ok()
        .filter(|v| v.is_object())
}
