//! Memory Refresher — distills recent conversation into durable lead memory.
//!
//! Runs detached from the turn's critical path: the orchestrator schedules
//! a refresh after a successful send and never waits on it. Any failure
//! abandons the refresh without touching existing memory — at most one
//! summarization cycle is lost on shutdown, which is acceptable.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crm::{LeadMemory, MessageRole};
use crate::error::Error;
use crate::llm::{ChatMessage, ExtractionRequest, GenerationSettings, LlmProvider};
use crate::store::Database;

/// Structured output expected from the extraction call.
#[derive(Debug, Deserialize)]
struct MemoryExtraction {
    summary: String,
    #[serde(default)]
    facts: Vec<String>,
}

const EXTRACTION_INSTRUCTION: &str = "Distill this sales conversation into durable memory. \
     Return a JSON object with two keys: \"summary\" (exactly two sentences \
     describing where the conversation stands) and \"facts\" (a list of short \
     strings, each one concrete fact learned about the lead).";

/// Refreshes a lead's distilled memory after a turn completes.
pub struct MemoryRefresher {
    store: Arc<dyn Database>,
    provider: Arc<dyn LlmProvider>,
    /// How many recent messages feed one refresh.
    window: usize,
}

impl MemoryRefresher {
    pub fn new(store: Arc<dyn Database>, provider: Arc<dyn LlmProvider>, window: usize) -> Self {
        Self {
            store,
            provider,
            window,
        }
    }

    /// Fire-and-forget refresh. Errors are logged inside the task and never
    /// reach the caller — memory refresh must not block message delivery.
    pub fn spawn_refresh(self: &Arc<Self>, lead_id: Uuid) {
        let refresher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = refresher.refresh(lead_id).await {
                warn!(lead_id = %lead_id, error = %e, "Memory refresh abandoned");
            }
        });
    }

    /// Run one refresh synchronously. Exposed for tests and manual runs.
    pub async fn refresh(&self, lead_id: Uuid) -> Result<(), Error> {
        let messages = self.store.list_recent_messages(lead_id, self.window).await?;
        if messages.is_empty() {
            debug!(lead_id = %lead_id, "No thread history, skipping memory refresh");
            return Ok(());
        }

        let transcript: Vec<ChatMessage> = messages
            .iter()
            .map(|m| {
                let speaker = match m.role {
                    MessageRole::User => "Lead",
                    MessageRole::Model => "Agent",
                    MessageRole::Tool => "Tool",
                };
                ChatMessage::user(format!("{speaker}: {}", m.content))
            })
            .collect();

        let request = ExtractionRequest::new(
            transcript,
            EXTRACTION_INSTRUCTION,
            GenerationSettings {
                max_tokens: 512,
                temperature: 0.2,
            },
        )?;

        let value = self.provider.extract(request).await?;
        let extraction: MemoryExtraction =
            serde_json::from_value(value).map_err(|e| {
                crate::error::ProviderError::InvalidResponse {
                    provider: self.provider.model_name().to_string(),
                    reason: format!("memory extraction shape mismatch: {e}"),
                }
            })?;

        if extraction.summary.trim().is_empty() {
            return Err(crate::error::ProviderError::InvalidResponse {
                provider: self.provider.model_name().to_string(),
                reason: "memory extraction returned an empty summary".into(),
            }
            .into());
        }

        // Overwrite, never merge.
        let memory = LeadMemory {
            lead_id,
            summary: extraction.summary.trim().to_string(),
            facts: extraction
                .facts
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
            last_updated_at: Utc::now(),
        };
        self.store.put_lead_memory(&memory).await?;

        debug!(lead_id = %lead_id, facts = memory.facts.len(), "Lead memory refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::{Lead, Workspace};
    use crate::error::ProviderError;
    use crate::llm::{ChatRequest, ChatResponse};
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Provider double returning canned extraction values.
    struct ScriptedExtractor {
        results: Mutex<Vec<Result<serde_json::Value, ProviderError>>>,
    }

    impl ScriptedExtractor {
        fn new(results: Vec<Result<serde_json::Value, ProviderError>>) -> Self {
            Self {
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedExtractor {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            unreachable!("refresher never chats")
        }

        async fn extract(
            &self,
            _request: ExtractionRequest,
        ) -> Result<serde_json::Value, ProviderError> {
            self.results.lock().unwrap().remove(0)
        }
    }

    async fn seeded_store() -> (Arc<LibSqlBackend>, Uuid) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let workspace = Workspace::new("Acme", "agent-1");
        store.upsert_workspace(&workspace).await.unwrap();
        let lead = Lead::new(workspace.id, "Ada", "UTC");
        store.insert_lead(&lead).await.unwrap();
        store
            .record_inbound(workspace.id, lead.id, "I might be interested")
            .await
            .unwrap();
        (store, lead.id)
    }

    #[tokio::test]
    async fn refresh_overwrites_memory() {
        let (store, lead_id) = seeded_store().await;
        store
            .put_lead_memory(&LeadMemory {
                lead_id,
                summary: "Old summary.".into(),
                facts: vec!["old fact".into()],
                last_updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let provider = Arc::new(ScriptedExtractor::new(vec![Ok(serde_json::json!({
            "summary": "Lead is warming up. Wants pricing next week.",
            "facts": ["asked about pricing", " "]
        }))]));
        let refresher = MemoryRefresher::new(store.clone(), provider, 20);

        refresher.refresh(lead_id).await.unwrap();

        let memory = store.get_lead_memory(lead_id).await.unwrap().unwrap();
        assert!(memory.summary.starts_with("Lead is warming up"));
        // Blank facts are dropped, old facts are gone.
        assert_eq!(memory.facts, vec!["asked about pricing".to_string()]);
    }

    #[tokio::test]
    async fn failed_extraction_leaves_memory_untouched() {
        let (store, lead_id) = seeded_store().await;
        let existing = LeadMemory {
            lead_id,
            summary: "Existing summary.".into(),
            facts: vec![],
            last_updated_at: Utc::now(),
        };
        store.put_lead_memory(&existing).await.unwrap();

        let provider = Arc::new(ScriptedExtractor::new(vec![Err(
            ProviderError::RequestFailed {
                provider: "scripted".into(),
                reason: "transport down".into(),
            },
        )]));
        let refresher = MemoryRefresher::new(store.clone(), provider, 20);

        assert!(refresher.refresh(lead_id).await.is_err());

        let memory = store.get_lead_memory(lead_id).await.unwrap().unwrap();
        assert_eq!(memory.summary, "Existing summary.");
    }

    #[tokio::test]
    async fn malformed_shape_is_an_error() {
        let (store, lead_id) = seeded_store().await;

        let provider = Arc::new(ScriptedExtractor::new(vec![Ok(serde_json::json!({
            "wrong_key": "nope"
        }))]));
        let refresher = MemoryRefresher::new(store.clone(), provider, 20);

        assert!(refresher.refresh(lead_id).await.is_err());
        assert!(store.get_lead_memory(lead_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_summary_is_an_error() {
        let (store, lead_id) = seeded_store().await;

        let provider = Arc::new(ScriptedExtractor::new(vec![Ok(serde_json::json!({
            "summary": "   ",
            "facts": []
        }))]));
        let refresher = MemoryRefresher::new(store.clone(), provider, 20);

        assert!(refresher.refresh(lead_id).await.is_err());
    }

    #[tokio::test]
    async fn empty_thread_skips_without_error() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let workspace = Workspace::new("Acme", "agent-1");
        store.upsert_workspace(&workspace).await.unwrap();
        let lead = Lead::new(workspace.id, "Ada", "UTC");
        store.insert_lead(&lead).await.unwrap();

        let provider = Arc::new(ScriptedExtractor::new(vec![]));
        let refresher = MemoryRefresher::new(store.clone(), provider, 20);

        refresher.refresh(lead.id).await.unwrap();
        assert!(store.get_lead_memory(lead.id).await.unwrap().is_none());
    }
}
