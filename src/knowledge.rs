//! Read-only knowledge store interface.
//!
//! Documents are always scoped by (workspace, agent); the assembler never
//! sees cross-tenant material. Ranking happens in the assembler — the store
//! returns candidates in retrieval order.

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DatabaseError;

/// A knowledge document candidate for prompt packing.
#[derive(Debug, Clone)]
pub struct KnowledgeDoc {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub agent_id: String,
    pub title: String,
    pub content: String,
}

/// Read-only lookup of knowledge documents.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Candidate documents for an agent within a tenant, in retrieval order.
    async fn lookup(
        &self,
        workspace_id: Uuid,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeDoc>, DatabaseError>;
}

/// In-memory knowledge store. Preserves insertion order as retrieval order.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    docs: RwLock<Vec<KnowledgeDoc>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, doc: KnowledgeDoc) {
        self.docs.write().await.push(doc);
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn lookup(
        &self,
        workspace_id: Uuid,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeDoc>, DatabaseError> {
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|d| d.workspace_id == workspace_id && d.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
