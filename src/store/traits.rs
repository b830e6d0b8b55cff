//! Unified `Database` trait — single async interface for all persistence.
//!
//! Every operation is scoped by tenant (workspace id) where it touches
//! tenant-owned rows. The trait is intentionally narrow: the engine needs
//! reads for the gate and assembler, the two transactional thread writes,
//! and the scheduler's timestamp bookkeeping — nothing else.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::crm::{Lead, LeadMemory, LeadTag, PolicyDecision, StrategyVersion, ThreadMessage, Workspace};
use crate::error::DatabaseError;

/// Backend-agnostic database trait covering leads, threads, strategies,
/// memory, and the policy audit trail.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Workspaces ──────────────────────────────────────────────────

    /// Insert or replace a workspace.
    async fn upsert_workspace(&self, workspace: &Workspace) -> Result<(), DatabaseError>;

    /// Get a workspace by ID.
    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, DatabaseError>;

    // ── Strategies ──────────────────────────────────────────────────

    /// Insert or replace a strategy version.
    async fn upsert_strategy(&self, strategy: &StrategyVersion) -> Result<(), DatabaseError>;

    /// Get the single Active strategy for a workspace, if any.
    async fn get_active_strategy(
        &self,
        workspace_id: Uuid,
    ) -> Result<Option<StrategyVersion>, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert a new lead.
    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    /// Get a lead by ID within a workspace.
    async fn get_lead(
        &self,
        workspace_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<Lead>, DatabaseError>;

    /// Attach a tag to a lead (idempotent).
    async fn add_lead_tag(
        &self,
        workspace_id: Uuid,
        lead_id: Uuid,
        tag: LeadTag,
    ) -> Result<(), DatabaseError>;

    /// Set or clear a lead's scheduled next-contact timestamp.
    async fn set_next_followup(
        &self,
        workspace_id: Uuid,
        lead_id: Uuid,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Leads in a non-terminal stage whose `next_followup_at` is unset or
    /// older than `stale_before` — the review loop's work list.
    async fn list_review_candidates(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Lead>, DatabaseError>;

    /// Leads in a non-terminal stage whose `next_followup_at` has passed,
    /// oldest due first.
    async fn list_due_leads(&self, now: DateTime<Utc>) -> Result<Vec<Lead>, DatabaseError>;

    // ── Conversation threads ────────────────────────────────────────

    /// Append an inbound user message and stamp `last_inbound_at`, in one
    /// transaction. Called by the external inbound-message handler.
    async fn record_inbound(
        &self,
        workspace_id: Uuid,
        lead_id: Uuid,
        content: &str,
    ) -> Result<(), DatabaseError>;

    /// The most recent `limit` thread messages, returned oldest-first.
    async fn list_recent_messages(
        &self,
        lead_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ThreadMessage>, DatabaseError>;

    /// Persist a completed outbound turn in one transaction: append the
    /// model message, stamp `last_followup_at`, and advance the stage along
    /// the single New → Contacted edge. All-or-nothing.
    async fn persist_outbound_turn(
        &self,
        workspace_id: Uuid,
        lead_id: Uuid,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Lead memory ─────────────────────────────────────────────────

    /// Get a lead's distilled memory, if it has been refreshed at least once.
    async fn get_lead_memory(&self, lead_id: Uuid) -> Result<Option<LeadMemory>, DatabaseError>;

    /// Overwrite a lead's memory (created lazily on first refresh).
    async fn put_lead_memory(&self, memory: &LeadMemory) -> Result<(), DatabaseError>;

    // ── Policy audit trail ──────────────────────────────────────────

    /// Append one immutable gate-evaluation record.
    async fn append_policy_decision(&self, decision: &PolicyDecision)
        -> Result<(), DatabaseError>;

    /// All decisions for a lead, oldest first.
    async fn list_policy_decisions(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<PolicyDecision>, DatabaseError>;
}
