//! CRM domain model — leads, workspaces, strategies, memory, audit records.

pub mod model;

pub use model::{
    BudgetTier, DecisionOutcome, DecisionPoint, FollowupPreset, Lead, LeadMemory, LeadStage,
    LeadTag, MessageRole, PolicyDecision, ReasonCode, StrategyStatus, StrategyVersion,
    ThreadMessage, Workspace,
};
