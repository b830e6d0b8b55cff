//! Core CRM entities and their lifecycle enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle stage of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStage {
    /// Never contacted.
    New,
    /// At least one outbound message sent.
    Contacted,
    /// The lead has replied at least once.
    Engaged,
    /// Opted out or suppressed by an operator; never contacted again.
    Suppressed,
    /// A human owns the conversation; the engine stays out.
    TakeOver,
    ClosedWon,
    ClosedLost,
}

impl LeadStage {
    /// Stages the scheduler never plans follow-ups for.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Suppressed | Self::TakeOver | Self::ClosedWon | Self::ClosedLost
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Engaged => "engaged",
            Self::Suppressed => "suppressed",
            Self::TakeOver => "take_over",
            Self::ClosedWon => "closed_won",
            Self::ClosedLost => "closed_lost",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "contacted" => Self::Contacted,
            "engaged" => Self::Engaged,
            "suppressed" => Self::Suppressed,
            "take_over" => Self::TakeOver,
            "closed_won" => Self::ClosedWon,
            "closed_lost" => Self::ClosedLost,
            _ => Self::New,
        }
    }
}

impl std::fmt::Display for LeadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operational tags attached to a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadTag {
    /// A post-generation block flagged this lead for human strategy review.
    StrategyReviewRequired,
    /// The channel reported the lead as unreachable.
    Disconnect,
}

/// A lead owned by a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub display_name: String,
    pub stage: LeadStage,
    pub tags: Vec<LeadTag>,
    pub opted_out: bool,
    /// IANA timezone name (e.g. "America/Chicago") used for quiet-hours
    /// and Sunday-hold checks. Unparseable values fall back to UTC.
    pub timezone: String,
    pub last_followup_at: Option<DateTime<Utc>>,
    pub next_followup_at: Option<DateTime<Utc>>,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Create a fresh lead in the New stage.
    pub fn new(workspace_id: Uuid, display_name: impl Into<String>, timezone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            display_name: display_name.into(),
            stage: LeadStage::New,
            tags: Vec::new(),
            opted_out: false,
            timezone: timezone.into(),
            last_followup_at: None,
            next_followup_at: None,
            last_inbound_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A lead is engaged when it replied after our last outbound message
    /// (or replied at all before we ever sent one).
    pub fn is_engaged(&self) -> bool {
        match (self.last_inbound_at, self.last_followup_at) {
            (Some(inbound), Some(outbound)) => inbound > outbound,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn has_tag(&self, tag: LeadTag) -> bool {
        self.tags.contains(&tag)
    }
}

/// Budget tier governing prompt size and model cost for a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    Green,
    Yellow,
    Red,
}

impl BudgetTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Red => "red",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "yellow" => Self::Yellow,
            "red" => Self::Red,
            _ => Self::Green,
        }
    }
}

/// Follow-up cadence preset for a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowupPreset {
    Gentle,
    Balanced,
    Aggressive,
}

impl FollowupPreset {
    /// Base follow-up interval in hours; halved for engaged leads.
    pub fn base_hours(&self) -> i64 {
        match self {
            Self::Gentle => 72,
            Self::Balanced => 48,
            Self::Aggressive => 24,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gentle => "gentle",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "gentle" => Self::Gentle,
            "aggressive" => Self::Aggressive,
            _ => Self::Balanced,
        }
    }
}

/// A tenant workspace owning leads, a strategy, and a budget tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub budget_tier: BudgetTier,
    pub followup_preset: FollowupPreset,
    /// Whether this workspace enforces a no-contact policy on Sundays.
    pub sunday_hold: bool,
    /// Scoping key for knowledge retrieval.
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            budget_tier: BudgetTier::Green,
            followup_preset: FollowupPreset::Balanced,
            sunday_hold: false,
            agent_id: agent_id.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Publication status of a strategy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Active,
    Draft,
    RolledBack,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Draft => "draft",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "rolled_back" => Self::RolledBack,
            _ => Self::Draft,
        }
    }
}

/// Versioned, tenant-authored prompt policy.
///
/// At most one Active version exists per workspace; the strategy-management
/// service enforces that invariant at write time — this crate only reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyVersion {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub version: i64,
    pub status: StrategyStatus,
    pub tone: String,
    pub objectives: String,
    pub objection_handling: String,
    pub call_to_action: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable distilled memory for a lead. Overwritten, never merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadMemory {
    pub lead_id: Uuid,
    pub summary: String,
    pub facts: Vec<String>,
    pub last_updated_at: DateTime<Utc>,
}

/// Where in the turn a policy evaluation happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPoint {
    PreSend,
    PostGen,
}

impl DecisionPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreSend => "pre_send",
            Self::PostGen => "post_gen",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "post_gen" => Self::PostGen,
            _ => Self::PreSend,
        }
    }
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Pass,
    Block,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "block" => Self::Block,
            _ => Self::Pass,
        }
    }
}

/// Reason codes emitted by the Policy Gate, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    OptOutSuppression,
    HumanTakeoverActive,
    OutboundCap24h,
    QuietHoursActive,
    SundayHold,
    StopRuleMaxUnanswered,
    AllChecksPassed,
    LowConfidenceBlock,
    RiskyContentBlock,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptOutSuppression => "OPT_OUT_SUPPRESSION",
            Self::HumanTakeoverActive => "HUMAN_TAKEOVER_ACTIVE",
            Self::OutboundCap24h => "OUTBOUND_CAP_24H",
            Self::QuietHoursActive => "QUIET_HOURS_ACTIVE",
            Self::SundayHold => "SUNDAY_HOLD",
            Self::StopRuleMaxUnanswered => "STOP_RULE_MAX_UNANSWERED",
            Self::AllChecksPassed => "ALL_CHECKS_PASSED",
            Self::LowConfidenceBlock => "LOW_CONFIDENCE_BLOCK",
            Self::RiskyContentBlock => "RISKY_CONTENT_BLOCK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "OPT_OUT_SUPPRESSION" => Self::OptOutSuppression,
            "HUMAN_TAKEOVER_ACTIVE" => Self::HumanTakeoverActive,
            "OUTBOUND_CAP_24H" => Self::OutboundCap24h,
            "QUIET_HOURS_ACTIVE" => Self::QuietHoursActive,
            "SUNDAY_HOLD" => Self::SundayHold,
            "STOP_RULE_MAX_UNANSWERED" => Self::StopRuleMaxUnanswered,
            "ALL_CHECKS_PASSED" => Self::AllChecksPassed,
            "LOW_CONFIDENCE_BLOCK" => Self::LowConfidenceBlock,
            "RISKY_CONTENT_BLOCK" => Self::RiskyContentBlock,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable audit record of one gate evaluation. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub workspace_id: Uuid,
    pub point: DecisionPoint,
    pub outcome: DecisionOutcome,
    pub reason: ReasonCode,
    /// The rejected draft, attached to post-generation blocks for review.
    pub draft: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PolicyDecision {
    pub fn pre_send(
        lead_id: Uuid,
        workspace_id: Uuid,
        outcome: DecisionOutcome,
        reason: ReasonCode,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            workspace_id,
            point: DecisionPoint::PreSend,
            outcome,
            reason,
            draft: None,
            created_at: Utc::now(),
        }
    }

    pub fn post_gen(
        lead_id: Uuid,
        workspace_id: Uuid,
        outcome: DecisionOutcome,
        reason: ReasonCode,
        draft: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            workspace_id,
            point: DecisionPoint::PostGen,
            outcome,
            reason,
            draft,
            created_at: Utc::now(),
        }
    }
}

/// Author of a thread message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Model,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "model" => Self::Model,
            "tool" => Self::Tool,
            _ => Self::User,
        }
    }
}

/// One message in a lead's conversation thread. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ThreadMessage {
    pub fn new(lead_id: Uuid, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}
