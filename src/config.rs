//! Configuration types.

use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Compliance gate settings.
    pub policy: PolicyConfig,
    /// Scheduler loop settings.
    pub scheduler: SchedulerConfig,
    /// Upper bound for a single provider call. A timeout is a provider
    /// error for the turn; retry is deferred to the next scheduler pass.
    pub provider_timeout: Duration,
    /// How many recent thread messages feed the provider request and the
    /// memory refresher.
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            scheduler: SchedulerConfig::default(),
            provider_timeout: Duration::from_secs(30),
            history_limit: 20,
        }
    }
}

/// Policy Gate configuration.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Minimum gap between two outbound messages to the same lead.
    pub outbound_cap: Duration,
    /// Start of the lead-local quiet window (hour, 0-23).
    pub quiet_start_hour: u32,
    /// End of the lead-local quiet window (hour, 0-23). The window may
    /// wrap midnight (start 21, end 8 blocks 21:00-08:00).
    pub quiet_end_hour: u32,
    /// Consecutive unanswered outbound messages before the stop rule fires.
    pub max_unanswered: usize,
    /// Post-generation confidence threshold. Drafts scored below this are
    /// blocked and the lead flagged for strategy review.
    pub min_confidence: f32,
    /// Denylist terms matched case-insensitively as whole words against
    /// generated drafts.
    pub denylist: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            outbound_cap: Duration::from_secs(24 * 60 * 60),
            quiet_start_hour: 21,
            quiet_end_hour: 8,
            max_unanswered: 5,
            min_confidence: 0.7,
            denylist: vec!["scam".into(), "spam".into(), "unsolicited".into()],
        }
    }
}

/// CRM scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Review loop tick interval (minutes-scale).
    pub review_interval: Duration,
    /// Due dispatcher tick interval (seconds-scale).
    pub dispatch_interval: Duration,
    /// A `next_followup_at` older than this is recomputed by the review loop.
    pub review_staleness: Duration,
    /// Maximum due leads processed per workspace per dispatch pass, so one
    /// tenant cannot starve others.
    pub dispatch_batch_per_workspace: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            review_interval: Duration::from_secs(5 * 60),
            dispatch_interval: Duration::from_secs(10),
            review_staleness: Duration::from_secs(24 * 60 * 60),
            dispatch_batch_per_workspace: 5,
        }
    }
}
