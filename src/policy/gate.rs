//! Compliance rule evaluation.
//!
//! Checks run in a fixed order over an immutable `TurnSnapshot`; the first
//! blocking rule wins and evaluation stops. Non-compliance is a normal
//! outcome, never an error — the gate only fails upstream, when the
//! snapshot cannot be built because required records are missing.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use regex::Regex;
use tracing::warn;

use crate::config::PolicyConfig;
use crate::crm::{DecisionOutcome, Lead, LeadStage, MessageRole, ReasonCode, ThreadMessage, Workspace};

/// Immutable view of everything the gate needs for one evaluation.
#[derive(Debug, Clone)]
pub struct TurnSnapshot {
    pub lead: Lead,
    pub workspace: Workspace,
    /// Recent thread tail, oldest first.
    pub recent_messages: Vec<ThreadMessage>,
    /// The evaluation instant. Injected so checks stay pure.
    pub now: DateTime<Utc>,
}

impl TurnSnapshot {
    /// Lead-local hour and weekday. An unparseable timezone falls back to
    /// UTC — availability over precision for a non-safety check.
    fn local_clock(&self) -> (u32, Weekday) {
        match self.lead.timezone.parse::<Tz>() {
            Ok(tz) => {
                let local = self.now.with_timezone(&tz);
                (local.hour(), local.weekday())
            }
            Err(_) => {
                warn!(
                    lead_id = %self.lead.id,
                    timezone = %self.lead.timezone,
                    "Unparseable lead timezone, falling back to UTC"
                );
                (self.now.hour(), self.now.weekday())
            }
        }
    }

    /// Consecutive outbound messages at the end of the thread with no
    /// inbound reply since.
    pub fn consecutive_unanswered(&self) -> usize {
        self.recent_messages
            .iter()
            .rev()
            .take_while(|m| m.role != MessageRole::User)
            .filter(|m| m.role == MessageRole::Model)
            .count()
    }
}

/// Result of one gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub outcome: DecisionOutcome,
    pub reason: ReasonCode,
}

impl GateDecision {
    pub fn is_block(&self) -> bool {
        self.outcome == DecisionOutcome::Block
    }

    fn pass() -> Self {
        Self {
            outcome: DecisionOutcome::Pass,
            reason: ReasonCode::AllChecksPassed,
        }
    }

    fn block(reason: ReasonCode) -> Self {
        Self {
            outcome: DecisionOutcome::Block,
            reason,
        }
    }
}

/// A single pre-send rule: reason code plus a pure blocking predicate.
struct PreSendRule {
    code: ReasonCode,
    blocks: fn(&TurnSnapshot, &PolicyConfig) -> bool,
}

fn blocks_opt_out(snapshot: &TurnSnapshot, _config: &PolicyConfig) -> bool {
    snapshot.lead.opted_out || snapshot.lead.stage == LeadStage::Suppressed
}

fn blocks_takeover(snapshot: &TurnSnapshot, _config: &PolicyConfig) -> bool {
    snapshot.lead.stage == LeadStage::TakeOver
}

fn blocks_outbound_cap(snapshot: &TurnSnapshot, config: &PolicyConfig) -> bool {
    let cap = chrono::Duration::from_std(config.outbound_cap)
        .unwrap_or_else(|_| chrono::Duration::hours(24));
    match snapshot.lead.last_followup_at {
        Some(last) => snapshot.now - last < cap,
        None => false,
    }
}

fn blocks_quiet_hours(snapshot: &TurnSnapshot, config: &PolicyConfig) -> bool {
    let (hour, _) = snapshot.local_clock();
    in_quiet_window(hour, config.quiet_start_hour, config.quiet_end_hour)
}

fn blocks_sunday_hold(snapshot: &TurnSnapshot, _config: &PolicyConfig) -> bool {
    if !snapshot.workspace.sunday_hold {
        return false;
    }
    let (_, weekday) = snapshot.local_clock();
    weekday == Weekday::Sun
}

fn blocks_stop_rule(snapshot: &TurnSnapshot, config: &PolicyConfig) -> bool {
    snapshot.consecutive_unanswered() >= config.max_unanswered
}

/// Whether `hour` falls inside the [start, end) window; the window may wrap
/// midnight. Equal bounds disable the window.
fn in_quiet_window(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        false
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// The compliance gate. Construct once and share.
pub struct PolicyGate {
    config: PolicyConfig,
    pre_send_rules: Vec<PreSendRule>,
    denylist: Vec<Regex>,
}

impl PolicyGate {
    pub fn new(config: PolicyConfig) -> Self {
        let denylist = config
            .denylist
            .iter()
            .filter_map(|term| {
                match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(term = %term, "Invalid denylist term: {e}");
                        None
                    }
                }
            })
            .collect();

        // Evaluation order is part of the compliance contract: the first
        // failing check is the one recorded.
        let pre_send_rules = vec![
            PreSendRule {
                code: ReasonCode::OptOutSuppression,
                blocks: blocks_opt_out,
            },
            PreSendRule {
                code: ReasonCode::HumanTakeoverActive,
                blocks: blocks_takeover,
            },
            PreSendRule {
                code: ReasonCode::OutboundCap24h,
                blocks: blocks_outbound_cap,
            },
            PreSendRule {
                code: ReasonCode::QuietHoursActive,
                blocks: blocks_quiet_hours,
            },
            PreSendRule {
                code: ReasonCode::SundayHold,
                blocks: blocks_sunday_hold,
            },
            PreSendRule {
                code: ReasonCode::StopRuleMaxUnanswered,
                blocks: blocks_stop_rule,
            },
        ];

        Self {
            config,
            pre_send_rules,
            denylist,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// May the engine contact this lead at all?
    pub fn evaluate_pre_send(&self, snapshot: &TurnSnapshot) -> GateDecision {
        for rule in &self.pre_send_rules {
            if (rule.blocks)(snapshot, &self.config) {
                return GateDecision::block(rule.code);
            }
        }
        GateDecision::pass()
    }

    /// May this generated draft be delivered? `confidence` is a pluggable
    /// input (provider-reported or caller-derived); a missing score passes
    /// the confidence check.
    pub fn evaluate_post_gen(&self, draft: &str, confidence: Option<f32>) -> GateDecision {
        if let Some(score) = confidence
            && score < self.config.min_confidence
        {
            return GateDecision::block(ReasonCode::LowConfidenceBlock);
        }

        if self.denylist.iter().any(|re| re.is_match(draft)) {
            return GateDecision::block(ReasonCode::RiskyContentBlock);
        }

        GateDecision::pass()
    }
}
