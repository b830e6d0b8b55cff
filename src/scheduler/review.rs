//! Review Loop — plans next-contact times for leads.
//!
//! For every lead in a non-terminal stage whose `next_followup_at` is unset
//! or stale, writes `next_followup_at = now + interval`. Writing that
//! timestamp is the loop's only side effect; it never contacts leads.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::crm::{FollowupPreset, Workspace};
use crate::scheduler::state::SchedulerState;
use crate::store::Database;

/// Plans follow-up timestamps on a minutes-scale tick.
pub struct ReviewLoop {
    store: Arc<dyn Database>,
    config: SchedulerConfig,
    state: Arc<SchedulerState>,
}

impl ReviewLoop {
    pub fn new(
        store: Arc<dyn Database>,
        config: SchedulerConfig,
        state: Arc<SchedulerState>,
    ) -> Self {
        Self {
            store,
            config,
            state,
        }
    }

    /// Follow-up interval for a workspace preset, halved for engaged leads.
    pub fn interval_for(preset: FollowupPreset, engaged: bool) -> Duration {
        let hours = preset.base_hours();
        Duration::hours(if engaged { hours / 2 } else { hours })
    }

    /// One review pass. Per-lead failures are logged and skipped; a single
    /// lead must never stop the pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> usize {
        let stale_before = now
            - Duration::from_std(self.config.review_staleness)
                .unwrap_or_else(|_| Duration::hours(24));

        let candidates = match self.store.list_review_candidates(stale_before).await {
            Ok(leads) => leads,
            Err(e) => {
                error!(error = %e, "Review pass failed to list candidates");
                return 0;
            }
        };

        let mut workspaces: HashMap<Uuid, Workspace> = HashMap::new();
        let mut scheduled = 0;

        for lead in candidates {
            let workspace = match workspaces.get(&lead.workspace_id) {
                Some(ws) => ws.clone(),
                None => match self.store.get_workspace(lead.workspace_id).await {
                    Ok(Some(ws)) => {
                        workspaces.insert(lead.workspace_id, ws.clone());
                        ws
                    }
                    Ok(None) => {
                        error!(
                            lead_id = %lead.id,
                            workspace_id = %lead.workspace_id,
                            "Lead references a missing workspace, skipping"
                        );
                        continue;
                    }
                    Err(e) => {
                        warn!(lead_id = %lead.id, error = %e, "Workspace load failed, skipping lead");
                        continue;
                    }
                },
            };

            let interval = Self::interval_for(workspace.followup_preset, lead.is_engaged());
            let next = now + interval;
            match self
                .store
                .set_next_followup(lead.workspace_id, lead.id, Some(next))
                .await
            {
                Ok(()) => {
                    scheduled += 1;
                    debug!(lead_id = %lead.id, next = %next, "Follow-up scheduled");
                }
                Err(e) => {
                    warn!(lead_id = %lead.id, error = %e, "Failed to schedule follow-up");
                }
            }
        }

        self.state.record_review_pass(scheduled);
        if scheduled > 0 {
            info!(scheduled, "Review pass complete");
        }
        scheduled
    }

    /// Run forever on the configured tick. Every iteration error is caught
    /// inside `run_once`; the loop itself never exits.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.review_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once(Utc::now()).await;
        }
    }
}
