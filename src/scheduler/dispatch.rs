//! Due Dispatcher — executes turns for leads whose follow-up time has passed.
//!
//! Each pass: select due leads, interleave them fairly across workspaces
//! with a bounded per-workspace batch, clear their `next_followup_at`
//! *before* invoking the turn (so a back-to-back pass cannot re-select
//! them), then run the turns concurrently. Leads are independent; one
//! failure or block never aborts the rest of the pass.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::crm::Lead;
use crate::orchestrator::{TurnOrchestrator, TurnOutcome};
use crate::scheduler::state::SchedulerState;
use crate::store::Database;

/// Dispatches due leads on a seconds-scale tick.
pub struct DueDispatcher {
    store: Arc<dyn Database>,
    orchestrator: Arc<TurnOrchestrator>,
    config: SchedulerConfig,
    state: Arc<SchedulerState>,
}

impl DueDispatcher {
    pub fn new(
        store: Arc<dyn Database>,
        orchestrator: Arc<TurnOrchestrator>,
        config: SchedulerConfig,
        state: Arc<SchedulerState>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            config,
            state,
        }
    }

    /// One dispatch pass. Returns how many turns were attempted.
    pub async fn run_once(&self, now: DateTime<Utc>) -> usize {
        self.state.record_dispatch_pass();

        let due = match self.store.list_due_leads(now).await {
            Ok(leads) => leads,
            Err(e) => {
                error!(error = %e, "Dispatch pass failed to list due leads");
                return 0;
            }
        };
        if due.is_empty() {
            return 0;
        }

        let picked = fair_batch(due, self.config.dispatch_batch_per_workspace);

        // Clear the schedule first: whatever the turn outcome, the same
        // lead must not be re-selected by a concurrent or back-to-back
        // pass. The review loop plans the next contact.
        let mut claimed: Vec<Lead> = Vec::with_capacity(picked.len());
        for lead in picked {
            match self
                .store
                .set_next_followup(lead.workspace_id, lead.id, None)
                .await
            {
                Ok(()) => claimed.push(lead),
                Err(e) => {
                    warn!(lead_id = %lead.id, error = %e, "Failed to claim due lead, skipping");
                }
            }
        }

        let turns = claimed.iter().map(|lead| {
            let orchestrator = Arc::clone(&self.orchestrator);
            let state = Arc::clone(&self.state);
            async move {
                state.record_turn_dispatched();
                match orchestrator
                    .run_turn(lead.id, lead.workspace_id, None)
                    .await
                {
                    Ok(TurnOutcome::Sent { .. }) => {
                        state.record_turn_sent();
                        debug!(lead_id = %lead.id, "Dispatched turn sent");
                    }
                    Ok(TurnOutcome::Blocked { reason }) => {
                        state.record_turn_blocked();
                        debug!(lead_id = %lead.id, reason = reason.as_str(), "Dispatched turn blocked");
                    }
                    Ok(TurnOutcome::ProviderError { detail }) => {
                        state.record_turn_failed();
                        warn!(lead_id = %lead.id, detail = %detail, "Dispatched turn hit provider error");
                    }
                    Err(e) => {
                        state.record_turn_failed();
                        error!(lead_id = %lead.id, error = %e, "Dispatched turn failed");
                    }
                }
            }
        });
        let attempted = claimed.len();
        join_all(turns).await;

        info!(attempted, "Dispatch pass complete");
        attempted
    }

    /// Run forever on the configured tick. Per-iteration errors are caught
    /// inside `run_once`; the loop itself never exits.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.dispatch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once(Utc::now()).await;
        }
    }
}

/// Interleave due leads round-robin across workspaces, at most
/// `per_workspace` from each, so one tenant cannot starve others.
fn fair_batch(due: Vec<Lead>, per_workspace: usize) -> Vec<Lead> {
    let mut groups: Vec<(Uuid, VecDeque<Lead>)> = Vec::new();
    for lead in due {
        match groups.iter_mut().find(|(ws, _)| *ws == lead.workspace_id) {
            Some((_, queue)) => queue.push_back(lead),
            None => {
                let mut queue = VecDeque::new();
                let ws = lead.workspace_id;
                queue.push_back(lead);
                groups.push((ws, queue));
            }
        }
    }

    let mut picked = Vec::new();
    for _round in 0..per_workspace {
        let mut any = false;
        for (_, queue) in &mut groups {
            if let Some(lead) = queue.pop_front() {
                picked.push(lead);
                any = true;
            }
        }
        if !any {
            break;
        }
    }
    picked
}
