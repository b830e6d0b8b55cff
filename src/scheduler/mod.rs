//! CRM Scheduler — follow-up planning and due-lead dispatch.
//!
//! Two independent long-lived loops share the store but no in-memory state:
//! - `review` — computes `next_followup_at` for leads (minutes-scale tick)
//! - `dispatch` — runs turns for due leads (seconds-scale tick)

pub mod dispatch;
pub mod review;
pub mod state;

pub use dispatch::DueDispatcher;
pub use review::ReviewLoop;
pub use state::{SchedulerState, SchedulerStatus};
