//! Injectable scheduler state — explicit counters, no ambient globals.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters for both scheduler loops. Passed explicitly into loop
/// iterations and exposed read-only via [`SchedulerStatus`].
#[derive(Debug, Default)]
pub struct SchedulerState {
    review_passes: AtomicU64,
    followups_scheduled: AtomicU64,
    dispatch_passes: AtomicU64,
    turns_dispatched: AtomicU64,
    turns_sent: AtomicU64,
    turns_blocked: AtomicU64,
    turns_failed: AtomicU64,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_review_pass(&self, scheduled: usize) {
        self.review_passes.fetch_add(1, Ordering::Relaxed);
        self.followups_scheduled
            .fetch_add(scheduled as u64, Ordering::Relaxed);
    }

    pub fn record_dispatch_pass(&self) {
        self.dispatch_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_turn_dispatched(&self) {
        self.turns_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_turn_sent(&self) {
        self.turns_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_turn_blocked(&self) {
        self.turns_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_turn_failed(&self) {
        self.turns_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Read-only snapshot for status/metrics consumers.
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            review_passes: self.review_passes.load(Ordering::Relaxed),
            followups_scheduled: self.followups_scheduled.load(Ordering::Relaxed),
            dispatch_passes: self.dispatch_passes.load(Ordering::Relaxed),
            turns_dispatched: self.turns_dispatched.load(Ordering::Relaxed),
            turns_sent: self.turns_sent.load(Ordering::Relaxed),
            turns_blocked: self.turns_blocked.load(Ordering::Relaxed),
            turns_failed: self.turns_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of scheduler activity.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub review_passes: u64,
    pub followups_scheduled: u64,
    pub dispatch_passes: u64,
    pub turns_dispatched: u64,
    pub turns_sent: u64,
    pub turns_blocked: u64,
    pub turns_failed: u64,
}
