//! Warm restart reconciliation state machine
//!
//! ```text
//! NotApplicable                                  (cold start)
//! WarmInProgress ──open_window──▶ ReconcileWindowOpen ──complete──▶ Complete
//! ```
//!
//! The reconciler holds the snapshot of records read back from the store at
//! warm start and the reconcile deadline. At the deadline it decides which
//! buffered deltas actually differ from what the store already holds.

use crate::types::{FieldValues, Operation, PublishedEntry, RestartState, TableKey};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records loaded from the store at warm start.
    pub restored: usize,
    /// Restored records the kernel no longer has.
    pub stale: usize,
    /// Buffered deltas dropped because the store already matched.
    pub suppressed: usize,
    /// Deltas written at the end of the window.
    pub flushed: usize,
}

/// Restart lifecycle and the data it needs.
#[derive(Debug)]
pub struct Reconciler {
    state: RestartState,
    snapshot: HashMap<TableKey, FieldValues>,
    restored: usize,
    deadline: Option<Instant>,
}

impl Reconciler {
    /// Reconciler for a cold start; nothing is ever buffered.
    pub fn cold() -> Self {
        Self {
            state: RestartState::NotApplicable,
            snapshot: HashMap::new(),
            restored: 0,
            deadline: None,
        }
    }

    /// Reconciler for a warm start holding the records read back from the
    /// store.
    pub fn warm(snapshot: HashMap<TableKey, FieldValues>) -> Self {
        let restored = snapshot.len();
        info!(restored, "Warm start: snapshot loaded");
        Self {
            state: RestartState::WarmInProgress,
            snapshot,
            restored,
            deadline: None,
        }
    }

    pub fn state(&self) -> RestartState {
        self.state
    }

    /// Reconcile deadline; only set while the window is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn snapshot(&self) -> &HashMap<TableKey, FieldValues> {
        &self.snapshot
    }

    fn advance(&mut self, next: RestartState) -> bool {
        if !self.state.can_advance_to(next) {
            error!(from = %self.state, to = %next, "Illegal restart state transition ignored");
            return false;
        }
        debug!(from = %self.state, to = %next, "Restart state transition");
        self.state = next;
        true
    }

    /// Kernel state is restored: arm the deadline `timer` from `now`.
    pub fn open_window(&mut self, now: Instant, timer: Duration) -> bool {
        if !self.advance(RestartState::ReconcileWindowOpen) {
            return false;
        }
        self.deadline = Some(now + timer);
        info!(timer_secs = timer.as_secs(), "Reconcile window open");
        true
    }

    /// True once the open window's deadline has passed.
    pub fn is_due(&self, now: Instant) -> bool {
        self.state == RestartState::ReconcileWindowOpen
            && self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Drop buffered deltas that would not change the store.
    ///
    /// A SET whose fields equal the snapshot record and a DEL for a key the
    /// snapshot never held are suppressed. Returns the kept entries and the
    /// number suppressed.
    pub fn filter(&self, buffered: Vec<PublishedEntry>) -> (Vec<PublishedEntry>, usize) {
        let total = buffered.len();
        let kept: Vec<PublishedEntry> = buffered
            .into_iter()
            .filter(|entry| match entry.op {
                Operation::Set => self.snapshot.get(&entry.key) != Some(&entry.fields),
                Operation::Del => self.snapshot.contains_key(&entry.key),
            })
            .collect();
        let suppressed = total - kept.len();
        (kept, suppressed)
    }

    /// Close the window. The snapshot is released.
    pub fn complete(&mut self) -> bool {
        if !self.advance(RestartState::Complete) {
            return false;
        }
        self.deadline = None;
        self.snapshot = HashMap::new();
        true
    }

    pub fn restored(&self) -> usize {
        self.restored
    }
}
