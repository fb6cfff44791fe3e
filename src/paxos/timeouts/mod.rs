//! Cancellable, prioritized dispatcher timers (section 5, "Cancellation
//! and timeouts").
//!
//! The teacher crate declares a `timeouts` module (`bft::timeouts::{Timeouts,
//! TimeoutKind}`, used from its bundled examples to drive a CST retry) whose
//! source was not available to build against; this module is grounded on
//! that usage (a handle that schedules a `TimeoutKind` after a `Duration`
//! and is polled for expiry) plus section 5's priority-replacement rule,
//! which the teacher's usage does not show.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::paxos::communication::NodeId;
use crate::paxos::ordering::InstanceId;

/// What a fired timeout is about. One dispatcher task (`CheckCatchupTask`,
/// the proposer's prepare timeout, a leader-liveness check, ...) per
/// variant; `Custom` covers anything this crate's consumers need to
/// schedule that the core protocol does not name.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TimeoutKind {
    /// Re-arm catch-up for a peer, after `DoCatchUpTask`'s resend
    /// timeout elapses without a response.
    CatchUp(NodeId),
    /// The periodic out-of-window check (`CheckCatchupTask`).
    CheckCatchup,
    /// The proposer's PREPARING attempt has run long enough to give up.
    PrepareTimeout(InstanceId),
    /// No `Alive` message from the leader within `FDSuspectTimeout`.
    LeaderSuspect,
    /// No majority of `RecoveryAnswer`s within the resend window; the
    /// startup `RecoveryQuery` broadcast needs to be retried.
    RecoveryRetry,
    Custom(u64),
}

struct Scheduled {
    priority: i32,
    fires_at: Instant,
}

/// Schedules and polls `TimeoutKind`s. One instance is owned by the
/// consensus dispatcher; all scheduling/cancellation/polling happens on
/// that single thread, so no internal synchronization is needed — unlike
/// `ClientRequestManager` or `ClientBatchStore`, this is not one of the
/// objects section 5 calls out as shared across threads.
#[derive(Default)]
pub struct Timeouts {
    scheduled: HashMap<TimeoutKind, Scheduled>,
}

impl Timeouts {
    pub fn new() -> Self {
        Self { scheduled: HashMap::new() }
    }

    /// Schedules `kind` to fire after `delay`, at `priority` (numerically
    /// lower means more urgent). Replaces an existing schedule for the
    /// same `kind` only if `priority` is strictly higher (lower number)
    /// than what is already scheduled, per section 5's
    /// `scheduleCatchUpTask` rule. Returns whether the schedule changed.
    pub fn schedule(&mut self, kind: TimeoutKind, priority: i32, delay: Duration) -> bool {
        let fires_at = Instant::now() + delay;
        match self.scheduled.get(&kind) {
            Some(existing) if existing.priority <= priority => false,
            _ => {
                self.scheduled.insert(kind, Scheduled { priority, fires_at });
                true
            }
        }
    }

    /// Cancels `kind`, if scheduled. Safe to call at any time, including
    /// for a `kind` that never was (or is no longer) scheduled.
    pub fn cancel(&mut self, kind: TimeoutKind) {
        self.scheduled.remove(&kind);
    }

    pub fn is_scheduled(&self, kind: TimeoutKind) -> bool {
        self.scheduled.contains_key(&kind)
    }

    /// Removes and returns every `kind` whose deadline has passed.
    /// Called once per dispatcher loop iteration.
    pub fn poll_expired(&mut self) -> Vec<TimeoutKind> {
        let now = Instant::now();
        let expired: Vec<TimeoutKind> = self
            .scheduled
            .iter()
            .filter(|(_, s)| s.fires_at <= now)
            .map(|(k, _)| *k)
            .collect();
        for kind in &expired {
            self.scheduled.remove(kind);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_replaces_lower_priority_schedule() {
        let mut timeouts = Timeouts::new();
        assert!(timeouts.schedule(TimeoutKind::CheckCatchup, 5, Duration::from_secs(10)));
        assert!(!timeouts.schedule(TimeoutKind::CheckCatchup, 10, Duration::from_secs(1)));
        assert!(timeouts.schedule(TimeoutKind::CheckCatchup, 1, Duration::from_millis(1)));
    }

    #[test]
    fn expired_timeouts_are_returned_once() {
        let mut timeouts = Timeouts::new();
        timeouts.schedule(TimeoutKind::LeaderSuspect, 0, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        let expired = timeouts.poll_expired();
        assert_eq!(expired, vec![TimeoutKind::LeaderSuspect]);
        assert!(timeouts.poll_expired().is_empty());
    }
}
