//! The View-SS recovery protocol run once at startup, per section 4.8.
//!
//! Grounded on the teacher crate's `cst`/view-change bootstrapping: a
//! replica rejoining the group first has to learn the current view and
//! how far the group has progressed before it can safely participate.

use std::collections::HashSet as StdHashSet;

use crate::paxos::communication::message::{Header, RecoveryAnswer, RecoveryQuery};
use crate::paxos::communication::{NodeId, ReplicaParams};
use crate::paxos::ordering::{InstanceId, View};

/// Where the recovery protocol stands.
pub enum RecoveryState {
    /// Not needed: this replica started fresh (`v == 0`).
    Skipped,
    /// Broadcasting `Recovery` and collecting `RecoveryAnswer`s.
    Collecting { sent_view: View, answers: StdHashSet<NodeId>, highest_seen_view: View, leader_answer: Option<(NodeId, InstanceId)> },
    /// A majority answered; recovery is complete.
    Done { view: View, catch_up_to: Option<InstanceId> },
}

pub struct Recovery {
    params: ReplicaParams,
    state: RecoveryState,
}

impl Recovery {
    /// Starts recovery given the durable view read at boot. Returns the
    /// `Recovery` query to broadcast, unless `view == View::ZERO` (a
    /// fresh replica skips recovery entirely).
    pub fn start(params: ReplicaParams, durable_view: View) -> (Self, Option<RecoveryQuery>) {
        if durable_view == View::ZERO {
            return (Self { params, state: RecoveryState::Skipped }, None);
        }

        let query = RecoveryQuery { header: Header::new(params.local(), durable_view) };
        let recovery = Self {
            params,
            state: RecoveryState::Collecting {
                sent_view: durable_view,
                answers: StdHashSet::new(),
                highest_seen_view: durable_view,
                leader_answer: None,
            },
        };
        (recovery, Some(query))
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, RecoveryState::Skipped | RecoveryState::Done { .. })
    }

    /// The query to resend if no majority of answers has arrived within
    /// the resend window, or `None` once recovery has settled.
    pub fn retry_query(&self) -> Option<RecoveryQuery> {
        match &self.state {
            RecoveryState::Collecting { sent_view, .. } => {
                Some(RecoveryQuery { header: Header::new(self.params.local(), *sent_view) })
            }
            _ => None,
        }
    }

    /// Result of recovery, once done: the view to adopt, and an instance
    /// to catch up to, if the leader of that view answered.
    pub fn outcome(&self) -> Option<(View, Option<InstanceId>)> {
        match &self.state {
            RecoveryState::Skipped => Some((View::ZERO, None)),
            RecoveryState::Done { view, catch_up_to } => Some((*view, *catch_up_to)),
            RecoveryState::Collecting { .. } => None,
        }
    }

    /// Feeds a `RecoveryAnswer` into the collector. Returns `Some` query
    /// to rebroadcast at a higher view if the current attempt needs to
    /// restart (a higher view was observed after a majority settled
    /// without a leader answer).
    pub fn on_answer(&mut self, from: NodeId, answer: RecoveryAnswer) -> Option<RecoveryQuery> {
        let (mut answers, mut highest_seen_view, mut leader_answer) = match &self.state {
            RecoveryState::Collecting { answers, highest_seen_view, leader_answer, .. } => {
                (answers.clone(), *highest_seen_view, *leader_answer)
            }
            _ => return None,
        };

        if answer.view > highest_seen_view {
            highest_seen_view = answer.view;
        }
        answers.insert(from);

        let leader = self.params.leader_of(highest_seen_view);
        if from == leader {
            leader_answer = Some((from, answer.first_uncommitted));
        }

        if answers.len() < self.params.majority() {
            self.state = RecoveryState::Collecting { sent_view: highest_seen_view, answers, highest_seen_view, leader_answer };
            return None;
        }

        match leader_answer {
            Some((_, next_id)) => {
                self.state = RecoveryState::Done { view: highest_seen_view, catch_up_to: Some(next_id) };
                None
            }
            None => {
                let requery = RecoveryQuery { header: Header::new(self.params.local(), highest_seen_view) };
                self.state = RecoveryState::Collecting {
                    sent_view: highest_seen_view,
                    answers: StdHashSet::new(),
                    highest_seen_view,
                    leader_answer: None,
                };
                Some(requery)
            }
        }
    }

    /// Answers a peer's `RecoveryQuery`, per the `ViewRecoveryRequestHandler`
    /// rule: if the sender is the current leader, or its view is at least
    /// ours, a view change is warranted and the reply should be deferred
    /// to the caller (who runs `stopProposer`/`prepareNextView` as
    /// needed); otherwise answer immediately with `(view, nextId)`.
    pub fn handle_query(
        &self,
        from: NodeId,
        request_view: View,
        current_view: View,
        next_id: InstanceId,
    ) -> RecoveryQueryOutcome {
        let leader = self.params.leader_of(current_view);
        if from == leader || request_view >= current_view {
            RecoveryQueryOutcome::ForceViewChange
        } else {
            RecoveryQueryOutcome::Answer(RecoveryAnswer {
                header: Header::new(self.params.local(), current_view),
                view: current_view,
                first_uncommitted: next_id,
            })
        }
    }
}

pub enum RecoveryQueryOutcome {
    Answer(RecoveryAnswer),
    ForceViewChange,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ReplicaParams {
        ReplicaParams::new(3, NodeId::from(0u32))
    }

    #[test]
    fn fresh_replica_skips_recovery() {
        let (recovery, query) = Recovery::start(params(), View::ZERO);
        assert!(recovery.is_done());
        assert!(query.is_none());
    }

    #[test]
    fn majority_with_leader_answer_completes_recovery() {
        let (mut recovery, query) = Recovery::start(params(), View::from(3i64));
        assert!(query.is_some());

        let leader = params().leader_of(View::from(3i64));
        recovery.on_answer(leader, RecoveryAnswer { header: Header::new(leader, View::from(3i64)), view: View::from(3i64), first_uncommitted: InstanceId::from(7i64) });
        let other = params().peer_ids().find(|id| *id != leader).unwrap();
        recovery.on_answer(other, RecoveryAnswer { header: Header::new(other, View::from(3i64)), view: View::from(3i64), first_uncommitted: InstanceId::from(7i64) });

        assert!(recovery.is_done());
        assert_eq!(recovery.outcome(), Some((View::from(3i64), Some(InstanceId::from(7i64)))));
    }
}
