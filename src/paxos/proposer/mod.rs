//! The leader role: `INACTIVE -> PREPARING -> PREPARED`, the window
//! bound on outstanding instances, and the `ActiveRetransmitter` every
//! outbound multicast uses to chase missing acknowledgements.
//!
//! Grounded on the teacher crate's `consensus::ViewChangePhase`/`Synchronizer`
//! (the same three-state leader-election shape, minus the PBFT quorum
//! certificates) and on `communication::ActiveRetransmitter`'s retry-until-
//! acked idiom, here generalized to carry any cloneable message.

use std::collections::{HashMap as StdHashMap, HashSet as StdHashSet};
use std::time::{Duration, Instant};

use crate::paxos::communication::message::{AcceptedInstance, Header, PrepareRequest, PrepareResponse, ProposeRequest};
use crate::paxos::communication::transport::Transport;
use crate::paxos::communication::{NodeId, ReplicaParams};
use crate::paxos::error::*;
use crate::paxos::log::{Log, StableStorage};
use crate::paxos::ordering::{InstanceId, View};

/// Where the leader-election state machine stands.
#[derive(Debug, Clone)]
pub enum ProposerState {
    Inactive,
    Preparing {
        view: View,
        acks: StdHashSet<NodeId>,
        /// Every previously-accepted instance reported by a promise so
        /// far, merged by instance id keeping the highest-view value —
        /// classic Paxos recovery (Paxos Made Simple: "adopt the value
        /// of the highest-numbered proposal among the responses"). Must
        /// not be narrowed to just the promise that completes the
        /// majority, since an earlier promise may be the only one that
        /// reports a given instance.
        accepted: StdHashMap<InstanceId, AcceptedInstance>,
    },
    Prepared { view: View },
}

/// What happened to a `PrepareResponse` just handed to the proposer.
pub enum PrepareOutcome {
    /// Still waiting on more promises.
    Continue,
    /// A majority of promises arrived; the proposer is now `PREPARED`.
    /// Carries every previously-accepted value the promises reported, so
    /// the caller can re-propose them before accepting new client work
    /// (section 4.3).
    Prepared(Vec<AcceptedInstance>),
    /// A higher view was observed (a `Nack`, or a promise for a view
    /// this proposer didn't request); the attempt failed.
    FailedHigherView(View),
}

/// Retransmits one multicast message on a fixed interval to every
/// destination that has not yet acknowledged it, per section 4.3's
/// "ActiveRetransmitter" note. Finalized (and a no-op from then on) once
/// every destination has called `stop`.
pub struct ActiveRetransmitter<M> {
    message: M,
    pending: StdHashSet<NodeId>,
    interval: Duration,
    last_sent: Instant,
}

impl<M: Clone> ActiveRetransmitter<M> {
    pub fn new(message: M, destinations: impl IntoIterator<Item = NodeId>, interval: Duration) -> Self {
        Self { message, pending: destinations.into_iter().collect(), interval, last_sent: Instant::now() }
    }

    /// Marks `dest` as acknowledged; it will not be resent to again.
    pub fn stop(&mut self, dest: NodeId) {
        self.pending.remove(&dest);
    }

    /// Cancels retransmission to every remaining destination at once.
    pub fn stop_all(&mut self) {
        self.pending.clear();
    }

    pub fn is_finalized(&self) -> bool {
        self.pending.is_empty()
    }

    /// Resends `message` to every still-pending destination if `interval`
    /// has elapsed since the last send. A no-op once finalized.
    pub fn tick<T: Transport + ?Sized>(&mut self, transport: &T) -> Result<()> {
        if self.is_finalized() || self.last_sent.elapsed() < self.interval {
            return Ok(());
        }
        self.last_sent = Instant::now();
        for &dest in self.pending.iter() {
            transport.send_to(dest, clone_into_system_message(&self.message))?;
        }
        Ok(())
    }
}

/// Bridges a generic `ActiveRetransmitter<M>` to `Transport::send_to`,
/// which speaks `SystemMessage`. Implemented for the handful of message
/// types the proposer retransmits.
fn clone_into_system_message<M: Clone + Into<crate::paxos::communication::message::SystemMessage>>(
    message: &M,
) -> crate::paxos::communication::message::SystemMessage {
    message.clone().into()
}

impl From<PrepareRequest> for crate::paxos::communication::message::SystemMessage {
    fn from(m: PrepareRequest) -> Self {
        crate::paxos::communication::message::SystemMessage::Prepare(m)
    }
}

impl From<ProposeRequest> for crate::paxos::communication::message::SystemMessage {
    fn from(m: ProposeRequest) -> Self {
        crate::paxos::communication::message::SystemMessage::Propose(m)
    }
}

/// A one-shot continuation registered via `execute_on_prepared`: exactly
/// one of its two outcomes runs, once, when the pending `PREPARING`
/// attempt resolves (section 9, "coroutine-like callbacks").
type PreparedTask = Box<dyn FnOnce(bool) + Send>;

/// Runs the leader role for a single replica: view selection, the
/// PREPARING/PREPARED state machine, and the window bound on how many
/// instances may be open at once.
pub struct Proposer {
    local: NodeId,
    params: ReplicaParams,
    window: usize,
    current_view: View,
    state: ProposerState,
    on_prepared: Vec<PreparedTask>,
}

impl Proposer {
    pub fn new(params: ReplicaParams, window: usize, current_view: View) -> Self {
        Self { local: params.local(), params, window, current_view, state: ProposerState::Inactive, on_prepared: Vec::new() }
    }

    pub fn current_view(&self) -> View {
        self.current_view
    }

    pub fn state(&self) -> &ProposerState {
        &self.state
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self.state, ProposerState::Prepared { .. })
    }

    /// Registers a continuation to run once this `PREPARING` attempt
    /// settles. If already `PREPARED`, runs it immediately with `true`.
    pub fn execute_on_prepared(&mut self, task: PreparedTask) {
        if self.is_prepared() {
            task(true);
        } else {
            self.on_prepared.push(task);
        }
    }

    fn run_prepared_tasks(&mut self, success: bool) {
        for task in std::mem::take(&mut self.on_prepared) {
            task(success);
        }
    }

    /// `prepareNextView`: advances to the smallest view above the current
    /// one this replica leads, persists it, and returns the `Prepare` to
    /// broadcast.
    pub fn prepare_next_view(&mut self, storage: &mut dyn StableStorage) -> Result<PrepareRequest> {
        let n = self.params.n() as i64;
        let mut candidate = i64::from(self.current_view) + 1;
        while self.params.leader_of(View::from(candidate)) != self.local {
            candidate += 1;
            if candidate > i64::from(self.current_view) + n {
                break;
            }
        }
        let new_view = View::from(candidate);

        storage.write_view(new_view)?;
        self.current_view = new_view;
        self.state = ProposerState::Preparing { view: new_view, acks: StdHashSet::new(), accepted: StdHashMap::new() };

        Ok(PrepareRequest { header: Header::new(self.local, new_view) })
    }

    /// Feeds a `PrepareResponse` into the PREPARING state machine.
    pub fn on_prepare_response(&mut self, from: NodeId, response: PrepareResponse) -> PrepareOutcome {
        let (requested_view, acks, accepted_so_far) = match &mut self.state {
            ProposerState::Preparing { view, acks, accepted } => (*view, acks, accepted),
            _ => return PrepareOutcome::Continue,
        };

        match response {
            PrepareResponse::Nack { promised_view, .. } if promised_view > requested_view => {
                self.fail_to_prepare(promised_view)
            }
            PrepareResponse::Nack { .. } => PrepareOutcome::Continue,
            PrepareResponse::Promised { header, accepted } => {
                if header.view != requested_view {
                    return if header.view > requested_view {
                        self.fail_to_prepare(header.view)
                    } else {
                        PrepareOutcome::Continue
                    };
                }
                for instance in accepted {
                    accepted_so_far
                        .entry(instance.instance)
                        .and_modify(|existing| {
                            if instance.view > existing.view {
                                *existing = instance.clone();
                            }
                        })
                        .or_insert(instance);
                }
                acks.insert(from);
                if acks.len() >= self.params.majority() {
                    let merged: Vec<AcceptedInstance> = accepted_so_far.values().cloned().collect();
                    self.state = ProposerState::Prepared { view: requested_view };
                    self.run_prepared_tasks(true);
                    PrepareOutcome::Prepared(merged)
                } else {
                    PrepareOutcome::Continue
                }
            }
        }
    }

    fn fail_to_prepare(&mut self, higher_view: View) -> PrepareOutcome {
        self.current_view = higher_view;
        self.state = ProposerState::Inactive;
        self.run_prepared_tasks(false);
        PrepareOutcome::FailedHigherView(higher_view)
    }

    /// `stopProposer`: unconditionally abandons any in-flight PREPARING
    /// attempt.
    pub fn stop_proposer(&mut self) {
        self.run_prepared_tasks(false);
        self.state = ProposerState::Inactive;
    }

    /// Whether the window still has room for one more open instance.
    pub fn window_has_room(&self, log: &Log) -> bool {
        let next = i64::from(log.get_next_id());
        let first = i64::from(log.get_first_uncommitted());
        (next - first) <= self.window as i64
    }

    /// Appends `value` as the next consensus instance and returns the
    /// `Propose` to broadcast, provided this replica is `PREPARED` and
    /// the window has room. Returns `None` otherwise, per section 4.3's
    /// "the proposer stalls until firstUncommitted advances".
    pub fn propose(&self, log: &mut Log, value: Vec<u8>) -> Option<ProposeRequest> {
        let view = match self.state {
            ProposerState::Prepared { view } => view,
            _ => return None,
        };
        if !self.window_has_room(log) {
            return None;
        }
        let instance = log.append(view, value.clone());
        Some(ProposeRequest { header: Header::new(self.local, view), instance, value })
    }

    /// Re-proposes a value recovered from promises (section 4.3: every
    /// previously-accepted instance a promise reports must be re-sent
    /// before any new client work is admitted).
    pub fn reaccept(&self, log: &mut Log, accepted: AcceptedInstance) -> Result<ProposeRequest> {
        let view = match self.state {
            ProposerState::Prepared { view } => view,
            _ => return Err("reaccept called outside PREPARED").simple(ErrorKind::Proposer),
        };
        log.set_known(accepted.instance, view, accepted.value.clone())?;
        Ok(ProposeRequest { header: Header::new(self.local, view), instance: accepted.instance, value: accepted.value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::log::MemStableStorage;

    fn params(local: u32) -> ReplicaParams {
        ReplicaParams::new(3, NodeId::from(local))
    }

    #[test]
    fn prepare_next_view_skips_to_a_view_this_replica_leads() {
        let mut proposer = Proposer::new(params(1), 10, View::ZERO);
        let mut storage = MemStableStorage::default();
        let req = proposer.prepare_next_view(&mut storage).unwrap();
        assert_eq!(req.header.view, View::from(1i64));
        assert_eq!(storage.read_view().unwrap(), View::from(1i64));
    }

    #[test]
    fn majority_of_promises_prepares() {
        let mut proposer = Proposer::new(params(0), 10, View::ZERO);
        let mut storage = MemStableStorage::default();
        proposer.prepare_next_view(&mut storage).unwrap();

        let outcome = proposer.on_prepare_response(
            NodeId::from(1u32),
            PrepareResponse::Promised { header: Header::new(NodeId::from(1u32), View::from(0i64)), accepted: Vec::new() },
        );
        assert!(matches!(outcome, PrepareOutcome::Continue));
        assert!(!proposer.is_prepared());

        let outcome = proposer.on_prepare_response(
            NodeId::from(2u32),
            PrepareResponse::Promised { header: Header::new(NodeId::from(2u32), View::from(0i64)), accepted: Vec::new() },
        );
        assert!(matches!(outcome, PrepareOutcome::Prepared(_)));
        assert!(proposer.is_prepared());
    }

    #[test]
    fn higher_view_nack_fails_prepare_and_runs_callback() {
        let mut proposer = Proposer::new(params(0), 10, View::ZERO);
        let mut storage = MemStableStorage::default();
        proposer.prepare_next_view(&mut storage).unwrap();

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        proposer.execute_on_prepared(Box::new(move |ok| {
            assert!(!ok);
            ran2.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        proposer.on_prepare_response(
            NodeId::from(1u32),
            PrepareResponse::Nack { header: Header::new(NodeId::from(1u32), View::from(5i64)), promised_view: View::from(5i64) },
        );
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!proposer.is_prepared());
    }

    #[test]
    fn window_blocks_proposals_once_full() {
        let mut proposer = Proposer::new(params(0), 1, View::ZERO);
        let mut storage = MemStableStorage::default();
        proposer.prepare_next_view(&mut storage).unwrap();
        proposer.on_prepare_response(
            NodeId::from(1u32),
            PrepareResponse::Promised { header: Header::new(NodeId::from(1u32), View::from(0i64)), accepted: Vec::new() },
        );
        proposer.on_prepare_response(
            NodeId::from(2u32),
            PrepareResponse::Promised { header: Header::new(NodeId::from(2u32), View::from(0i64)), accepted: Vec::new() },
        );

        let mut log = Log::new();
        assert!(proposer.propose(&mut log, b"a".to_vec()).is_some());
        assert!(proposer.propose(&mut log, b"b".to_vec()).is_none(), "window should be full");
    }
}
