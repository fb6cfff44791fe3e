//! Brings a lagging replica up to date, either by requesting individual
//! decided instances (Normal mode) or a full snapshot (Snapshot mode),
//! per section 4.6.
//!
//! Grounded on the teacher crate's `cst` (collaborative state transfer)
//! module: a per-peer rating vector picks who to ask, and an adaptive
//! resend timeout paces retries the same way `cst::CollabStateTransfer`
//! paces its own fetch requests.

use std::time::{Duration, Instant};

use crate::paxos::communication::message::{
    CatchUpQuery, CatchUpResponse, CatchUpSnapshot, DecidedInstance, Header,
};
use crate::paxos::communication::{NodeId, ReplicaParams};
use crate::paxos::log::{Log, Snapshot};
use crate::paxos::ordering::{InstanceId, View};

/// Floor for the adaptive resend timeout, regardless of how fast recent
/// responses have been processed.
pub const CATCHUP_MIN_RESEND_TIMEOUT: Duration = Duration::from_millis(50);

/// How often the idle `CheckCatchupTask` re-examines whether this
/// replica has fallen out of the window.
pub const PERIODIC_CATCHUP_TIMEOUT: Duration = Duration::from_millis(500);

const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Normal,
    Snapshot,
}

/// Outcome of feeding a `CatchUpResponse` or `CatchUpSnapshot` to the
/// state machine.
pub enum CatchUpEvent {
    /// Nothing actionable; a query should be re-armed later.
    Continue,
    /// At least one decided instance was adopted.
    Adopted(Vec<InstanceId>),
    /// A snapshot was delivered; the caller should hand it to whatever
    /// installs `Log`/`ClientRequestManager` state from it.
    SnapshotDelivered(Snapshot),
    /// The peer reported it has nothing for us either; ask the leader
    /// next time instead.
    SwitchToLeader,
}

/// Runs the catch-up protocol for one replica.
pub struct CatchUp {
    params: ReplicaParams,
    mode: Mode,
    rating: Vec<i64>,
    ask_leader: bool,
    preferred_snapshot_replica: Option<NodeId>,
    resend_timeout: Duration,
    last_query_sent: Option<Instant>,
}

impl CatchUp {
    pub fn new(params: ReplicaParams) -> Self {
        let n = params.n();
        Self {
            params,
            mode: Mode::Normal,
            rating: vec![0; n],
            ask_leader: false,
            preferred_snapshot_replica: None,
            resend_timeout: CATCHUP_MIN_RESEND_TIMEOUT,
            last_query_sent: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn resend_timeout(&self) -> Duration {
        self.resend_timeout
    }

    /// Whether the replica has fallen out of the window and should start
    /// (or keep) catching up: `firstUncommitted + W <= nextId`.
    pub fn is_behind(&self, log: &Log, window: usize) -> bool {
        let first = i64::from(log.get_first_uncommitted());
        let next = i64::from(log.get_next_id());
        first + window as i64 <= next
    }

    /// Whether catch-up has caught back up to within the window and
    /// Normal mode's periodic check can resume (section 4.6,
    /// "Termination").
    pub fn is_back_in_window(&self, log: &Log, window: usize) -> bool {
        let first = i64::from(log.get_first_uncommitted());
        let next = i64::from(log.get_next_id());
        first > next - 1 - window as i64
    }

    /// Picks which peer to query next: the leader, if `ask_leader` or the
    /// preferred snapshot replica is set, or else `argmax` of the rating
    /// vector excluding the local replica and the leader.
    fn pick_target(&mut self, leader_of_current_view: NodeId) -> NodeId {
        if self.mode == Mode::Snapshot {
            if let Some(preferred) = self.preferred_snapshot_replica {
                return preferred;
            }
        }
        if self.ask_leader {
            self.ask_leader = false;
            return leader_of_current_view;
        }

        let best = self
            .params
            .peer_ids()
            .filter(|id| *id != leader_of_current_view)
            .max_by_key(|id| self.rating[usize::from(*id)]);

        match best {
            Some(candidate) if self.rating[usize::from(candidate)] >= 0 => candidate,
            _ => {
                for r in self.rating.iter_mut() {
                    *r = 0;
                }
                leader_of_current_view
            }
        }
    }

    /// Builds the next `CatchUpQuery`, charging the rating of the chosen
    /// target for the instances requested.
    pub fn build_query(
        &mut self,
        view: View,
        leader_of_current_view: NodeId,
        log: &Log,
        periodic: bool,
    ) -> (NodeId, CatchUpQuery) {
        let target = self.pick_target(leader_of_current_view);

        let from_instance = log.get_first_uncommitted();
        let charged = i64::from(log.get_next_id()) - i64::from(from_instance);
        self.rating[usize::from(target)] -= charged.max(1);
        self.last_query_sent = Some(Instant::now());

        (target, CatchUpQuery { header: Header::new(self.params.local(), view), from_instance, periodic })
    }

    /// Records a send failure against `target`'s rating (section 4.6,
    /// "on an I/O send failure is set to a negative value").
    pub fn on_send_failure(&mut self, target: NodeId) {
        self.rating[usize::from(target)] = -1;
    }

    /// Processes a `CatchUpResponse`, adopting every reported instance
    /// this replica does not already have decided, and updating the
    /// sender's rating and the adaptive resend timeout.
    ///
    /// An empty response means the peer has nothing past `from_instance`.
    /// If the query that produced it was periodic (the idle
    /// `CheckCatchupTask` merely confirming we are still in the window),
    /// that is expected and carries no penalty; the task simply re-arms on
    /// its own schedule. If it was not periodic — we asked because we are
    /// genuinely behind — the peer is penalized and the next query goes
    /// to the leader instead (section 4.6).
    pub fn on_response(&mut self, from: NodeId, response: CatchUpResponse, log: &mut Log) -> CatchUpEvent {
        if response.decided.is_empty() {
            if response.periodic {
                return CatchUpEvent::Continue;
            }
            self.rating[usize::from(from)] = (self.rating[usize::from(from)] - 5).max(0);
            self.ask_leader = true;
            return CatchUpEvent::SwitchToLeader;
        }

        let fragment = response.decided.len() as i64;
        self.rating[usize::from(from)] += 2 * fragment;

        if let Some(sent_at) = self.last_query_sent {
            let processing = sent_at.elapsed().as_secs_f64();
            let new_estimate = (1.0 - EWMA_ALPHA) * self.resend_timeout.as_secs_f64() + EWMA_ALPHA * 3.0 * processing;
            self.resend_timeout = Duration::from_secs_f64(new_estimate).max(CATCHUP_MIN_RESEND_TIMEOUT);
        }

        let mut adopted = Vec::new();
        for DecidedInstance { instance, view, value } in response.decided {
            if log.is_truncated(instance) {
                continue;
            }
            if log.get_instance(instance).map(|i| i.is_decided()).unwrap_or(false) {
                continue;
            }
            if log.set_decided(instance, view, value).is_ok() {
                adopted.push(instance);
            }
        }
        CatchUpEvent::Adopted(adopted)
    }

    /// A peer answered with a snapshot instead of decided instances:
    /// transition to Snapshot mode and remember who sent it, clamping
    /// every other peer's rating so a retried query prefers the same
    /// source (section 4.6).
    pub fn on_snapshot_only(&mut self, from: NodeId) {
        self.mode = Mode::Snapshot;
        for r in self.rating.iter_mut() {
            *r = (*r).min(0);
        }
        self.preferred_snapshot_replica = Some(from);
    }

    /// Installs a delivered snapshot and reverts to Normal mode.
    pub fn on_snapshot_delivered(&mut self, from: NodeId, snapshot: CatchUpSnapshot) -> Snapshot {
        self.on_snapshot_only(from);
        self.rating[usize::from(from)] += 5;
        self.mode = Mode::Normal;
        self.preferred_snapshot_replica = None;
        snapshot.snapshot
    }

    /// Reverts to Normal mode once back in window (section 4.6,
    /// "Termination").
    pub fn maybe_resume_normal(&mut self, log: &Log, window: usize) {
        if self.is_back_in_window(log, window) {
            self.mode = Mode::Normal;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::log::Log;

    fn params() -> ReplicaParams {
        ReplicaParams::new(3, NodeId::from(0u32))
    }

    #[test]
    fn behind_detection_matches_window_formula() {
        let mut log = Log::new();
        for _ in 0..5 {
            log.append(View::ZERO, b"x".to_vec());
        }
        let catchup = CatchUp::new(params());
        assert!(catchup.is_behind(&log, 2));
        assert!(!catchup.is_behind(&log, 10));
    }

    #[test]
    fn empty_response_lowers_rating_and_asks_leader() {
        let mut catchup = CatchUp::new(params());
        let mut log = Log::new();
        let event = catchup.on_response(
            NodeId::from(1u32),
            CatchUpResponse { header: Header::new(NodeId::from(1u32), View::ZERO), decided: Vec::new(), batch_ids: Vec::new(), periodic: false },
            &mut log,
        );
        assert!(matches!(event, CatchUpEvent::SwitchToLeader));
        assert!(catchup.ask_leader);
    }

    #[test]
    fn empty_periodic_response_rearms_silently() {
        let mut catchup = CatchUp::new(params());
        let mut log = Log::new();
        let rating_before = catchup.rating[1];
        let event = catchup.on_response(
            NodeId::from(1u32),
            CatchUpResponse { header: Header::new(NodeId::from(1u32), View::ZERO), decided: Vec::new(), batch_ids: Vec::new(), periodic: true },
            &mut log,
        );
        assert!(matches!(event, CatchUpEvent::Continue));
        assert!(!catchup.ask_leader);
        assert_eq!(catchup.rating[1], rating_before);
    }

    #[test]
    fn nonempty_response_adopts_and_raises_rating() {
        let mut catchup = CatchUp::new(params());
        let mut log = Log::new();
        let event = catchup.on_response(
            NodeId::from(1u32),
            CatchUpResponse {
                header: Header::new(NodeId::from(1u32), View::ZERO),
                decided: vec![DecidedInstance { instance: InstanceId::ZERO, view: View::ZERO, value: b"v".to_vec() }],
                batch_ids: Vec::new(),
                periodic: false,
            },
            &mut log,
        );
        match event {
            CatchUpEvent::Adopted(ids) => assert_eq!(ids, vec![InstanceId::ZERO]),
            _ => panic!("expected adoption"),
        }
        assert!(log.get_instance(InstanceId::ZERO).unwrap().is_decided());
        assert_eq!(catchup.rating[1], 2);
    }
}
