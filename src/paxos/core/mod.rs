//! `ReplicaConfig`, and the `Replica` dispatcher that wires the Log,
//! Proposer, Acceptor, CatchUp, SnapshotMaintainer, Recovery, Batcher and
//! ClientRequestManager together into the single-threaded consensus
//! dispatcher described in section 4's threading model.
//!
//! Grounded on the teacher crate's `communication::NodeConfig` (a plain,
//! validated options struct with documented defaults) for `ReplicaConfig`,
//! and on `bft::SyncronousConsensus`-style orchestration — owning every
//! consensus sub-object behind one serial entry point, `Replica::handle_message`
//! — for the dispatcher itself.

use std::sync::Arc;
use std::time::Duration;

use crate::paxos::acceptor::Acceptor;
use crate::paxos::batcher::{
    BatchOutcome, ClientBatch, ClientBatchId, ClientBatchStore, ClientRequestBatcher, CrashModel,
    ProposerBatchBuilder,
};
use crate::paxos::catchup::{CatchUp, CatchUpEvent, PERIODIC_CATCHUP_TIMEOUT};
use crate::paxos::client::{Admission, ClientProxyHandle, ClientRequest, ClientRequestManager};
use crate::paxos::communication::message::{
    AcceptMessage, CatchUpQuery, CatchUpResponse, CatchUpSnapshot, DecidedInstance,
    ForwardClientBatch, Header, PrepareRequest, PrepareResponse, ProposeRequest, SystemMessage,
};
use crate::paxos::communication::transport::TransportHandle;
use crate::paxos::communication::{NodeId, ReplicaParams};
use crate::paxos::error::*;
use crate::paxos::executable::{Update, UpdateSink};
use crate::paxos::log::{Log, StableStorage};
use crate::paxos::ordering::InstanceId;
use crate::paxos::proposer::{ActiveRetransmitter, Proposer};
use crate::paxos::recovery::Recovery;
use crate::paxos::snapshot::{SnapshotConfig, SnapshotMaintainer};
use crate::paxos::timeouts::{TimeoutKind, Timeouts};

/// Which fabric carries inter-replica traffic. `Tcp`/`Udp`/`Generic` are
/// external collaborators selected by this field; the crate itself only
/// ships `ChannelTransport` (section 6, "Transport").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkKind {
    Tcp,
    Udp,
    Generic,
}

impl Default for NetworkKind {
    fn default() -> Self {
        NetworkKind::Tcp
    }
}

/// Every option named in section 6's configuration surface, typed and
/// defaulted. Parsing these from a property file is out of scope; the
/// struct, its defaults, and `validate` are not.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub window_size: usize,
    pub batch_size: usize,
    pub max_batch_delay: Duration,
    pub max_udp_packet_size: usize,
    pub network: NetworkKind,
    pub crash_model: CrashModel,
    pub log_path: std::path::PathBuf,
    pub fd_suspect_timeout: Duration,
    pub fd_send_timeout: Duration,
    pub retransmit_timeout: Duration,
    pub first_snapshot_estimate_bytes: usize,
    pub min_log_size_for_ratio_check_bytes: usize,
    pub snapshot_ask_ratio: f64,
    pub snapshot_force_ratio: f64,
    pub min_instances_for_snapshot_ratio_sample: usize,
    pub forward_max_batch_size: usize,
    pub forward_max_batch_delay: Duration,
    /// Number of selector threads; `0` means "auto" (`-1` in the
    /// original option), i.e. let the async runtime pick.
    pub selector_threads: usize,
    pub client_request_buffer_size: usize,
    pub timeout_fetch_batch_value: Duration,
    pub multicast_port: u16,
    pub multicast_ip_address: std::net::Ipv4Addr,
    pub network_mtu_size: usize,
    pub indirect_consensus: bool,
    pub augmented_paxos: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            window_size: 2,
            batch_size: 65507,
            max_batch_delay: Duration::from_millis(10),
            max_udp_packet_size: 8192,
            network: NetworkKind::default(),
            crash_model: CrashModel::default(),
            log_path: std::path::PathBuf::from("."),
            fd_suspect_timeout: Duration::from_millis(1000),
            fd_send_timeout: Duration::from_millis(500),
            retransmit_timeout: Duration::from_millis(1000),
            first_snapshot_estimate_bytes: 4096,
            min_log_size_for_ratio_check_bytes: 64 * 1024,
            snapshot_ask_ratio: 2.0,
            snapshot_force_ratio: 4.0,
            min_instances_for_snapshot_ratio_sample: 16,
            forward_max_batch_size: 8192,
            forward_max_batch_delay: Duration::from_millis(10),
            selector_threads: 0,
            client_request_buffer_size: 1024,
            timeout_fetch_batch_value: Duration::from_millis(50),
            multicast_port: 10000,
            multicast_ip_address: std::net::Ipv4Addr::new(230, 0, 0, 1),
            network_mtu_size: 1500,
            indirect_consensus: false,
            augmented_paxos: false,
        }
    }
}

impl ReplicaConfig {
    /// Validates the option set, rejecting the settings DESIGN.md's
    /// Open Question (c) resolves out of scope (any non-disabled
    /// `indirect_consensus`/`augmented_paxos`) and anything structurally
    /// unusable (`window_size == 0`).
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err("WindowSize must be at least 1").simple(ErrorKind::Communication);
        }
        if self.indirect_consensus || self.augmented_paxos {
            return Err("indirect consensus / augmented Paxos are not implemented")
                .simple(ErrorKind::Communication);
        }
        Ok(())
    }

    fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            min_log_size: self.min_log_size_for_ratio_check_bytes,
            ask_ratio: self.snapshot_ask_ratio,
            force_ratio: self.snapshot_force_ratio,
            min_sampling_instances: self.min_instances_for_snapshot_ratio_sample,
            first_estimate_bytes: self.first_snapshot_estimate_bytes,
        }
    }
}

/// The single-threaded consensus dispatcher: owns every piece of state
/// section 4's threading model says must be dispatcher-exclusive, and
/// is the sole entry point through which inter-replica messages flow.
pub struct Replica {
    params: ReplicaParams,
    config: ReplicaConfig,
    storage: Box<dyn StableStorage>,
    transport: TransportHandle,
    log: Log,
    proposer: Proposer,
    acceptor: Acceptor,
    catchup: CatchUp,
    snapshot_maintainer: SnapshotMaintainer,
    recovery: Recovery,
    timeouts: Timeouts,
    batch_store: ClientBatchStore,
    request_batcher: ClientRequestBatcher,
    batch_builder: ProposerBatchBuilder,
    client_manager: Arc<ClientRequestManager>,
    prepare_retransmitter: Option<ActiveRetransmitter<PrepareRequest>>,
    next_to_execute: InstanceId,
    executor: Option<Arc<dyn UpdateSink>>,
}

impl Replica {
    pub fn new(
        params: ReplicaParams,
        config: ReplicaConfig,
        mut storage: Box<dyn StableStorage>,
        transport: TransportHandle,
        client_manager: Arc<ClientRequestManager>,
    ) -> Result<Self> {
        config.validate()?;

        let mut durable_view = storage.read_view()?;
        if durable_view != crate::paxos::ordering::View::ZERO && params.leader_of(durable_view) == params.local() {
            // This replica led `durable_view` when it crashed; it must never
            // resume leading that exact view again (section 4.8), so the
            // bump is written before anything else runs.
            durable_view = durable_view.next();
            storage.write_view(durable_view)?;
        }
        let (recovery, initial_query) = Recovery::start(params, durable_view);
        if let Some(query) = &initial_query {
            transport.broadcast(&params.peer_ids().collect::<Vec<_>>(), SystemMessage::RecoveryQuery(query.clone()))?;
        }

        let mut log = Log::new();
        let snapshot_maintainer = SnapshotMaintainer::new(config.snapshot_config());
        let mut next_to_execute = InstanceId::ZERO;
        if let Some(snapshot) = storage.read_snapshot()? {
            log.fast_forward(snapshot.next_instance_id);
            next_to_execute = snapshot.next_instance_id;
            client_manager.install_last_replies(snapshot.last_replies.clone());
        }

        let mut timeouts = Timeouts::new();
        timeouts.schedule(TimeoutKind::CheckCatchup, 5, PERIODIC_CATCHUP_TIMEOUT);
        timeouts.schedule(TimeoutKind::LeaderSuspect, 0, config.fd_suspect_timeout);
        if initial_query.is_some() {
            timeouts.schedule(TimeoutKind::RecoveryRetry, 0, config.retransmit_timeout);
        }

        Ok(Self {
            proposer: Proposer::new(params, config.window_size, durable_view),
            acceptor: Acceptor::new(params.local()),
            catchup: CatchUp::new(params),
            snapshot_maintainer,
            recovery,
            timeouts,
            batch_store: ClientBatchStore::for_crash_model(config.crash_model),
            request_batcher: ClientRequestBatcher::new(params.local(), config.forward_max_batch_delay, config.forward_max_batch_size),
            batch_builder: ProposerBatchBuilder::new(1, config.max_batch_delay),
            prepare_retransmitter: None,
            next_to_execute,
            executor: None,
            params,
            config,
            storage,
            transport,
            log,
            client_manager,
        })
    }

    /// Wires a decided-instance executor into this dispatcher, so decided
    /// values are resolved and applied as they become available. Without
    /// one attached, decided values are still resolved (and the at-most-
    /// once/`batch_store` bookkeeping still advances) but never handed to
    /// a state machine.
    pub fn attach_executor(&mut self, executor: Arc<dyn UpdateSink>) {
        self.executor = Some(executor);
    }

    pub fn params(&self) -> ReplicaParams {
        self.params
    }

    pub fn is_leader(&self) -> bool {
        self.params.is_local_leader(self.proposer.current_view())
    }

    pub fn current_view(&self) -> crate::paxos::ordering::View {
        self.proposer.current_view()
    }

    /// Read-only access to the replicated log, for diagnostics and tests
    /// that need to inspect a decided instance directly rather than
    /// through a `CatchUpQuery` round trip.
    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn catchup_mode(&self) -> crate::paxos::catchup::Mode {
        self.catchup.mode()
    }

    /// Routes one inbound `SystemMessage` to the component that owns
    /// its phase, per section 3's component table. Returns every
    /// outbound message this step produces, to be handed to `transport`
    /// by the caller (kept separate so tests can inspect the output
    /// instead of driving a real transport).
    pub fn handle_message(&mut self, from: NodeId, message: SystemMessage) -> Result<Vec<(NodeId, SystemMessage)>> {
        match message {
            SystemMessage::Prepare(request) => {
                let from_instance = self.log.get_first_uncommitted();
                let response = self.acceptor.handle_prepare(&request, &self.log, from_instance, &mut *self.storage)?;
                Ok(vec![(from, SystemMessage::PrepareResponse(response))])
            }
            SystemMessage::PrepareResponse(response) => Ok(self.on_prepare_response(from, response)),
            SystemMessage::Propose(request) => self.on_propose(request),
            SystemMessage::Accept(accept) => self.on_accept(from, accept),
            SystemMessage::Alive(_) => {
                self.timeouts.cancel(crate::paxos::timeouts::TimeoutKind::LeaderSuspect);
                Ok(Vec::new())
            }
            SystemMessage::ForwardClientBatch(forward) => {
                self.batch_store.insert_present(forward.batch);
                self.drain_decided()?;
                Ok(Vec::new())
            }
            SystemMessage::CatchUpQuery(query) => Ok(vec![(from, self.answer_catch_up(query)?)]),
            SystemMessage::CatchUpResponse(response) => {
                self.timeouts.cancel(crate::paxos::timeouts::TimeoutKind::CatchUp(from));
                let event = self.catchup.on_response(from, response, &mut self.log);
                if let CatchUpEvent::Adopted(_) = event {
                    let size = self.log_approx_size_hint();
                    self.maybe_snapshot(size);
                    self.drain_decided()?;
                }
                self.catchup.maybe_resume_normal(&self.log, self.config.window_size);
                let mut outbound = Vec::new();
                self.maybe_arm_catch_up(&mut outbound, false);
                Ok(outbound)
            }
            SystemMessage::CatchUpSnapshot(snapshot) => {
                let installed = self.catchup.on_snapshot_delivered(from, snapshot);
                self.install_snapshot(installed)?;
                Ok(Vec::new())
            }
            SystemMessage::RecoveryQuery(query) => {
                use crate::paxos::recovery::RecoveryQueryOutcome;
                match self.recovery.handle_query(from, query.header.view, self.proposer.current_view(), self.log.get_next_id()) {
                    RecoveryQueryOutcome::Answer(answer) => Ok(vec![(from, SystemMessage::RecoveryAnswer(answer))]),
                    RecoveryQueryOutcome::ForceViewChange => {
                        self.proposer.stop_proposer();
                        let request = self.proposer.prepare_next_view(&mut *self.storage)?;
                        Ok(self.params.peer_ids().map(|id| (id, SystemMessage::Prepare(request.clone()))).collect())
                    }
                }
            }
            SystemMessage::RecoveryAnswer(answer) => {
                let requery = self.recovery.on_answer(from, answer);
                if self.recovery.is_done() {
                    self.timeouts.cancel(TimeoutKind::RecoveryRetry);
                }
                match requery {
                    Some(requery) => Ok(self.params.peer_ids().map(|id| (id, SystemMessage::RecoveryQuery(requery.clone()))).collect()),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    fn on_prepare_response(&mut self, from: NodeId, response: PrepareResponse) -> Vec<(NodeId, SystemMessage)> {
        use crate::paxos::proposer::PrepareOutcome;
        if let Some(retransmitter) = &mut self.prepare_retransmitter {
            retransmitter.stop(from);
        }

        let accepted = match self.proposer.on_prepare_response(from, response) {
            PrepareOutcome::Prepared(accepted) => accepted,
            PrepareOutcome::Continue => return Vec::new(),
            PrepareOutcome::FailedHigherView(_) => {
                self.prepare_retransmitter = None;
                return Vec::new();
            }
        };
        self.prepare_retransmitter = None;

        let mut outbound = Vec::new();
        for instance in accepted {
            if let Ok(propose) = self.proposer.reaccept(&mut self.log, instance) {
                for id in self.params.all_ids() {
                    outbound.push((id, SystemMessage::Propose(propose.clone())));
                }
            }
        }
        outbound
    }

    fn on_propose(&mut self, request: ProposeRequest) -> Result<Vec<(NodeId, SystemMessage)>> {
        match self.acceptor.handle_propose(&request, &mut self.log, &mut *self.storage)? {
            Some(accept) => Ok(self.params.all_ids().map(|id| (id, SystemMessage::Accept(accept.clone()))).collect()),
            None => Ok(Vec::new()),
        }
    }

    fn on_accept(&mut self, from: NodeId, accept: AcceptMessage) -> Result<Vec<(NodeId, SystemMessage)>> {
        let majority = self.params.majority();
        let reached_majority = self.log.record_accept(accept.instance, accept.header.view, from, majority);
        if reached_majority {
            let _ = self.log.set_decided(accept.instance, accept.header.view, accept.value);
            let size = self.log_approx_size_hint();
            self.maybe_snapshot(size);
            self.drain_decided()?;
        }
        Ok(Vec::new())
    }

    /// Applies every newly-decided instance, in order, to the attached
    /// executor (section 4's "decided value to state machine" pipeline).
    /// Each instance's value is a `ClientBatchId` list (section 4.4(b));
    /// resolving it to the underlying requests requires their payloads to
    /// already be `present` in `batch_store`. An instance whose batches
    /// have not arrived yet (a `ForwardClientBatch` still in flight) halts
    /// the drain at that point, since instances must apply in order —
    /// `drain_decided` is retried from wherever it left off the next time
    /// a decided instance or a forwarded batch arrives.
    ///
    /// A value that does not decode as a `ClientBatchId` list is skipped
    /// rather than treated as fatal: `propose` remains a raw entry point
    /// below the batching layer (used directly in tests and by callers
    /// that bypass `submit_client_request`), so not every decided value is
    /// guaranteed to be one of this replica's own batch-id lists.
    fn drain_decided(&mut self) -> Result<Vec<Update>> {
        let mut updates = Vec::new();
        loop {
            let id = self.next_to_execute;
            if id >= self.log.get_next_id() {
                break;
            }
            let value = match self.log.get_instance(id) {
                Some(instance) if instance.is_decided() => instance.value.clone(),
                _ => break,
            };

            let batch_ids = match ClientBatchId::decode_list(&value) {
                Ok(ids) => ids,
                Err(err) => {
                    log::warn!("decided instance {} did not decode as a client batch list, skipping: {}", id, err);
                    self.next_to_execute = id.next();
                    continue;
                }
            };
            let requests = match self.batch_store.resolve(&batch_ids) {
                Some(requests) => requests,
                None => {
                    for batch_id in &batch_ids {
                        self.batch_store.mark_referenced(*batch_id);
                    }
                    break;
                }
            };

            for request in requests {
                updates.push(Update { request_id: request.id, payload: request.payload });
            }
            self.next_to_execute = id.next();
        }

        if !updates.is_empty() {
            if let Some(executor) = &self.executor {
                executor.apply(updates.clone())?;
            }
        }
        Ok(updates)
    }

    fn log_approx_size_hint(&self) -> usize {
        self.log.byte_size_between(self.snapshot_maintainer.last_snapshot_instance_id(), self.log.get_first_uncommitted())
    }

    fn maybe_snapshot(&mut self, _size_hint: usize) {
        use crate::paxos::snapshot::SnapshotAction;
        match self.snapshot_maintainer.on_log_size_changed(&self.log) {
            SnapshotAction::None => {}
            SnapshotAction::Ask(at) => {
                log::debug!("log size crossed the ask ratio at instance {}; requesting a snapshot", at);
            }
            SnapshotAction::Force(at) => {
                log::warn!("log size crossed the force ratio at instance {}; a snapshot is now overdue", at);
            }
        }
        // Either action still requires a round trip through the executor
        // thread (`ExecutorHandle::get_state_for_snapshot`) to actually
        // produce a `Snapshot`; the caller driving this `Replica` is
        // expected to poll for that and hand the result to
        // `install_snapshot` once ready.
    }

    /// Answers a peer's `CatchUpQuery`, per section 4.6: a `CatchUpSnapshot`
    /// if the requested instance has already been truncated away locally,
    /// a `CatchUpResponse` of decided instances otherwise.
    fn answer_catch_up(&mut self, query: CatchUpQuery) -> Result<SystemMessage> {
        let header = Header::new(self.params.local(), self.proposer.current_view());

        if self.log.is_truncated(query.from_instance) {
            let snapshot = self
                .storage
                .read_snapshot()?
                .ok_or("catch-up query below the retained range, but no local snapshot exists")
                .simple(ErrorKind::Snapshot)?;
            return Ok(SystemMessage::CatchUpSnapshot(CatchUpSnapshot { header, snapshot }));
        }

        let decided = self
            .log
            .decided_since(query.from_instance)
            .into_iter()
            .map(|(instance, view, value)| DecidedInstance { instance, view, value })
            .collect();

        Ok(SystemMessage::CatchUpResponse(CatchUpResponse { header, decided, batch_ids: Vec::new(), periodic: query.periodic }))
    }

    /// Installs `snapshot` as this replica's new durable state: writes it
    /// to stable storage, reseeds the client at-most-once cache, and
    /// truncates the log below its watermark. Called both when a snapshot
    /// arrives via `CatchUpSnapshot` and when the executor thread hands
    /// back a locally-produced one after `SnapshotAction::Ask`/`Force`.
    pub fn install_snapshot(&mut self, snapshot: crate::paxos::log::Snapshot) -> Result<()> {
        self.storage.write_snapshot(&snapshot)?;
        self.client_manager.install_last_replies(snapshot.last_replies.clone());
        self.snapshot_maintainer.on_snapshot_made(&snapshot, &mut self.log);
        Ok(())
    }

    /// Kicks off a view change: `stopProposer` then `prepareNextView`,
    /// arming an `ActiveRetransmitter` for the `Prepare` so peers that
    /// miss the first multicast still converge (section 4.3).
    pub fn start_view_change(&mut self) -> Result<Vec<(NodeId, SystemMessage)>> {
        self.proposer.stop_proposer();
        let request = self.proposer.prepare_next_view(&mut *self.storage)?;
        self.prepare_retransmitter = Some(ActiveRetransmitter::new(
            request.clone(),
            self.params.peer_ids(),
            self.config.retransmit_timeout,
        ));
        Ok(self.params.peer_ids().map(|id| (id, SystemMessage::Prepare(request.clone()))).collect())
    }

    /// Drives time-based work: resends the in-flight `Prepare` (if any),
    /// and services every timeout that has fired since the last call.
    /// Callers are expected to invoke this on a regular cadence (the
    /// consensus dispatcher's event loop, section 4's threading model).
    pub fn tick(&mut self) -> Result<Vec<(NodeId, SystemMessage)>> {
        if let Some(retransmitter) = &mut self.prepare_retransmitter {
            retransmitter.tick(self.transport.as_ref())?;
            if retransmitter.is_finalized() {
                self.prepare_retransmitter = None;
            }
        }

        let mut outbound = Vec::new();
        for kind in self.timeouts.poll_expired() {
            match kind {
                TimeoutKind::CheckCatchup => {
                    self.maybe_arm_catch_up(&mut outbound, true);
                    self.timeouts.schedule(TimeoutKind::CheckCatchup, 5, PERIODIC_CATCHUP_TIMEOUT);
                }
                TimeoutKind::CatchUp(peer) => {
                    self.catchup.on_send_failure(peer);
                    self.maybe_arm_catch_up(&mut outbound, false);
                }
                TimeoutKind::LeaderSuspect => {
                    if !self.is_leader() {
                        outbound.extend(self.start_view_change()?);
                    }
                    self.timeouts.schedule(TimeoutKind::LeaderSuspect, 0, self.config.fd_suspect_timeout);
                }
                TimeoutKind::RecoveryRetry => {
                    if let Some(query) = self.recovery.retry_query() {
                        outbound.extend(self.params.peer_ids().map(|id| (id, SystemMessage::RecoveryQuery(query.clone()))));
                        self.timeouts.schedule(TimeoutKind::RecoveryRetry, 0, self.config.retransmit_timeout);
                    }
                }
                TimeoutKind::PrepareTimeout(_) | TimeoutKind::Custom(_) => {}
            }
        }

        if let BatchOutcome::Sealed(batch) = self.request_batcher.tick() {
            outbound.extend(self.on_batch_sealed(batch)?);
        }
        if let Some(encoded) = self.batch_builder.tick() {
            if let Some(propose) = self.propose(encoded) {
                outbound.extend(propose);
            }
        }

        Ok(outbound)
    }

    /// Sends a fresh `CatchUpQuery` and re-arms its resend timeout, if
    /// this replica has fallen out of the window (section 4.6). `periodic`
    /// marks whether this attempt comes from the idle `CheckCatchupTask`
    /// (true) or from falling behind / retrying a stalled query (false);
    /// it travels on the wire so the peer can echo it back on an empty
    /// response.
    fn maybe_arm_catch_up(&mut self, outbound: &mut Vec<(NodeId, SystemMessage)>, periodic: bool) {
        if self.is_leader() || !self.catchup.is_behind(&self.log, self.config.window_size) {
            return;
        }
        let view = self.proposer.current_view();
        let leader = self.params.leader_of(view);
        let (target, query) = self.catchup.build_query(view, leader, &self.log, periodic);
        let resend_after = self.catchup.resend_timeout();
        outbound.push((target, SystemMessage::CatchUpQuery(query)));
        self.timeouts.schedule(TimeoutKind::CatchUp(target), 0, resend_after);
    }

    /// Admits a client request, per section 4.4(a): deduplicates /
    /// back-pressures via `client_manager`, then feeds the request into
    /// this replica's batcher. A sealed batch is forwarded to every peer
    /// and its id handed to the proposer-side builder, which concatenates
    /// ids into the next consensus value once it reaches its own batching
    /// level (section 4.4(b)).
    pub fn submit_client_request(
        &mut self,
        request: ClientRequest,
        proxy: ClientProxyHandle,
    ) -> Result<Vec<(NodeId, SystemMessage)>> {
        match self.client_manager.try_admit(&request, proxy.clone()) {
            Some(Admission::Cached(reply)) => {
                proxy.send_reply(reply);
                Ok(Vec::new())
            }
            Some(Admission::Admitted) => match self.request_batcher.push(request) {
                BatchOutcome::Pending => Ok(Vec::new()),
                BatchOutcome::Sealed(batch) => self.on_batch_sealed(batch),
            },
            None => {
                proxy.send_reply(crate::paxos::client::ClientReply::busy());
                Ok(Vec::new())
            }
        }
    }

    fn on_batch_sealed(&mut self, batch: ClientBatch) -> Result<Vec<(NodeId, SystemMessage)>> {
        let id = batch.id;
        self.batch_store.insert_present(batch.clone());

        let header = Header::new(self.params.local(), self.proposer.current_view());
        let mut outbound: Vec<(NodeId, SystemMessage)> = self
            .params
            .peer_ids()
            .map(|peer| (peer, SystemMessage::ForwardClientBatch(ForwardClientBatch { header, batch: batch.clone() })))
            .collect();

        if let Some(encoded) = self.batch_builder.push(id) {
            if let Some(propose) = self.propose(encoded) {
                outbound.extend(propose);
            }
        }
        Ok(outbound)
    }

    /// Proposes `value` as the next consensus instance, if this replica
    /// is prepared and the window has room.
    pub fn propose(&mut self, value: Vec<u8>) -> Option<Vec<(NodeId, SystemMessage)>> {
        let request = self.proposer.propose(&mut self.log, value)?;
        Some(self.params.all_ids().map(|id| (id, SystemMessage::Propose(request.clone()))).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::communication::transport::ChannelTransport;
    use crate::paxos::log::MemStableStorage;

    fn make_replica(local: u32) -> Replica {
        let params = ReplicaParams::new(3, NodeId::from(local));
        let config = ReplicaConfig::default();
        let storage = Box::new(MemStableStorage::default());
        let transport = Arc::new(ChannelTransport::group(&[NodeId::from(0u32)]).remove(0).0) as TransportHandle;
        let client_manager = Arc::new(ClientRequestManager::new(config.client_request_buffer_size));
        Replica::new(params, config, storage, transport, client_manager).unwrap()
    }

    #[test]
    fn rejects_indirect_consensus_config() {
        let mut config = ReplicaConfig::default();
        config.indirect_consensus = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn fresh_replica_starts_not_leader_of_view_zero_unless_node_zero() {
        let replica0 = make_replica(0);
        let replica1 = make_replica(1);
        assert!(replica0.is_leader());
        assert!(!replica1.is_leader());
    }

    #[test]
    fn accept_majority_decides_the_instance() {
        let mut leader = make_replica(0);
        leader.start_view_change().ok();
        // fabricate promises directly, bypassing the network, to drive
        // the proposer into PREPARED for this unit test
        for peer in 1..3u32 {
            leader.on_prepare_response(
                NodeId::from(peer),
                PrepareResponse::Promised {
                    header: crate::paxos::communication::message::Header::new(NodeId::from(peer), leader.proposer.current_view()),
                    accepted: Vec::new(),
                },
            );
        }
        assert!(leader.proposer.is_prepared());

        let outbound = leader.propose(ClientBatchId::encode_list(&[])).unwrap();
        assert_eq!(outbound.len(), 3);

        let ProposeRequest { header, instance, value } = match &outbound[0].1 {
            SystemMessage::Propose(p) => p.clone(),
            _ => panic!("expected a Propose"),
        };

        leader.on_accept(NodeId::from(0u32), AcceptMessage { header, instance, value: value.clone() }).unwrap();
        leader.on_accept(NodeId::from(1u32), AcceptMessage { header, instance, value }).unwrap();
        assert!(leader.log.get_instance(instance).unwrap().is_decided());
    }

    #[test]
    fn client_request_pipeline_decides_and_executes_locally() {
        use crate::paxos::client::{ClientProxy, ClientReply, RequestId};
        use std::sync::Mutex;

        struct RecordingProxy(Mutex<Option<ClientReply>>);
        impl ClientProxy for RecordingProxy {
            fn send_reply(&self, reply: ClientReply) {
                *self.0.lock().unwrap() = Some(reply);
            }
        }

        let params = ReplicaParams::new(3, NodeId::from(0u32));
        let mut config = ReplicaConfig::default();
        config.forward_max_batch_size = 1; // seal on the very first request
        let storage = Box::new(MemStableStorage::default());
        let transport = Arc::new(ChannelTransport::group(&[NodeId::from(0u32)]).remove(0).0) as TransportHandle;
        let client_manager = Arc::new(ClientRequestManager::new(config.client_request_buffer_size));
        let mut leader = Replica::new(params, config, storage, transport, client_manager).unwrap();

        leader.start_view_change().ok();
        for peer in 1..3u32 {
            leader.on_prepare_response(
                NodeId::from(peer),
                PrepareResponse::Promised {
                    header: crate::paxos::communication::message::Header::new(NodeId::from(peer), leader.proposer.current_view()),
                    accepted: Vec::new(),
                },
            );
        }

        let proxy = Arc::new(RecordingProxy(Mutex::new(None)));
        let request = ClientRequest::new(RequestId::new(1, 1), b"op".to_vec());
        let outbound = leader.submit_client_request(request.clone(), proxy).unwrap();

        let forwards = outbound.iter().filter(|(_, m)| matches!(m, SystemMessage::ForwardClientBatch(_))).count();
        assert_eq!(forwards, 2, "batch should be forwarded to both peers");

        let ProposeRequest { header, instance, value } = outbound
            .iter()
            .find_map(|(_, m)| match m {
                SystemMessage::Propose(p) => Some(p.clone()),
                _ => None,
            })
            .expect("sealing the only pending batch should immediately propose it");

        leader.on_accept(NodeId::from(0u32), AcceptMessage { header, instance, value: value.clone() }).unwrap();
        leader.on_accept(NodeId::from(1u32), AcceptMessage { header, instance, value }).unwrap();
        assert!(leader.log.get_instance(instance).unwrap().is_decided());
        assert_eq!(leader.next_to_execute, instance.next(), "the decided batch should have been resolved and drained");
    }
}
