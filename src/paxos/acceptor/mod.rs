//! The acceptor role: answers `Prepare` with a promise or a rejection,
//! and answers `Propose` with an `Accept` vote, per section 4.2.
//!
//! Grounded on the teacher crate's `consensus::accept_phase`/`ConsensusGuard`
//! split between "what view am I promised to" and "what have I accepted":
//! here those collapse into a single `Acceptor` tracking `promised_view`
//! plus delegating per-instance bookkeeping to the shared `Log`.

use crate::paxos::communication::message::{
    AcceptMessage, AcceptedInstance, Header, PrepareRequest, PrepareResponse, ProposeRequest,
};
use crate::paxos::communication::NodeId;
use crate::paxos::error::Result;
use crate::paxos::log::{Log, StableStorage};
use crate::paxos::ordering::{InstanceId, View};

/// Tracks the one piece of state an acceptor needs beyond the log itself:
/// the highest view it has promised not to abandon.
pub struct Acceptor {
    local: NodeId,
    promised_view: View,
}

impl Acceptor {
    pub fn new(local: NodeId) -> Self {
        Self { local, promised_view: View::ZERO }
    }

    pub fn promised_view(&self) -> View {
        self.promised_view
    }

    /// Answers a `Prepare` for `request.header.view`. Promises if the
    /// requested view is at least as high as anything already promised,
    /// returning every instance at or above `from_instance` this acceptor
    /// has accepted but not yet seen decided, so the new leader can
    /// safely re-propose them (section 4.3). The promised view is
    /// durably written before the response is built — a promise that
    /// only lived in memory would let a restarted replica accept a
    /// conflicting proposal it had already promised not to.
    pub fn handle_prepare(
        &mut self,
        request: &PrepareRequest,
        log: &Log,
        from_instance: InstanceId,
        storage: &mut dyn StableStorage,
    ) -> Result<PrepareResponse> {
        let view = request.header.view;
        if view < self.promised_view {
            return Ok(PrepareResponse::Nack {
                header: Header::new(self.local, self.promised_view),
                promised_view: self.promised_view,
            });
        }

        storage.write_view(view)?;
        self.promised_view = view;

        let mut accepted = Vec::new();
        let mut id = from_instance;
        while id < log.get_next_id() {
            if let Some(instance) = log.get_instance(id) {
                if !matches!(instance.state, crate::paxos::log::InstanceState::Unknown) {
                    accepted.push(AcceptedInstance { instance: id, view: instance.view, value: instance.value.clone() });
                }
            }
            id = id.next();
        }

        Ok(PrepareResponse::Promised { header: Header::new(self.local, view), accepted })
    }

    /// Answers a `Propose` for `(instance, view, value)`: accepts and
    /// records the value in the log, unless a higher view has since been
    /// promised, in which case the request is silently ignored (section
    /// 4.2 treats this as a stale message, not an error). The accepted
    /// view is durably written before the `Accept` is built, for the same
    /// reason `handle_prepare` persists its promise first.
    pub fn handle_propose(
        &mut self,
        request: &ProposeRequest,
        log: &mut Log,
        storage: &mut dyn StableStorage,
    ) -> Result<Option<AcceptMessage>> {
        if request.header.view < self.promised_view {
            return Ok(None);
        }
        storage.write_view(request.header.view)?;
        self.promised_view = request.header.view;

        if log.set_known(request.instance, request.header.view, request.value.clone()).is_err() {
            return Ok(None);
        }

        Ok(Some(AcceptMessage {
            header: Header::new(self.local, request.header.view),
            instance: request.instance,
            value: request.value.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::log::{Log, MemStableStorage};

    #[test]
    fn rejects_prepare_below_promised_view() {
        let mut acceptor = Acceptor::new(NodeId::from(0u32));
        let log = Log::new();
        let mut storage = MemStableStorage::default();
        acceptor
            .handle_prepare(
                &PrepareRequest { header: Header::new(NodeId::from(1u32), View::from(3i64)) },
                &log,
                InstanceId::ZERO,
                &mut storage,
            )
            .unwrap();

        match acceptor
            .handle_prepare(
                &PrepareRequest { header: Header::new(NodeId::from(2u32), View::from(1i64)) },
                &log,
                InstanceId::ZERO,
                &mut storage,
            )
            .unwrap()
        {
            PrepareResponse::Nack { promised_view, .. } => assert_eq!(promised_view, View::from(3i64)),
            PrepareResponse::Promised { .. } => panic!("should have been rejected"),
        }
    }

    #[test]
    fn promise_carries_previously_accepted_values() {
        let mut acceptor = Acceptor::new(NodeId::from(0u32));
        let mut log = Log::new();
        let mut storage = MemStableStorage::default();
        let id = log.append(View::ZERO, b"v".to_vec());

        match acceptor
            .handle_prepare(
                &PrepareRequest { header: Header::new(NodeId::from(1u32), View::from(1i64)) },
                &log,
                InstanceId::ZERO,
                &mut storage,
            )
            .unwrap()
        {
            PrepareResponse::Promised { accepted, .. } => {
                assert_eq!(accepted.len(), 1);
                assert_eq!(accepted[0].instance, id);
            }
            PrepareResponse::Nack { .. } => panic!("should have promised"),
        }
    }

    #[test]
    fn promise_is_durable_before_being_returned() {
        let mut acceptor = Acceptor::new(NodeId::from(0u32));
        let log = Log::new();
        let mut storage = MemStableStorage::default();
        acceptor
            .handle_prepare(
                &PrepareRequest { header: Header::new(NodeId::from(1u32), View::from(4i64)) },
                &log,
                InstanceId::ZERO,
                &mut storage,
            )
            .unwrap();
        assert_eq!(storage.read_view().unwrap(), View::from(4i64));
    }

    #[test]
    fn accept_ignored_after_higher_view_promised() {
        let mut acceptor = Acceptor::new(NodeId::from(0u32));
        let mut log = Log::new();
        let mut storage = MemStableStorage::default();
        acceptor
            .handle_prepare(
                &PrepareRequest { header: Header::new(NodeId::from(1u32), View::from(5i64)) },
                &log,
                InstanceId::ZERO,
                &mut storage,
            )
            .unwrap();

        let result = acceptor
            .handle_propose(
                &ProposeRequest { header: Header::new(NodeId::from(2u32), View::from(1i64)), instance: InstanceId::ZERO, value: b"v".to_vec() },
                &mut log,
                &mut storage,
            )
            .unwrap();
        assert!(result.is_none());
    }
}
