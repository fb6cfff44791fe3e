//! The ordered log of consensus instances, plus the stable-storage
//! discipline that makes the replica's view and snapshots crash-durable.
//!
//! Grounded on the teacher crate's `log::Log`/`DecisionLog`/`Checkpoint`
//! triad: an in-memory, append-oriented structure paired with a
//! synchronous write path for the state that must outlive a crash. Unlike
//! the teacher's PBFT log (which keeps `PRE-PREPARE`/`PREPARE`/`COMMIT`
//! vote counts), ours stores one `ConsensusInstance` per slot because the
//! Paxos round here has only two message rounds (Promise, Accept).

mod stable;

pub use stable::{FileStableStorage, MemStableStorage, StableStorage};

use crate::paxos::client::Reply;
use crate::paxos::collections::{self, HashMap};
use crate::paxos::error::*;
use crate::paxos::ordering::{InstanceId, View};

/// Where a `ConsensusInstance` stands in the two-phase Paxos round.
#[cfg_attr(feature = "serialize_serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum InstanceState {
    /// No value has been accepted for this instance yet.
    Unknown,
    /// A value has been accepted by at least the acceptor recording it,
    /// but not yet by a majority.
    Known,
    /// A majority has accepted `(view, value)`; immutable from here on.
    Decided,
}

/// A single slot in the replicated log.
#[cfg_attr(feature = "serialize_serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ConsensusInstance {
    pub id: InstanceId,
    pub view: View,
    pub value: Vec<u8>,
    pub state: InstanceState,
    /// Ids of replicas that have sent `Accept` for `(view, value)`.
    /// Not part of the persisted identity of the instance (view/value
    /// are); used only to detect when a majority has been reached.
    #[cfg_attr(feature = "serialize_serde", serde(skip))]
    accepted_by: Vec<crate::paxos::communication::NodeId>,
}

impl ConsensusInstance {
    fn empty(id: InstanceId) -> Self {
        Self { id, view: View::ZERO, value: Vec::new(), state: InstanceState::Unknown, accepted_by: Vec::new() }
    }

    pub fn is_decided(&self) -> bool {
        self.state == InstanceState::Decided
    }
}

/// A checkpoint of the state machine plus the at-most-once reply cache,
/// permitting log truncation below `next_instance_id`.
#[cfg_attr(feature = "serialize_serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub next_instance_id: InstanceId,
    pub last_replies: HashMap<u64, Reply>,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    pub value: Vec<u8>,
}

impl Snapshot {
    pub fn byte_size(&self) -> usize {
        self.value.len() + self.last_replies.len() * 64
    }
}

/// The in-memory, sparse log of consensus instances, owned exclusively by
/// the consensus dispatcher (section 3, "Ownership").
pub struct Log {
    instances: HashMap<InstanceId, ConsensusInstance>,
    next_id: InstanceId,
    first_uncommitted: InstanceId,
    first_snapshot_instance_id: InstanceId,
    observers: Vec<Box<dyn FnMut(usize) + Send>>,
}

impl Log {
    pub fn new() -> Self {
        Self {
            instances: collections::hash_map(),
            next_id: InstanceId::ZERO,
            first_uncommitted: InstanceId::ZERO,
            first_snapshot_instance_id: InstanceId::ZERO,
            observers: Vec::new(),
        }
    }

    /// Registers a callback invoked synchronously, on the dispatcher,
    /// after every log mutation, with the current approximate byte size
    /// of the log. Used by `SnapshotMaintainer`.
    pub fn on_size_changed<F>(&mut self, f: F)
    where
        F: FnMut(usize) + Send + 'static,
    {
        self.observers.push(Box::new(f));
    }

    fn notify_size_changed(&mut self) {
        let size = self.approx_byte_size();
        for observer in self.observers.iter_mut() {
            observer(size);
        }
    }

    fn approx_byte_size(&self) -> usize {
        self.instances.values().map(|i| 32 + i.value.len()).sum()
    }

    pub fn get_instance(&self, id: InstanceId) -> Option<&ConsensusInstance> {
        self.instances.get(&id)
    }

    pub fn get_or_create(&mut self, id: InstanceId) -> &mut ConsensusInstance {
        if id >= self.next_id {
            self.next_id = id.next();
        }
        self.instances.entry(id).or_insert_with(|| ConsensusInstance::empty(id))
    }

    /// Appends a new, leader-proposed value at the next free id.
    pub fn append(&mut self, view: View, value: Vec<u8>) -> InstanceId {
        let id = self.next_id;
        self.next_id = self.next_id.next();
        let instance = ConsensusInstance { id, view, value, state: InstanceState::Known, accepted_by: Vec::new() };
        self.instances.insert(id, instance);
        self.notify_size_changed();
        id
    }

    /// Records a `Known` vote for `(id, view, value)`, as an acceptor
    /// does on `Propose`. Refuses to downgrade a `Decided` instance: per
    /// the invariant in section 3, once decided, neither view nor value
    /// may change.
    pub fn set_known(&mut self, id: InstanceId, view: View, value: Vec<u8>) -> Result<()> {
        {
            let instance = self.get_or_create(id);
            if instance.is_decided() {
                if instance.view == view && instance.value == value {
                    return Ok(());
                }
                return Err("attempt to overwrite a decided instance").simple(ErrorKind::ProtocolViolation);
            }
            instance.view = view;
            instance.value = value;
            instance.state = InstanceState::Known;
            instance.accepted_by.clear();
        }
        self.notify_size_changed();
        Ok(())
    }

    /// Records `acceptor`'s vote for `(id, view)`. Returns `true` the
    /// moment a majority is reached (the caller should then call
    /// `set_decided`).
    pub fn record_accept(&mut self, id: InstanceId, view: View, acceptor: crate::paxos::communication::NodeId, majority: usize) -> bool {
        let instance = self.get_or_create(id);
        if instance.view != view || instance.is_decided() {
            return false;
        }
        if !instance.accepted_by.contains(&acceptor) {
            instance.accepted_by.push(acceptor);
        }
        instance.accepted_by.len() >= majority
    }

    /// Marks `id` decided at `(view, value)`. Idempotent if already
    /// decided with the same value; a `ProtocolViolation` otherwise,
    /// since agreement (section 8, property 1) must never be broken.
    pub fn set_decided(&mut self, id: InstanceId, view: View, value: Vec<u8>) -> Result<()> {
        {
            let instance = self.get_or_create(id);
            if instance.is_decided() {
                if instance.view == view && instance.value == value {
                    return Ok(());
                }
                return Err("duplicate decision with a different value").simple(ErrorKind::ProtocolViolation);
            }
            instance.view = view;
            instance.value = value;
            instance.state = InstanceState::Decided;
        }

        self.advance_first_uncommitted();
        self.notify_size_changed();
        Ok(())
    }

    fn advance_first_uncommitted(&mut self) {
        while self
            .instances
            .get(&self.first_uncommitted)
            .map(|i| i.is_decided())
            .unwrap_or(false)
        {
            self.first_uncommitted = self.first_uncommitted.next();
        }
    }

    /// Drops every instance below `id`, as happens once a snapshot at
    /// `id` is installed.
    pub fn truncate_below(&mut self, id: InstanceId) {
        self.instances.retain(|k, _| *k >= id);
        if self.first_snapshot_instance_id < id {
            self.first_snapshot_instance_id = id;
        }
        if self.first_uncommitted < id {
            self.first_uncommitted = id;
        }
        if self.next_id < id {
            self.next_id = id;
        }
        self.notify_size_changed();
    }

    /// Approximate byte size of decided/known instances in `[lo, hi)`,
    /// used by `SnapshotMaintainer`'s ratio decision.
    pub fn byte_size_between(&self, lo: InstanceId, hi: InstanceId) -> usize {
        let mut id = lo;
        let mut total = 0;
        while id < hi {
            if let Some(instance) = self.instances.get(&id) {
                total += 32 + instance.value.len();
            }
            id = id.next();
        }
        total
    }

    pub fn get_next_id(&self) -> InstanceId {
        self.next_id
    }

    pub fn get_first_uncommitted(&self) -> InstanceId {
        self.first_uncommitted
    }

    pub fn first_snapshot_instance_id(&self) -> InstanceId {
        self.first_snapshot_instance_id
    }

    /// Whether the instance is truncated away (below the earliest
    /// instance this replica still remembers).
    pub fn is_truncated(&self, id: InstanceId) -> bool {
        id < self.first_snapshot_instance_id
    }

    /// Decided instances at or after `from`, in id order, for answering a
    /// `CatchUpQuery` in Normal mode. Returns `(id, view, value)` triples
    /// rather than the wire `DecidedInstance` type, to keep this module
    /// free of a dependency on the message module.
    pub fn decided_since(&self, from: InstanceId) -> Vec<(InstanceId, View, Vec<u8>)> {
        let mut out = Vec::new();
        let mut id = from;
        while id < self.next_id {
            if let Some(instance) = self.instances.get(&id) {
                if instance.is_decided() {
                    out.push((instance.id, instance.view, instance.value.clone()));
                }
            }
            id = id.next();
        }
        out
    }

    /// Installs state recovered from a peer (catch-up snapshot delivery,
    /// or startup recovery): fast-forwards `next_id`/`first_uncommitted`
    /// without touching individual instance entries below it.
    pub fn fast_forward(&mut self, next_id: InstanceId) {
        if self.next_id < next_id {
            self.next_id = next_id;
        }
        if self.first_uncommitted < next_id {
            self.first_uncommitted = next_id;
        }
        self.notify_size_changed();
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::communication::NodeId;

    #[test]
    fn decide_requires_majority() {
        let mut log = Log::new();
        let id = log.append(View::ZERO, b"v".to_vec());
        assert!(!log.record_accept(id, View::ZERO, NodeId::from(0u32), 2));
        assert!(log.record_accept(id, View::ZERO, NodeId::from(1u32), 2));
        log.set_decided(id, View::ZERO, b"v".to_vec()).unwrap();
        assert!(log.get_instance(id).unwrap().is_decided());
        assert_eq!(log.get_first_uncommitted(), id.next());
    }

    #[test]
    fn duplicate_decision_with_different_value_is_fatal() {
        let mut log = Log::new();
        let id = log.append(View::ZERO, b"v".to_vec());
        log.set_decided(id, View::ZERO, b"v".to_vec()).unwrap();
        let err = log.set_decided(id, View::ZERO, b"w".to_vec()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn truncate_drops_entries_below() {
        let mut log = Log::new();
        let a = log.append(View::ZERO, b"a".to_vec());
        let b = log.append(View::ZERO, b"b".to_vec());
        log.truncate_below(b);
        assert!(log.get_instance(a).is_none());
        assert!(log.is_truncated(a));
        assert!(!log.is_truncated(b));
    }
}
