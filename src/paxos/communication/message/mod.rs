//! The wire message enum exchanged between replicas, and between a
//! replica and its clients.
//!
//! Grounded on the teacher crate's `communication::message::SystemMessage`
//! (a tagged enum carrying a `Header` plus a payload per consensus phase).
//! The phases differ — this protocol has Promise/Accept instead of
//! PRE-PREPARE/PREPARE/COMMIT — but the framing idiom, and the separation
//! between a cheap `Header` and a boxed payload, is the same.

use crate::paxos::batcher::{ClientBatch, ClientBatchId};
use crate::paxos::client::{ClientReply, ClientRequest};
use crate::paxos::communication::NodeId;
use crate::paxos::log::Snapshot;
use crate::paxos::ordering::{InstanceId, View};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Metadata common to every inter-replica message: who sent it, and under
/// which view it was sent. Kept separate from the payload so routing code
/// can inspect it without deserializing the (possibly large) body.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone)]
pub struct Header {
    pub from: NodeId,
    pub view: View,
}

impl Header {
    pub fn new(from: NodeId, view: View) -> Self {
        Self { from, view }
    }
}

/// A Promise request from the leader of `view`, asking acceptors to
/// abandon any earlier view (section 4.2, "Promise phase").
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub header: Header,
}

/// An acceptor's response to a `PrepareRequest`: either a promise,
/// optionally carrying the highest-view value it has already accepted for
/// instances at or above `first_uncommitted`, or a rejection naming the
/// higher view the acceptor has already promised.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub enum PrepareResponse {
    Promised { header: Header, accepted: Vec<AcceptedInstance> },
    Nack { header: Header, promised_view: View },
}

/// One previously-accepted `(instance, view, value)` triple returned in a
/// promise, so a new leader can safely re-propose it (section 4.3).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct AcceptedInstance {
    pub instance: InstanceId,
    pub view: View,
    pub value: Vec<u8>,
}

/// The leader's proposal for `instance`, sent once it holds a majority of
/// promises for `view` (section 4.3, "Propose").
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct ProposeRequest {
    pub header: Header,
    pub instance: InstanceId,
    pub value: Vec<u8>,
}

/// An acceptor's vote for `(instance, view, value)` (section 4.2, "Accept
/// phase"). Broadcast to every replica, not just the leader, so any
/// replica can independently detect a majority.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct AcceptMessage {
    pub header: Header,
    pub instance: InstanceId,
    pub value: Vec<u8>,
}

/// A leader's periodic liveness beacon, the absence of which triggers a
/// view change (section 4.3, "Leader liveness").
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct AliveMessage {
    pub header: Header,
}

/// A forwarded client batch (section 4.4(a)).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct ForwardClientBatch {
    pub header: Header,
    pub batch: ClientBatch,
}

/// Asks a peer to resume catch-up from `from_instance`, in either mode
/// (section 4.6).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct CatchUpQuery {
    pub header: Header,
    pub from_instance: InstanceId,
    /// Whether this query was raised by the idle `CheckCatchupTask`
    /// rather than by falling out of the window or retrying a stalled
    /// attempt. Echoed back on `CatchUpResponse` so the querier can tell
    /// the two empty-response cases apart (section 4.6).
    pub periodic: bool,
}

/// A batch of decided instances answering a `CatchUpQuery` in Normal mode.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct CatchUpResponse {
    pub header: Header,
    pub decided: Vec<DecidedInstance>,
    pub batch_ids: Vec<ClientBatchId>,
    pub periodic: bool,
}

#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct DecidedInstance {
    pub instance: InstanceId,
    pub view: View,
    pub value: Vec<u8>,
}

/// A full snapshot answering a `CatchUpQuery` in Snapshot mode, once the
/// gap to close is too large for Normal mode (section 4.6).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct CatchUpSnapshot {
    pub header: Header,
    pub snapshot: Snapshot,
}

/// A startup recovery query: "what view and log tail do you have?"
/// (section 4.8).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct RecoveryQuery {
    pub header: Header,
}

#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct RecoveryAnswer {
    pub header: Header,
    pub view: View,
    pub first_uncommitted: InstanceId,
}

/// Every inter-replica message this protocol exchanges.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub enum SystemMessage {
    Prepare(PrepareRequest),
    PrepareResponse(PrepareResponse),
    Propose(ProposeRequest),
    Accept(AcceptMessage),
    Alive(AliveMessage),
    ForwardClientBatch(ForwardClientBatch),
    CatchUpQuery(CatchUpQuery),
    CatchUpResponse(CatchUpResponse),
    CatchUpSnapshot(CatchUpSnapshot),
    RecoveryQuery(RecoveryQuery),
    RecoveryAnswer(RecoveryAnswer),
}

impl SystemMessage {
    pub fn header(&self) -> &Header {
        match self {
            SystemMessage::Prepare(m) => &m.header,
            SystemMessage::PrepareResponse(PrepareResponse::Promised { header, .. }) => header,
            SystemMessage::PrepareResponse(PrepareResponse::Nack { header, .. }) => header,
            SystemMessage::Propose(m) => &m.header,
            SystemMessage::Accept(m) => &m.header,
            SystemMessage::Alive(m) => &m.header,
            SystemMessage::ForwardClientBatch(m) => &m.header,
            SystemMessage::CatchUpQuery(m) => &m.header,
            SystemMessage::CatchUpResponse(m) => &m.header,
            SystemMessage::CatchUpSnapshot(m) => &m.header,
            SystemMessage::RecoveryQuery(m) => &m.header,
            SystemMessage::RecoveryAnswer(m) => &m.header,
        }
    }
}

/// A request originated by a client, as delivered from outside the
/// replica group.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Request(ClientRequest),
    Reply(ClientReply),
}

#[cfg(all(test, feature = "serialize_serde"))]
mod tests {
    use super::*;
    use crate::paxos::ordering::InstanceId;

    #[test]
    fn accept_message_round_trips_through_bincode() {
        let original = SystemMessage::Accept(AcceptMessage {
            header: Header::new(NodeId::from(1u32), View::from(4i64)),
            instance: InstanceId::from(9i64),
            value: b"decided value".to_vec(),
        });

        let encoded = bincode::serialize(&original).unwrap();
        let decoded: SystemMessage = bincode::deserialize(&encoded).unwrap();

        match (original, decoded) {
            (SystemMessage::Accept(a), SystemMessage::Accept(b)) => {
                assert_eq!(a.instance, b.instance);
                assert_eq!(a.value, b.value);
                assert_eq!(a.header.from, b.header.from);
            }
            _ => panic!("expected an Accept message to come back"),
        }
    }
}
