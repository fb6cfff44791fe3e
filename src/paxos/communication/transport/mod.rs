//! The `Transport` abstraction replicas use to exchange `SystemMessage`s,
//! plus an in-process `ChannelTransport` reference implementation.
//!
//! Grounded on the teacher crate's `communication::socket` split, which
//! lets a TCP/async-std socket and a (test-only) in-memory socket both
//! satisfy the same send/receive contract. Real TCP/UDP fabrics implement
//! `Transport` the same way; this crate ships only the in-process one,
//! since socket plumbing is an external collaborator (section 2).

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::paxos::communication::message::SystemMessage;
use crate::paxos::communication::NodeId;
use crate::paxos::error::*;

/// Sends and receives `SystemMessage`s among a fixed replica group.
/// Implementations own whatever socket/connection state is needed to
/// reach each peer; `send_to`/`broadcast` must not block on anything but
/// the local queuing of the message.
pub trait Transport: Send + Sync {
    fn send_to(&self, to: NodeId, message: SystemMessage) -> Result<()>;

    fn broadcast(&self, peers: &[NodeId], message: SystemMessage) -> Result<()> {
        for peer in peers {
            self.send_to(*peer, message.clone())?;
        }
        Ok(())
    }
}

/// A boxed `Transport`, cheap to clone and share between dispatcher
/// threads.
pub type TransportHandle = Arc<dyn Transport>;

/// An in-process `Transport` backed by one channel per destination node.
/// Used by tests and by the bundled demo to drive a full replica group
/// within a single process, without any real networking.
pub struct ChannelTransport {
    local: NodeId,
    senders: Vec<(NodeId, mpsc::Sender<(NodeId, SystemMessage)>)>,
}

/// A cloneable receiving end, since `mpsc::Receiver` alone is not `Clone`
/// and each node needs to hand its inbox handle to its own dispatcher
/// thread independently of `ChannelTransport::group`'s bookkeeping.
#[derive(Clone)]
pub struct Inbox(Arc<Mutex<mpsc::Receiver<(NodeId, SystemMessage)>>>);

impl Inbox {
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> std::result::Result<(NodeId, SystemMessage), mpsc::RecvTimeoutError> {
        self.0.lock().unwrap().recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> std::result::Result<(NodeId, SystemMessage), mpsc::TryRecvError> {
        self.0.lock().unwrap().try_recv()
    }
}

impl ChannelTransport {
    /// Builds one `ChannelTransport` per node in `ids`, each wired to
    /// every other node's inbox, and returns them alongside the `Inbox`
    /// each node should poll.
    pub fn group(ids: &[NodeId]) -> Vec<(Self, Inbox)> {
        let mut inboxes = Vec::with_capacity(ids.len());
        let mut senders_by_id = Vec::with_capacity(ids.len());
        for &id in ids {
            let (tx, rx) = mpsc::channel();
            inboxes.push((id, Inbox(Arc::new(Mutex::new(rx)))));
            senders_by_id.push((id, tx));
        }

        ids.iter()
            .map(|&local| {
                let senders = senders_by_id.clone();
                let transport = ChannelTransport { local, senders };
                let inbox = inboxes.iter().find(|(id, _)| *id == local).unwrap().1.clone();
                (transport, inbox)
            })
            .collect()
    }
}

impl Transport for ChannelTransport {
    fn send_to(&self, to: NodeId, message: SystemMessage) -> Result<()> {
        let (_, sender) = self
            .senders
            .iter()
            .find(|(id, _)| *id == to)
            .ok_or("no channel to destination node").simple(ErrorKind::Communication)?;
        sender.send((self.local, message)).simple(ErrorKind::TransientNetwork)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::communication::message::{AliveMessage, Header, SystemMessage};
    use crate::paxos::ordering::View;

    #[test]
    fn broadcasts_reach_every_peer_but_self() {
        let ids: Vec<NodeId> = (0..3).map(NodeId::from).collect();
        let mut group = ChannelTransport::group(&ids);
        let (leader, _leader_rx) = group.remove(0);

        leader
            .broadcast(&ids[1..], SystemMessage::Alive(AliveMessage { header: Header::new(ids[0], View::ZERO) }))
            .unwrap();

        for (_, rx) in group {
            let (from, _msg) = rx.recv_timeout(std::time::Duration::from_millis(200)).unwrap();
            assert_eq!(from, ids[0]);
        }
    }
}
