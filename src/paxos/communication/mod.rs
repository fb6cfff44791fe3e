//! Communication primitives: process identity, the wire message enum,
//! the `Transport` trait, and the dispatcher-facing `Node` handle.
//!
//! Per section 9's note on "network/dispatcher glue (interfaces only)",
//! this module defines interfaces and a reference in-process transport;
//! real TCP/UDP fabrics are external collaborators implementing the same
//! `Transport` trait, the way `bafomet::bft::communication::socket` swaps
//! transports behind a cargo feature.

pub mod message;
pub mod transport;

use std::fmt;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// A `NodeId` identifies a replica process among the fixed set of `N`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator.into_iter().map(Self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(id: u32) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for usize {
    #[inline]
    fn from(id: NodeId) -> usize {
        id.0 as usize
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

/// Static parameters of the replica group: its size and the local id.
/// Threaded explicitly through component construction rather than kept
/// as a `ProcessDescriptor` global, per DESIGN.md's resolution of the
/// "singletons" design note.
#[derive(Copy, Clone, Debug)]
pub struct ReplicaParams {
    n: usize,
    local: NodeId,
}

impl ReplicaParams {
    pub fn new(n: usize, local: NodeId) -> Self {
        assert!(n > 0, "a replica group needs at least one member");
        assert!(usize::from(local) < n, "local id out of range");
        Self { n, local }
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// `majority = floor((n+1)/2)`.
    #[inline]
    pub fn majority(&self) -> usize {
        (self.n + 1) / 2
    }

    /// `leaderOf(view) = view mod n`.
    #[inline]
    pub fn leader_of(&self, view: crate::paxos::ordering::View) -> NodeId {
        let view: i64 = view.into();
        let n = self.n as i64;
        NodeId::from((view.rem_euclid(n)) as u32)
    }

    #[inline]
    pub fn is_local_leader(&self, view: crate::paxos::ordering::View) -> bool {
        self.leader_of(view) == self.local
    }

    pub fn all_ids(&self) -> impl Iterator<Item = NodeId> {
        NodeId::targets(0..self.n as u32)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.all_ids().filter(move |id| *id != self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::ordering::View;

    #[test]
    fn majority_matches_spec_formula() {
        assert_eq!(ReplicaParams::new(3, NodeId::from(0u32)).majority(), 2);
        assert_eq!(ReplicaParams::new(4, NodeId::from(0u32)).majority(), 2);
        assert_eq!(ReplicaParams::new(5, NodeId::from(0u32)).majority(), 3);
    }

    #[test]
    fn leader_rotates_with_view() {
        let params = ReplicaParams::new(3, NodeId::from(0u32));
        assert_eq!(params.leader_of(View::from(0i64)), NodeId::from(0u32));
        assert_eq!(params.leader_of(View::from(1i64)), NodeId::from(1u32));
        assert_eq!(params.leader_of(View::from(3i64)), NodeId::from(0u32));
    }
}
