//! `paxos-smr` is a crash-recoverable, leader-based Paxos state machine
//! replication library.
//!
//! The public surface is deliberately small: construct a [`paxos::core::Replica`]
//! per node, feed it inbound [`paxos::communication::message::SystemMessage`]s and
//! client requests, and drive its decided values through a
//! [`paxos::executable::Executor`] running your own [`paxos::executable::Service`].
//! Everything else — acceptors, proposers, catch-up, snapshots, recovery —
//! is implementation detail, exposed only behind the `expose_impl` feature
//! flag for testing and advanced embedding.

#[cfg(feature = "expose_impl")]
pub mod paxos;

#[cfg(not(feature = "expose_impl"))]
mod paxos;

pub use paxos::acceptor::Acceptor;
pub use paxos::batcher::{ClientBatchId, ClientRequestBatcher, CrashModel};
pub use paxos::catchup::CatchUp;
pub use paxos::client::{ClientProxy, ClientProxyHandle, ClientRequest, ClientRequestManager, Reply, RequestId};
pub use paxos::communication::message::SystemMessage;
pub use paxos::communication::transport::{ChannelTransport, Transport, TransportHandle};
pub use paxos::communication::{NodeId, ReplicaParams};
pub use paxos::core::{NetworkKind, Replica, ReplicaConfig};
pub use paxos::error::{Error, ErrorKind, Result};
pub use paxos::executable::{Executor, ExecutorHandle, Service, Update, UpdateSink};
pub use paxos::log::{Log, Snapshot};
pub use paxos::ordering::{InstanceId, View};
