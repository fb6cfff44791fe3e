//! This module contains the implementation details of `paxos-smr`.
//!
//! By default, it is hidden to the user, unless explicitly enabled
//! with the feature flag `expose_impl`.

pub mod acceptor;
pub mod async_runtime;
pub mod batcher;
pub mod catchup;
pub mod client;
pub mod collections;
pub mod communication;
pub mod core;
pub mod error;
pub mod executable;
pub mod log;
pub mod ordering;
pub mod proposer;
pub mod recovery;
pub mod snapshot;
pub mod timeouts;
