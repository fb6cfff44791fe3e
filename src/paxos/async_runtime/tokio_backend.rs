use std::future::Future;

use crate::paxos::error::*;

pub type JoinHandle<T> = ::tokio::task::JoinHandle<T>;
pub type Runtime = ::tokio::runtime::Runtime;

/// Builds a multi-threaded runtime with `num_threads` worker threads.
///
/// `num_threads == 0` lets tokio pick based on the number of CPUs, which
/// is how `replica.SelectorThreads = -1` ("auto") is realized.
pub fn build(num_threads: usize) -> Result<Runtime> {
    let mut builder = ::tokio::runtime::Builder::new_multi_thread();
    if num_threads > 0 {
        builder.worker_threads(num_threads);
    }
    builder
        .thread_name("paxos-smr-worker")
        .enable_all()
        .build()
        .wrapped(ErrorKind::Communication)
}

pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    ::tokio::task::spawn(future)
}
