//! The replica-apply dispatcher: a single-threaded, serial worker that
//! applies decided values to the user's state machine and emits replies
//! (section 4, threading model: "a separate replica-apply dispatcher").
//!
//! Grounded on the teacher crate's `executable::{Service, Executor,
//! ExecutorHandle}` triad, generalized from `bafomet`'s serialized
//! `SharedData` types to plain byte payloads, since the wire codec for
//! application state/requests is an external collaborator here (section 2).

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::paxos::client::{ClientRequestManager, Reply, RequestId};
use crate::paxos::error::*;

/// User-defined application logic. The state type is left entirely to
/// the implementer; this crate only needs to feed it requests in
/// decided order and collect the resulting replies.
pub trait Service: Send + 'static {
    type State: Clone + Send + 'static;

    /// Returns the application's state before any request has been
    /// applied.
    fn initial_state(&mut self) -> Result<Self::State>;

    /// Applies one request to `state`, returning the reply payload.
    fn update(&mut self, state: &mut Self::State, request: &[u8]) -> Vec<u8>;
}

/// One decided request, in delivery order, paired with the id replies
/// are addressed back to.
pub struct Update {
    pub request_id: RequestId,
    pub payload: Vec<u8>,
}

enum ExecutionRequest<St> {
    InstallState(St),
    Apply(Vec<Update>),
    GetStateForSnapshot(mpsc::Sender<St>),
}

/// Owns the user `Service` and its state; runs on its own thread, driven
/// by messages posted from the consensus dispatcher.
pub struct Executor<S: Service> {
    service: S,
    state: S::State,
    inbox: mpsc::Receiver<ExecutionRequest<S::State>>,
    client_manager: Arc<ClientRequestManager>,
}

/// Type-erased view of `ExecutorHandle<St>`'s `apply`, so the consensus
/// dispatcher (which does not know, or care, what `St` is) can hold one
/// without becoming generic itself.
pub trait UpdateSink: Send + Sync {
    fn apply(&self, updates: Vec<Update>) -> Result<()>;
}

/// A cheap, cloneable handle the consensus dispatcher uses to hand
/// decided batches to the executor thread.
pub struct ExecutorHandle<St> {
    outbox: mpsc::Sender<ExecutionRequest<St>>,
}

impl<St: Send + 'static> UpdateSink for ExecutorHandle<St> {
    fn apply(&self, updates: Vec<Update>) -> Result<()> {
        ExecutorHandle::apply(self, updates)
    }
}

impl<St> Clone for ExecutorHandle<St> {
    fn clone(&self) -> Self {
        Self { outbox: self.outbox.clone() }
    }
}

impl<St: Send + 'static> ExecutorHandle<St> {
    /// Installs state recovered via catch-up/recovery, replacing
    /// whatever the executor currently holds.
    pub fn install_state(&self, state: St) -> Result<()> {
        self.outbox.send(ExecutionRequest::InstallState(state)).simple(ErrorKind::Executable)
    }

    /// Queues a batch of decided requests for serial application.
    pub fn apply(&self, updates: Vec<Update>) -> Result<()> {
        self.outbox.send(ExecutionRequest::Apply(updates)).simple(ErrorKind::Executable)
    }

    /// Requests a copy of the current application state, for use when
    /// building a `Snapshot`. Blocks the caller until the executor
    /// thread answers, since a snapshot must reflect a specific point in
    /// the decided sequence, not a racing one.
    pub fn get_state_for_snapshot(&self) -> Result<St> {
        let (tx, rx) = mpsc::channel();
        self.outbox
            .send(ExecutionRequest::GetStateForSnapshot(tx))
            .simple(ErrorKind::Executable)?;
        rx.recv().simple(ErrorKind::Executable)
    }
}

impl<S> Executor<S>
where
    S: Service,
{
    /// Spawns the executor on its own OS thread, wiring its replies back
    /// through `client_manager`.
    pub fn spawn(mut service: S, client_manager: Arc<ClientRequestManager>) -> Result<ExecutorHandle<S::State>> {
        let (outbox, inbox) = mpsc::channel();
        let state = service.initial_state()?;

        let mut executor = Executor { service, state, inbox, client_manager };
        thread::Builder::new()
            .name("paxos-smr-executor".to_owned())
            .spawn(move || executor.run())
            .wrapped(ErrorKind::Executable)?;

        Ok(ExecutorHandle { outbox })
    }

    fn run(&mut self) {
        while let Ok(request) = self.inbox.recv() {
            match request {
                ExecutionRequest::InstallState(state) => {
                    self.state = state;
                }
                ExecutionRequest::Apply(updates) => {
                    for update in updates {
                        let payload = self.service.update(&mut self.state, &update.payload);
                        self.client_manager
                            .on_request_executed(update.request_id, Reply::new(update.request_id, payload));
                    }
                }
                ExecutionRequest::GetStateForSnapshot(reply_to) => {
                    let _ = reply_to.send(self.state.clone());
                }
            }
        }
        log::info!("executor channel closed, thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::client::{ClientProxy, ClientReply};

    struct Counter;

    impl Service for Counter {
        type State = i64;

        fn initial_state(&mut self) -> Result<i64> {
            Ok(0)
        }

        fn update(&mut self, state: &mut i64, request: &[u8]) -> Vec<u8> {
            let delta = i64::from_le_bytes(request.try_into().unwrap());
            *state += delta;
            state.to_le_bytes().to_vec()
        }
    }

    struct NoopProxy;
    impl ClientProxy for NoopProxy {
        fn send_reply(&self, _reply: ClientReply) {}
    }

    #[test]
    fn applies_updates_in_order_and_emits_replies() {
        let client_manager = Arc::new(ClientRequestManager::new(8));
        let handle = Executor::spawn(Counter, client_manager.clone()).unwrap();

        let req_id = RequestId::new(1, 1);
        client_manager.admit_blocking(
            crate::paxos::client::ClientRequest::new(req_id, 5i64.to_le_bytes().to_vec()),
            Arc::new(NoopProxy),
        );

        handle
            .apply(vec![Update { request_id: req_id, payload: 5i64.to_le_bytes().to_vec() }])
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(client_manager.available_permits(), 8);
    }
}
