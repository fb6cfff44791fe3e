//! Client request admission: at-most-once semantics, pending-proxy
//! bookkeeping, and the back-pressure semaphore.
//!
//! Grounded on the teacher crate's `executable::Update`/`UpdateReply` shape
//! (a request tagged with its origin, a reply tagged with its destination)
//! and on the single-threaded-dispatcher / multi-threaded-selector split
//! described in section 5 of the design: `pending_proxies` is the one map
//! selector threads insert into and the dispatcher removes from.

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::paxos::collections::{self, HashMap, IntMap};
use crate::paxos::communication::NodeId;
use crate::paxos::error::*;

/// Maximum number of client requests that may be admitted but not yet
/// executed, system-wide. Back-pressure point named in section 4.4.
pub const MAX_PENDING_REQUESTS: usize = 1024;

/// Identifies a single client request: the client that issued it, and the
/// sequence number that client attached to it.
#[cfg_attr(feature = "serialize_serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RequestId {
    pub client_id: u64,
    pub seq: i32,
}

impl RequestId {
    pub fn new(client_id: u64, seq: i32) -> Self {
        Self { client_id, seq }
    }
}

/// A single client request: an opaque operation payload tagged with its
/// `RequestId`.
#[cfg_attr(feature = "serialize_serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub id: RequestId,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    pub payload: Vec<u8>,
}

impl ClientRequest {
    pub fn new(id: RequestId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Rough wire size, used by the batcher to bound batch byte size.
    pub fn byte_size(&self) -> usize {
        16 + self.payload.len()
    }
}

/// A reply to a previously-submitted client request.
#[cfg_attr(feature = "serialize_serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct Reply {
    pub request_id: RequestId,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn new(request_id: RequestId, payload: Vec<u8>) -> Self {
        Self { request_id, payload }
    }
}

/// Status returned to a client for a given command.
#[cfg_attr(feature = "serialize_serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReplyStatus {
    Ok,
    Nack,
    Redirect,
    Busy,
}

/// A reply as seen over the wire: a status plus payload (the leader id,
/// serialized, in the `Redirect` case).
#[cfg_attr(feature = "serialize_serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ClientReply {
    pub status: ReplyStatus,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    pub payload: Vec<u8>,
}

impl ClientReply {
    pub fn ok(reply: Reply) -> Self {
        Self { status: ReplyStatus::Ok, payload: reply.payload }
    }

    pub fn nack(msg: impl Into<String>) -> Self {
        Self { status: ReplyStatus::Nack, payload: msg.into().into_bytes() }
    }

    pub fn redirect(leader: NodeId) -> Self {
        Self {
            status: ReplyStatus::Redirect,
            payload: u32::from(leader).to_le_bytes().to_vec(),
        }
    }

    pub fn busy() -> Self {
        Self { status: ReplyStatus::Busy, payload: Vec::new() }
    }
}

/// A handle a selector thread uses to deliver a `ClientReply` back to
/// whichever connection originated the request. The concrete delivery
/// mechanism (write to a TCP socket) is external; this crate only needs
/// somewhere to post the computed reply to.
pub trait ClientProxy: Send + Sync {
    fn send_reply(&self, reply: ClientReply);
}

/// A boxed `ClientProxy`, cheap to clone and pass between threads.
pub type ClientProxyHandle = Arc<dyn ClientProxy>;

/// Outcome of submitting a command to the `ClientRequestManager`.
pub enum Admission {
    /// The request was admitted; it has been forwarded to the batcher.
    /// The proxy will be invoked later, from `on_request_executed`.
    Admitted,
    /// The request was already known: answer immediately with the cached
    /// reply.
    Cached(ClientReply),
}

/// Tracks, per client, the most recent request admitted and (once
/// computed) its reply. Shared between the dispatcher (writer) and
/// whichever component serves reads for catch-up/snapshotting (reader).
/// Keyed by the raw client id, so this is one of the tables the teacher
/// crate backs with `intmap` instead of a general-purpose hash map.
struct LastReplies {
    inner: IntMap<(RequestId, Option<Reply>)>,
}

impl Default for LastReplies {
    fn default() -> Self {
        Self { inner: IntMap::new() }
    }
}

impl LastReplies {
    fn get(&self, client_id: u64) -> Option<&(RequestId, Option<Reply>)> {
        self.inner.get(client_id)
    }
}

/// Admits client commands, enforces at-most-once, and back-pressures
/// admission via a counting semaphore.
pub struct ClientRequestManager {
    last_replies: Mutex<LastReplies>,
    pending_proxies: Mutex<HashMap<RequestId, ClientProxyHandle>>,
    permits: Arc<AtomicUsize>,
    max_pending: usize,
}

impl ClientRequestManager {
    pub fn new(max_pending: usize) -> Self {
        Self {
            last_replies: Mutex::new(LastReplies::default()),
            pending_proxies: Mutex::new(collections::hash_map()),
            permits: Arc::new(AtomicUsize::new(max_pending)),
            max_pending,
        }
    }

    /// Number of pending-request permits still available. Exposed for
    /// tests that exercise back-pressure (scenario S6).
    pub fn available_permits(&self) -> usize {
        self.permits.load(AtomicOrdering::SeqCst)
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Tries to acquire one pending-request permit without blocking.
    /// Returns `false` if none are available; the caller (a selector
    /// thread) is responsible for blocking/retrying, since the manager
    /// itself must not drop a request (`ErrorKind::BackPressure` is a
    /// liveness concern, not a correctness one).
    fn try_acquire(&self) -> bool {
        loop {
            let current = self.permits.load(AtomicOrdering::SeqCst);
            if current == 0 {
                return false;
            }
            if self
                .permits
                .compare_exchange(
                    current,
                    current - 1,
                    AtomicOrdering::SeqCst,
                    AtomicOrdering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self) {
        self.permits.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// Admits `request` on behalf of `proxy`. Blocks the calling thread
    /// (via a spin-yield loop, since this is called from ordinary
    /// non-async selector threads) until a permit is free, per section 5:
    /// "Selector threads block on the pending-request semaphore ... this
    /// is the only back-pressure point".
    pub fn admit_blocking(&self, request: ClientRequest, proxy: ClientProxyHandle) -> Admission {
        match self.check_duplicate(&request) {
            Some(outcome) => return outcome,
            None => {}
        }

        while !self.try_acquire() {
            std::thread::yield_now();
        }

        self.pending_proxies.lock().insert(request.id, proxy);
        Admission::Admitted
    }

    /// Non-blocking admission check used by async selector tasks: returns
    /// `None` if a permit isn't immediately available, so the caller can
    /// await and retry instead of blocking its executor thread.
    pub fn try_admit(&self, request: &ClientRequest, proxy: ClientProxyHandle) -> Option<Admission> {
        if let Some(outcome) = self.check_duplicate(request) {
            return Some(outcome);
        }
        if !self.try_acquire() {
            return None;
        }
        self.pending_proxies.lock().insert(request.id, proxy);
        Some(Admission::Admitted)
    }

    fn check_duplicate(&self, request: &ClientRequest) -> Option<Admission> {
        let last_replies = self.last_replies.lock();
        match last_replies.get(request.id.client_id) {
            None => None,
            Some((prior_id, _)) if request.id.seq > prior_id.seq => None,
            Some((prior_id, reply)) if *prior_id == request.id => match reply {
                Some(r) => Some(Admission::Cached(ClientReply::ok(r.clone()))),
                // same request, still executing: the proxy already on
                // file will receive the reply once it is ready.
                None => Some(Admission::Admitted),
            },
            Some((prior_id, _)) => Some(Admission::Cached(ClientReply::nack(format!(
                "Request too old: client {} is already at seq {}",
                request.id.client_id, prior_id.seq,
            )))),
        }
    }

    /// Called on the dispatcher once `request` has been executed by the
    /// state machine and `reply` computed. Removes the pending proxy,
    /// releases its permit, and (if this replica originated the request)
    /// delivers the reply.
    pub fn on_request_executed(&self, request_id: RequestId, reply: Reply) {
        {
            let mut last_replies = self.last_replies.lock();
            let should_update = last_replies
                .inner
                .get(request_id.client_id)
                .map(|(prior, _)| prior.seq <= request_id.seq)
                .unwrap_or(true);
            if should_update {
                last_replies.inner.insert(request_id.client_id, (request_id, Some(reply.clone())));
            }
        }

        let proxy = self.pending_proxies.lock().remove(&request_id);
        self.release();

        // a reply computed for a request this replica never fielded has
        // no proxy to send to: it is simply dropped, as section 4.5 says.
        if let Some(proxy) = proxy {
            proxy.send_reply(ClientReply::ok(reply));
        }
    }

    /// Seeds the at-most-once cache from an installed snapshot.
    pub fn install_last_replies(&self, replies: HashMap<u64, Reply>) {
        let mut map = IntMap::new();
        for (client_id, reply) in replies {
            map.insert(client_id, (reply.request_id, Some(reply)));
        }
        self.last_replies.lock().inner = map;
    }

    /// Snapshots the at-most-once cache for inclusion in a `Snapshot`.
    pub fn snapshot_last_replies(&self) -> HashMap<u64, Reply> {
        self.last_replies
            .lock()
            .inner
            .iter()
            .filter_map(|(client_id, (_, reply))| reply.clone().map(|r| (client_id, r)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct TestProxy(Arc<Mutex<Option<ClientReply>>>);

    impl ClientProxy for TestProxy {
        fn send_reply(&self, reply: ClientReply) {
            *self.0.lock() = Some(reply);
        }
    }

    fn proxy() -> (ClientProxyHandle, Arc<Mutex<Option<ClientReply>>>) {
        let slot = Arc::new(Mutex::new(None));
        (Arc::new(TestProxy(slot.clone())), slot)
    }

    #[test]
    fn admits_new_request() {
        let mgr = ClientRequestManager::new(4);
        let (p, _slot) = proxy();
        let req = ClientRequest::new(RequestId::new(1, 1), b"A".to_vec());
        match mgr.admit_blocking(req, p) {
            Admission::Admitted => {}
            Admission::Cached(_) => panic!("should not be cached"),
        }
        assert_eq!(mgr.available_permits(), 3);
    }

    #[test]
    fn dedups_same_seq() {
        let mgr = ClientRequestManager::new(4);
        let (p, slot) = proxy();
        let req = ClientRequest::new(RequestId::new(1, 1), b"A".to_vec());
        mgr.admit_blocking(req.clone(), p.clone());
        mgr.on_request_executed(req.id, Reply::new(req.id, b"A!".to_vec()));

        match mgr.admit_blocking(req, p) {
            Admission::Cached(r) => assert_eq!(r.payload, b"A!".to_vec()),
            Admission::Admitted => panic!("should be cached"),
        }
        assert!(slot.lock().is_none(), "cached replies bypass the proxy");
    }

    #[test]
    fn nacks_stale_seq() {
        let mgr = ClientRequestManager::new(4);
        let (p, _slot) = proxy();
        let req1 = ClientRequest::new(RequestId::new(1, 2), b"A".to_vec());
        mgr.admit_blocking(req1.clone(), p.clone());
        mgr.on_request_executed(req1.id, Reply::new(req1.id, b"A!".to_vec()));

        let stale = ClientRequest::new(RequestId::new(1, 1), b"B".to_vec());
        match mgr.admit_blocking(stale, p) {
            Admission::Cached(r) => assert_eq!(r.status, ReplyStatus::Nack),
            Admission::Admitted => panic!("should be nacked"),
        }
    }

    #[test]
    fn releases_permit_on_execution() {
        let mgr = Arc::new(ClientRequestManager::new(1));
        let (p, _slot) = proxy();
        let req = ClientRequest::new(RequestId::new(1, 1), b"A".to_vec());
        mgr.admit_blocking(req.clone(), p.clone());
        assert_eq!(mgr.available_permits(), 0);

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let mgr2 = mgr.clone();
        let req2 = ClientRequest::new(RequestId::new(2, 1), b"B".to_vec());
        let handle = std::thread::spawn(move || {
            mgr2.admit_blocking(req2, proxy().0);
            done2.store(true, AtomicOrdering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!done.load(AtomicOrdering::SeqCst), "should still be blocked");

        mgr.on_request_executed(req.id, Reply::new(req.id, b"A!".to_vec()));
        handle.join().unwrap();
        assert!(done.load(AtomicOrdering::SeqCst));
    }
}
