//! Error related business logic of `paxos-smr`.
//!
//! Follows the same shape as the teacher crate's error module: a single
//! `Error` type wrapping an `ErrorKind`, plus extension traits to attach a
//! kind to a foreign `Result`.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Extension of the standard library's `Result` type,
/// used to wrap its error in a `paxos_smr::error::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait is used in cases where we
/// want to drop the underlying error type in the `Result`, e.g. because it
/// doesn't implement `Send`.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Error {
    /// Returns an error not wrapping another error implementation, with
    /// kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        let inner = ErrorInner::Simple(kind);
        Error { inner }
    }

    /// Wraps an arbitrary error in an `Error`, with kind `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        let inner = ErrorInner::Wrapped(kind, e.into());
        Error { inner }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Swaps the `ErrorKind` of this `Error`.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }

    /// True for the error kinds section 7 of the design classifies as
    /// fatal: the replica should log at `error!` and halt rather than try
    /// to carry on with possibly-corrupted state.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::StorageIO | ErrorKind::ProtocolViolation)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(fmt, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(fmt, "{:?}: {}", k, e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::StorageIO, e)
    }
}

impl error::Error for Error {}

/// Tags an `Error` with the subsystem and nature of the failure.
///
/// Mirrors the error kinds enumerated in section 7 of the design, plus one
/// variant per module for internal bookkeeping failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// A send failed, or a write only partially completed. Transient:
    /// handled locally by retry or by lowering a catch-up peer's rating.
    TransientNetwork,
    /// A message referred to a lower view or an already-settled instance.
    /// Dropped silently wherever it is detected.
    StaleMessage,
    /// Two replicas decided the same instance with different values, or
    /// some other safety invariant was observed to be broken. Fatal.
    ProtocolViolation,
    /// A write to stable storage (view, snapshot) failed. Fatal: the
    /// replica halts rather than acknowledge an operation it cannot
    /// durably remember.
    StorageIO,
    /// A client command was malformed, unknown, or stale. Surfaced to the
    /// client as a NACK with a diagnostic string; never fatal.
    ClientError,
    /// The pending-request semaphore ran out of permits. The calling
    /// selector thread blocks; no request is ever dropped because of it.
    BackPressure,
    /// The startup recovery protocol has not yet reached a majority of
    /// answers. Affects liveness only.
    RecoveryStalled,
    Log,
    Acceptor,
    Proposer,
    Batcher,
    Client,
    CatchUp,
    Snapshot,
    Recovery,
    Communication,
    Executable,
}
