//! Thin wrapper over the async runtime in use, so the rest of the crate
//! does not depend on `tokio` directly. Mirrors the teacher crate's
//! `async_runtime` module, minus the `async-std` alternative backend.

#[cfg(feature = "async_runtime_tokio")]
mod tokio_backend;

#[cfg(feature = "async_runtime_tokio")]
pub use tokio_backend::*;
