//! Pluggable async runtime, selected at build time by the
//! `async_runtime_*` feature flags. Only used by the transport layer
//! (§4.1); every other component in this crate runs on a plain OS thread,
//! per §5's "Scheduling model".

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

#[cfg(feature = "async_runtime_tokio")]
pub use self::tokio::{block_on, drop, init, spawn, JoinHandle, Runtime};
