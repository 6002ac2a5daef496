//! Transport socket backends, selected by the `socket_*` feature flags
//! (§4.1). The default backend is plain Tokio TCP — no TLS: message
//! integrity and authentication are handled entirely by the sign/verify
//! discipline of §4.2, not by the transport.

#[cfg(feature = "socket_tokio_tcp")]
mod tokio_tcp;

#[cfg(feature = "socket_tokio_tcp")]
pub use self::tokio_tcp::{bind, connect, Listener, Socket};

#[cfg(feature = "socket_async_std_tcp")]
mod async_std_tcp;

#[cfg(feature = "socket_async_std_tcp")]
pub use self::async_std_tcp::{bind, connect, Listener, Socket};
