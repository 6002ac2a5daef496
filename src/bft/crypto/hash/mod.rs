//! Hashing primitives, selected at build time by the `crypto_hash_*`
//! feature flags.

#[cfg(feature = "crypto_hash_ring_sha2")]
mod ring_sha2;

#[cfg(feature = "crypto_hash_ring_sha2")]
pub use ring_sha2::{digest, Context, Digest};
