//! A thin wrapper around the system RNG.
//!
//! Used to jitter view-change timeouts so correct replicas don't all fire
//! their timers in lockstep and flood the network with `VIEW_CHANGE`
//! messages at once.

use rand_core::{OsRng, RngCore};

/// Returns a `u64` drawn from the OS randomness source.
pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

/// Returns a jitter duration, in milliseconds, in `[0, max_ms)`.
pub fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        0
    } else {
        random_u64() % max_ms
    }
}
