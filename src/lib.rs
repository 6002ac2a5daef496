//! `concordbft` is a permissioned Byzantine fault tolerant replicated
//! state machine core.
//!
//! Clients submit request batches to a fixed set of `N = 3f + 1` replicas.
//! The core totally orders these batches and delivers them, in the same
//! order, to an application layer (see [`bft::executable`]). Three ordering
//! protocols are selectable at replica construction: a classical
//! three-phase leader protocol, a chained leader protocol, and a DAG-based
//! protocol. See [`bft::consensus`] for details.

pub mod bft;

pub use bft::{init, InitConfig, InitGuard};
