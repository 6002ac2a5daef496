//! Pluggable ordering protocols, selected by `ORDERING_PROTOCOL` (§3,
//! §6): [`classical`] (PBFT-style pre-prepare/prepare/commit),
//! [`chained`] (pipelined HotStuff-style leader rotation) and [`dag`]
//! (block-DAG with wave-leader commit and themis fairness).
//!
//! All three share the same [`ordering::SeqNo`](crate::bft::ordering::SeqNo)
//! allocation discipline and batch digesting (§3); what differs is how a
//! batch becomes certified. `Protocol` is the dispatch enum the core
//! server holds, generalized from a single `Consensus<S>` instance to
//! dispatch across all three variants instead of just the classical one.

pub mod chained;
pub mod classical;
pub mod dag;

/// Which ordering protocol a replica is configured to run (§6's
/// `ORDERING_PROTOCOL` config key).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OrderingProtocol {
    Classical,
    Chained,
    Dag,
}

impl std::str::FromStr for OrderingProtocol {
    type Err = crate::bft::error::Error;

    fn from_str(s: &str) -> crate::bft::error::Result<Self> {
        use crate::bft::error::*;
        match s {
            "classical" | "pbft" => Ok(OrderingProtocol::Classical),
            "chained" | "hotstuff" => Ok(OrderingProtocol::Chained),
            "dag" => Ok(OrderingProtocol::Dag),
            _ => Err("Unknown ordering protocol").wrapped(ErrorKind::Consensus),
        }
    }
}

/// Owns exactly one of the three protocol state machines, dispatching to
/// it uniformly for the parts of `core::server`'s main loop that don't
/// care which variant is active (instance bookkeeping, signalling).
pub enum Protocol {
    Classical(classical::Consensus),
    Chained(chained::Chain),
    Dag(dag::Dag),
}

impl Protocol {
    pub fn new(kind: OrderingProtocol, initial_seq_no: crate::bft::ordering::SeqNo, window: i32) -> Self {
        match kind {
            OrderingProtocol::Classical => Protocol::Classical(classical::Consensus::new(initial_seq_no, window)),
            OrderingProtocol::Chained => Protocol::Chained(chained::Chain::new()),
            OrderingProtocol::Dag => Protocol::Dag(dag::Dag::new()),
        }
    }
}
