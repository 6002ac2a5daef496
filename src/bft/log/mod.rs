//! The decision log and checkpointing machinery (§4.6): the durable
//! record of decided batches, the request bodies backing them, and the
//! stable-checkpoint/garbage-collection cycle that bounds its growth.

use std::sync::Arc;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use parking_lot::RwLock;

use crate::bft::collections::{self, HashMap, OrderedMap};
use crate::bft::communication::message::ClientQuery;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::{Orderable, SeqNo};

/// Default checkpoint period (§4.6): every `TXN_PER_CHKPT` decided
/// batches, the log is garbage-collected behind a new stable checkpoint.
/// Configurable via `ReplicaConfig::txn_per_checkpoint`; this constant is
/// only the factory default.
pub const DEFAULT_TXN_PER_CHKPT: u32 = 1000;

/// Information reported after appending a decided batch to the log.
pub enum Info {
    Nil,
    BeginCheckpoint,
}

/// `CHECKPOINT{seq, state_digest}` (§4.6, §6): a replica's claim about
/// the application state as of `seq`.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct CheckpointMessage {
    seq: SeqNo,
    state_digest: Digest,
}

impl CheckpointMessage {
    pub fn new(seq: SeqNo, state_digest: Digest) -> Self {
        Self { seq, state_digest }
    }

    pub fn state_digest(&self) -> &Digest {
        &self.state_digest
    }
}

impl Orderable for CheckpointMessage {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

enum CheckpointState<S> {
    None,
    Partial { seq: SeqNo },
    PartialWithEarlier { seq: SeqNo, earlier: Arc<ReadOnlyChkpt<S>> },
    Complete(Arc<ReadOnlyChkpt<S>>),
}

/// A stable checkpoint: the serialized application state as of `seq`,
/// together with the digest every correct replica should agree on.
pub struct ReadOnlyChkpt<S> {
    seq: SeqNo,
    app_state: S,
    digest: Digest,
}

impl<S> ReadOnlyChkpt<S> {
    pub fn sequence_number(&self) -> SeqNo {
        self.seq
    }

    pub fn state(&self) -> &S {
        &self.app_state
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// Tracks the stable-checkpoint state machine of §4.6: `None` until the
/// first checkpoint period elapses, `Partial` while this replica waits
/// for its own execution layer to serialize the state, `Complete` once a
/// quorum of matching `CHECKPOINT` messages has been observed.
pub struct Checkpoint<S> {
    state: CheckpointState<S>,
}

impl<S> Checkpoint<S> {
    pub fn new() -> Self {
        Self {
            state: CheckpointState::None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, CheckpointState::Complete(_))
    }

    pub fn stable(&self) -> Option<&Arc<ReadOnlyChkpt<S>>> {
        match &self.state {
            CheckpointState::Complete(c) => Some(c),
            CheckpointState::PartialWithEarlier { earlier, .. } => Some(earlier),
            _ => None,
        }
    }

    pub fn begin(&mut self, seq: SeqNo) {
        self.state = match std::mem::replace(&mut self.state, CheckpointState::None) {
            CheckpointState::Complete(earlier) => {
                CheckpointState::PartialWithEarlier { seq, earlier }
            }
            _ => CheckpointState::Partial { seq },
        };
    }

    /// Installs the locally serialized application state, completing the
    /// local half of the checkpoint; still needs a quorum of matching
    /// `CHECKPOINT` messages from peers to become `stable()`.
    pub fn finalize(&mut self, app_state: S, digest: Digest) {
        let seq = match &self.state {
            CheckpointState::Partial { seq } => *seq,
            CheckpointState::PartialWithEarlier { seq, .. } => *seq,
            _ => return,
        };
        self.state = CheckpointState::Complete(Arc::new(ReadOnlyChkpt {
            seq,
            app_state,
            digest,
        }));
    }
}

/// One decided batch, kept in the decision log until garbage-collected
/// behind a stable checkpoint.
#[derive(Clone)]
pub struct Decision {
    seq: SeqNo,
    digests: Vec<Digest>,
}

impl Decision {
    pub fn new(seq: SeqNo, digests: Vec<Digest>) -> Self {
        Self { seq, digests }
    }

    pub fn digests(&self) -> &[Digest] {
        &self.digests
    }
}

impl Orderable for Decision {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// The shared request pool and decision log (§4.6, §5's `TxnManager`):
/// request bodies are indexed by digest so every ordering protocol can
/// reference a batch by digest alone on the wire, and bodies survive
/// independently of which consensus instance first referenced them.
pub struct Log<S> {
    requests: RwLock<HashMap<Digest, (NodeId, ClientQuery<Vec<u8>>)>>,
    decided: RwLock<OrderedMap<SeqNo, Decision>>,
    low_watermark: RwLock<SeqNo>,
    checkpoint: RwLock<Checkpoint<S>>,
    txn_per_chkpt: u32,
}

/// The part of [`Log`] the ordering protocols need to know about: "is
/// this digest's body already known locally". Kept as a trait so
/// `consensus::classical`/`chained`/`dag` don't need to be generic over
/// the application state type `S` just to check request membership.
pub trait RequestPool {
    fn has_request(&self, digest: &Digest) -> bool;
}

impl<S> RequestPool for Log<S> {
    fn has_request(&self, digest: &Digest) -> bool {
        self.requests.read().contains_key(digest)
    }
}

impl<S> Log<S> {
    pub fn new(txn_per_chkpt: u32) -> Self {
        Self {
            requests: RwLock::new(collections::hash_map()),
            decided: RwLock::new(collections::ordered_map()),
            low_watermark: RwLock::new(SeqNo::ZERO),
            checkpoint: RwLock::new(Checkpoint::new()),
            txn_per_chkpt,
        }
    }

    pub fn insert_request(&self, digest: Digest, from: NodeId, query: ClientQuery<Vec<u8>>) {
        self.requests.write().insert(digest, (from, query));
    }

    pub fn has_request(&self, digest: &Digest) -> bool {
        self.requests.read().contains_key(digest)
    }

    pub fn get_request(&self, digest: &Digest) -> Option<(NodeId, ClientQuery<Vec<u8>>)> {
        self.requests.read().get(digest).cloned()
    }

    /// Appends a decided batch, returning whether the checkpoint period
    /// has now elapsed and a new stable checkpoint should begin (§4.6).
    pub fn finalize_batch(&self, seq: SeqNo, digests: Vec<Digest>) -> Info {
        self.decided.write().insert(seq, Decision::new(seq, digests));
        let low = *self.low_watermark.read();
        let offset = seq.index(low, i32::MAX).right().map(|i| i as u32).unwrap_or(0);
        if offset + 1 >= self.txn_per_chkpt {
            Info::BeginCheckpoint
        } else {
            Info::Nil
        }
    }

    pub fn begin_checkpoint(&self, seq: SeqNo) {
        self.checkpoint.write().begin(seq);
    }

    pub fn finalize_checkpoint(&self, app_state: S, digest: Digest) {
        self.checkpoint.write().finalize(app_state, digest);
    }

    pub fn checkpoint_is_complete(&self) -> bool {
        self.checkpoint.read().is_complete()
    }

    /// Garbage-collects every decision below `new_low`, and releases the
    /// corresponding request bodies back for reuse by the txn pool
    /// (§5's `TxnManager::release`), once a quorum of `CHECKPOINT`
    /// messages confirms `new_low` as the new stable watermark.
    pub fn prune_below(&self, new_low: SeqNo) -> Vec<Digest> {
        // §8: the stable checkpoint never moves backwards — a stale or
        // duplicated checkpoint vote arriving after a later one already
        // advanced the watermark must be a no-op.
        if new_low <= *self.low_watermark.read() {
            return Vec::new();
        }

        let mut decided = self.decided.write();
        let to_drop: Vec<Digest> = decided
            .iter()
            .filter(|(seq, _)| **seq < new_low)
            .flat_map(|(_, d)| d.digests().to_vec())
            .collect();

        let stale_seqs: Vec<SeqNo> = decided
            .iter()
            .filter(|(seq, _)| **seq < new_low)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in stale_seqs {
            decided.remove(&seq);
        }
        drop(decided);

        let mut requests = self.requests.write();
        for digest in &to_drop {
            requests.remove(digest);
        }

        *self.low_watermark.write() = new_low;
        to_drop
    }

    pub fn low_watermark(&self) -> SeqNo {
        *self.low_watermark.read()
    }

    pub fn high_watermark(&self) -> SeqNo {
        self.low_watermark().add(self.txn_per_chkpt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::hash::digest;

    fn log() -> Log<()> {
        Log::new(DEFAULT_TXN_PER_CHKPT)
    }

    fn query() -> ClientQuery<Vec<u8>> {
        ClientQuery {
            client_id: NodeId::from(0u32),
            client_startts: 0,
            operation: Vec::new(),
        }
    }

    #[test]
    fn prune_below_drops_only_stale_decisions_and_their_requests() {
        let log = log();
        let kept = digest(b"kept");
        let dropped = digest(b"dropped");
        log.insert_request(dropped.clone(), NodeId::from(0u32), query());
        log.insert_request(kept.clone(), NodeId::from(0u32), query());

        log.finalize_batch(SeqNo::from(1u32), vec![dropped.clone()]);
        log.finalize_batch(SeqNo::from(2u32), vec![kept.clone()]);

        let released = log.prune_below(SeqNo::from(2u32));
        assert_eq!(released, vec![dropped.clone()]);
        assert!(!log.has_request(&dropped));
        assert!(log.has_request(&kept));
        assert_eq!(log.low_watermark(), SeqNo::from(2u32));
    }

    #[test]
    fn finalize_batch_signals_checkpoint_at_period_boundary() {
        let log = Log::<()>::new(2);
        assert!(matches!(log.finalize_batch(SeqNo::from(1u32), vec![]), Info::Nil));
        assert!(matches!(
            log.finalize_batch(SeqNo::from(2u32), vec![]),
            Info::BeginCheckpoint
        ));
    }

    #[test]
    fn checkpoint_becomes_stable_only_after_finalize() {
        let mut checkpoint: Checkpoint<Vec<u8>> = Checkpoint::new();
        assert!(checkpoint.stable().is_none());

        checkpoint.begin(SeqNo::from(5u32));
        assert!(!checkpoint.is_complete());

        checkpoint.finalize(vec![1, 2, 3], digest(b"state"));
        assert!(checkpoint.is_complete());
        assert_eq!(checkpoint.stable().unwrap().sequence_number(), SeqNo::from(5u32));
    }
}
