//! Collaborative state transfer (§4.8): lets a replica that has fallen
//! behind (crash recovery, or simply missed too many rounds to catch up
//! by message replay alone) fetch a recent stable checkpoint plus the
//! handful of batches decided since, from its peers.
//!
//! This crate's checkpoint/log model (§4.6) already keeps the tail of
//! decided batches around, so CST only needs to transfer a
//! `Checkpoint<S>` and replay the requests after it, not a full
//! decision-log reconstruction. Based on «On the Efficiency of Durable
//! State Machine Replication» (Bessani et al.).

use crate::bft::collections::{self, HashMap};
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::executable::{ExecutorHandle, Request, Service, State};
use crate::bft::log::ReadOnlyChkpt;
use crate::bft::ordering::SeqNo;

/// Progress of an in-flight catch-up attempt.
pub enum ProtoPhase {
    Init,
    ReceivingCid(usize),
    ReceivingState(usize),
}

/// What a peer replied with when asked "what's your latest checkpoint".
#[derive(Clone)]
pub struct CidReply {
    pub seq: SeqNo,
    pub state_digest: Digest,
}

/// A complete recovery package: a stable checkpoint plus the batch
/// bodies decided since, ready to hand to the execution layer in order.
pub struct RecoveryState<S> {
    checkpoint: std::sync::Arc<ReadOnlyChkpt<S>>,
    tail_requests: Vec<Vec<u8>>,
}

impl<S> RecoveryState<S> {
    pub fn new(checkpoint: std::sync::Arc<ReadOnlyChkpt<S>>, tail_requests: Vec<Vec<u8>>) -> Self {
        Self {
            checkpoint,
            tail_requests,
        }
    }

    pub fn sequence_number(&self) -> SeqNo {
        self.checkpoint.sequence_number()
    }
}

/// Outcome of processing a peer's response during catch-up.
pub enum CstStatus<S> {
    Nil,
    RequestLatestCid,
    RequestState,
    SeqNo(SeqNo),
    State(RecoveryState<S>),
}

/// Drives one replica's catch-up attempt: ask every peer for its latest
/// stable checkpoint id, wait for `2f+1` matching replies, then fetch the
/// actual state from any one respondent (§4.8).
pub struct CollabStateTransfer<S> {
    phase: ProtoPhase,
    latest_cid: HashMap<SeqNo, usize>,
    _marker: std::marker::PhantomData<S>,
}

impl<S> CollabStateTransfer<S> {
    pub fn new() -> Self {
        Self {
            phase: ProtoPhase::Init,
            latest_cid: collections::hash_map(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn request_latest_consensus_seq(&mut self) {
        self.phase = ProtoPhase::ReceivingCid(0);
        self.latest_cid.clear();
    }

    /// Records one peer's `CidReply`; once `quorum` replicas agree on the
    /// same sequence number, returns it as the target to fetch.
    pub fn process_cid_reply(&mut self, reply: CidReply, quorum: usize) -> CstStatus<S> {
        let count = self.latest_cid.entry(reply.seq).or_insert(0);
        *count += 1;
        if *count >= quorum {
            self.phase = ProtoPhase::ReceivingState(0);
            CstStatus::SeqNo(reply.seq)
        } else {
            CstStatus::Nil
        }
    }
}

/// Installs a fetched `RecoveryState` into the execution layer, replaying
/// the tail of decided requests on top of the checkpoint body (§4.8's
/// "replay to make up the difference").
pub fn install_recovery_state<S>(
    recovery_state: RecoveryState<State<S>>,
    executor: &ExecutorHandle<S>,
    decode: impl Fn(&[u8]) -> Request<S>,
) -> Result<()>
where
    S: Service + Send + 'static,
    State<S>: Send + Clone + 'static,
    Request<S>: Send + 'static,
{
    let state = recovery_state.checkpoint.state().clone();
    let requests = recovery_state
        .tail_requests
        .iter()
        .map(|bytes| decode(bytes))
        .collect();
    executor.install_state(state, requests)
}
