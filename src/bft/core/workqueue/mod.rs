//! The typed work queues of §5: incoming client batches flow through a
//! new-txn queue into the fixed worker pool (which digests and verifies
//! each request), decided batches flow through an execution queue to the
//! executor thread, and completed checkpoints flow through a checkpoint
//! queue back to the core server loop. Each is a thin, named wrapper
//! around [`communication::channel`](crate::bft::communication::channel)
//! so the rest of the crate reads intent at the call site instead of a
//! bare channel type.

use crate::bft::communication::channel::{new_bounded, ChannelRx, ChannelTx};
use crate::bft::communication::message::ClientQuery;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::executable::UpdateBatch;

/// One request handed from the transport layer to a worker thread for
/// digesting and signature verification (§5).
pub struct NewTxnWork {
    pub from: NodeId,
    pub client_startts: u64,
    pub query: ClientQuery<Vec<u8>>,
}

pub fn new_txn_queue(bound: usize) -> (ChannelTx<NewTxnWork>, ChannelRx<NewTxnWork>) {
    new_bounded(bound)
}

/// A digested, verified request, ready for the batching assembler (§5,
/// §4.4).
pub struct WorkerResult {
    pub from: NodeId,
    pub client_startts: u64,
    pub digest: Digest,
    pub query: ClientQuery<Vec<u8>>,
}

pub fn worker_queue(bound: usize) -> (ChannelTx<WorkerResult>, ChannelRx<WorkerResult>) {
    new_bounded(bound)
}

/// A batch decided by the active ordering protocol, ready to execute.
pub struct ExecutionWork<O> {
    pub batch: UpdateBatch<O>,
    pub want_appstate: bool,
}

pub fn execution_queue<O>(bound: usize) -> (ChannelTx<ExecutionWork<O>>, ChannelRx<ExecutionWork<O>>) {
    new_bounded(bound)
}

/// A completed local checkpoint, ready to be gossiped as `CHECKPOINT`.
pub struct CheckpointWork {
    pub seq: crate::bft::ordering::SeqNo,
    pub state_digest: Digest,
}

pub fn checkpoint_queue(bound: usize) -> (ChannelTx<CheckpointWork>, ChannelRx<CheckpointWork>) {
    new_bounded(bound)
}
