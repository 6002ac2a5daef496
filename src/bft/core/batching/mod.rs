//! Batch assembly (§4.4): accumulates digested, verified requests until
//! either `max_batch_size` is reached or the batch timer elapses,
//! whichever comes first, then hands the accumulated digests to the
//! active ordering protocol for proposal.

use std::time::Duration;

use crate::bft::communication::message::ClientQuery;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;

/// One request waiting inside the current, not-yet-proposed batch.
struct Pending {
    from: NodeId,
    client_startts: u64,
    digest: Digest,
    query: ClientQuery<Vec<u8>>,
}

/// Accumulates requests for the next proposal.
pub struct BatchAssembler {
    max_batch_size: usize,
    batch_timeout: Duration,
    pending: Vec<Pending>,
}

impl BatchAssembler {
    pub fn new(max_batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            max_batch_size,
            batch_timeout,
            pending: Vec::with_capacity(max_batch_size),
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Adds one verified request; returns `true` if the batch is now
    /// full and should be proposed immediately, without waiting for the
    /// timer (§4.4).
    pub fn push(
        &mut self,
        from: NodeId,
        client_startts: u64,
        digest: Digest,
        query: ClientQuery<Vec<u8>>,
    ) -> bool {
        self.pending.push(Pending {
            from,
            client_startts,
            digest,
            query,
        });
        self.pending.len() >= self.max_batch_size
    }

    /// Drains the current batch (whatever its size — possibly under
    /// `max_batch_size`, if the timer fired first) for proposal,
    /// returning the digests in arrival order and the request bodies
    /// they reference.
    pub fn drain(&mut self) -> Vec<(NodeId, u64, Digest, ClientQuery<Vec<u8>>)> {
        self.pending
            .drain(..)
            .map(|p| (p.from, p.client_startts, p.digest, p.query))
            .collect()
    }
}
