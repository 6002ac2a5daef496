//! The sharded transaction table (§5's `TxnManager`): a pool-backed map
//! from digest to in-flight transaction state, with a CAS-guarded
//! `ready` token granting exclusive ownership of a slot to whichever
//! worker thread first claims it — mirroring `original_source/platform/
//! common/queue/txn_table.h`'s sharding-by-hash scheme, adapted to this
//! crate's `parking_lot`/atomics idiom.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::message::ClientQuery;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;

/// One entry in the transaction table (§3's "a pooled slot holding a
/// request body, its hash, and whether a worker currently owns it").
pub struct TxnEntry {
    pub from: NodeId,
    pub client_startts: u64,
    pub body: ClientQuery<Vec<u8>>,
    pub digest: Digest,
    ready: AtomicBool,
}

impl TxnEntry {
    fn new(from: NodeId, client_startts: u64, body: ClientQuery<Vec<u8>>, digest: Digest) -> Self {
        Self {
            from,
            client_startts,
            body,
            digest,
            ready: AtomicBool::new(false),
        }
    }

    /// Attempts to claim exclusive ownership of this slot; `true` the
    /// first time, `false` to every later caller until [`Self::release`]
    /// runs — the same single-ownership discipline that prevents a batch
    /// from being proposed twice.
    pub fn try_claim(&self) -> bool {
        self.ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.ready.store(false, Ordering::Release);
    }
}

const SHARD_COUNT: usize = 16;

/// A fixed number of independently-locked shards, indexed by the low
/// bits of the digest, so concurrent workers rarely contend on the same
/// lock even under a single global table.
pub struct TxnTable {
    shards: Vec<RwLock<HashMap<Digest, Arc<TxnEntry>>>>,
}

impl TxnTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(collections::hash_map()))
                .collect(),
        }
    }

    fn shard_of(&self, digest: &Digest) -> &RwLock<HashMap<Digest, Arc<TxnEntry>>> {
        let byte = digest.as_ref()[0] as usize;
        &self.shards[byte % SHARD_COUNT]
    }

    /// Inserts a freshly arrived request, keyed by its digest; returns
    /// the existing entry if this digest was already present (a client
    /// retransmission, §7 (a)).
    pub fn insert(
        &self,
        from: NodeId,
        client_startts: u64,
        body: ClientQuery<Vec<u8>>,
        digest: Digest,
    ) -> Arc<TxnEntry> {
        let shard = self.shard_of(&digest);
        let mut shard = shard.write();
        shard
            .entry(digest.clone())
            .or_insert_with(|| Arc::new(TxnEntry::new(from, client_startts, body, digest)))
            .clone()
    }

    pub fn get(&self, digest: &Digest) -> Option<Arc<TxnEntry>> {
        self.shard_of(digest).read().get(digest).cloned()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.shard_of(digest).read().contains_key(digest)
    }

    /// Releases every slot named by `digests` back to the pool once the
    /// owning batch has been garbage-collected behind a stable
    /// checkpoint (§4.6, §5).
    pub fn release(&self, digests: &[Digest]) {
        for digest in digests {
            let shard = self.shard_of(digest);
            let mut shard = shard.write();
            if let Some(entry) = shard.get(digest) {
                entry.release();
            }
            shard.remove(digest);
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::hash::digest;

    fn query(op: &[u8]) -> ClientQuery<Vec<u8>> {
        ClientQuery {
            client_id: NodeId::from(1000u32),
            client_startts: 0,
            operation: op.to_vec(),
        }
    }

    #[test]
    fn second_claim_fails_until_released() {
        let table = TxnTable::new();
        let digest = digest(b"hello");
        let entry = table.insert(NodeId::from(0u32), 0, query(b"hello"), digest.clone());

        assert!(entry.try_claim());
        assert!(!entry.try_claim());

        entry.release();
        assert!(entry.try_claim());
    }

    #[test]
    fn retransmission_returns_existing_entry() {
        let table = TxnTable::new();
        let digest = digest(b"op");
        let first = table.insert(NodeId::from(0u32), 0, query(b"op"), digest.clone());
        first.try_claim();

        let second = table.insert(NodeId::from(0u32), 0, query(b"op"), digest.clone());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!second.try_claim());
    }

    #[test]
    fn release_removes_from_table() {
        let table = TxnTable::new();
        let digest = digest(b"gone");
        table.insert(NodeId::from(0u32), 0, query(b"gone"), digest.clone());
        assert!(table.contains(&digest));

        table.release(&[digest.clone()]);
        assert!(!table.contains(&digest));
        assert_eq!(table.len(), 0);
    }
}
