//! Process-wide mutable state, encapsulated so that it is always passed
//! explicitly to the component that needs it, rather than reached for as
//! an ambient global.
//!
//! The only *true* global in this crate is [`Flag`], used once by
//! [`crate::bft::init`] to guard against double initialization. Everything
//! else that several threads need to observe (the current view/round, the
//! set of failed peers, the verification keys of peers, …) is held inside
//! a [`ReplicaContext`], constructed once at bootstrap and shared behind an
//! `Arc` by every thread of a [`crate::bft::core::server::Replica`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::bft::communication::NodeId;
use crate::bft::crypto::signature::PublicKeySet;
use crate::bft::collections::{self, HashSet};

use parking_lot::RwLock;

/// A simple atomic flag, set once and never unset except on teardown.
pub struct Flag(AtomicBool);

impl Flag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn test(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn unset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Read-mostly, process-wide state shared by every thread of a replica.
///
/// Counters use atomics so readers never block; the peer key table is
/// frozen after the key-exchange bootstrap of §4.3 and is read lock-free
/// from then on (the `RwLock` is only ever write-locked during setup).
pub struct ReplicaContext {
    id: NodeId,
    n: usize,
    f: usize,
    view: AtomicU32,
    low_watermark: AtomicU32,
    peer_keys: RwLock<PublicKeySet>,
    failed_peers: RwLock<HashSet<NodeId>>,
}

impl ReplicaContext {
    pub fn new(id: NodeId, n: usize, f: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            n,
            f,
            view: AtomicU32::new(0),
            low_watermark: AtomicU32::new(0),
            peer_keys: RwLock::new(PublicKeySet::empty()),
            failed_peers: RwLock::new(collections::hash_set()),
        })
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn f(&self) -> usize {
        self.f
    }

    #[inline]
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    #[inline]
    pub fn view(&self) -> u32 {
        self.view.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_view(&self, view: u32) {
        self.view.store(view, Ordering::Release);
    }

    #[inline]
    pub fn leader_of(&self, view: crate::bft::ordering::View) -> NodeId {
        NodeId::from(view.leader(self.n))
    }

    #[inline]
    pub fn low_watermark(&self) -> u32 {
        self.low_watermark.load(Ordering::Acquire)
    }

    #[inline]
    pub fn advance_low_watermark(&self, to: u32) {
        // monotonic: never move the watermark backwards
        self.low_watermark.fetch_max(to, Ordering::AcqRel);
    }

    pub fn install_peer_keys(&self, keys: PublicKeySet) {
        *self.peer_keys.write() = keys;
    }

    pub fn peer_keys(&self) -> parking_lot::RwLockReadGuard<'_, PublicKeySet> {
        self.peer_keys.read()
    }

    /// Marks `peer` as failed for the remainder of the current view; per
    /// §4.1, failed peers are never retried within a view.
    pub fn mark_failed(&self, peer: NodeId) {
        self.failed_peers.write().insert(peer);
    }

    pub fn is_failed(&self, peer: NodeId) -> bool {
        self.failed_peers.read().contains(&peer)
    }

    /// Clears a single peer's failed marker, e.g. after a write to it
    /// succeeds again.
    pub fn clear_failed(&self, peer: NodeId) {
        self.failed_peers.write().remove(&peer);
    }

    /// Clears the entire failed-peer set; called when a new view is
    /// installed.
    pub fn clear_all_failed(&self) {
        self.failed_peers.write().clear();
    }
}
