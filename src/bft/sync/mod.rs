//! View change / primary failover (§4.7): when a replica's batch timer
//! or view-change timer elapses without progress, it broadcasts
//! `VIEW_CHANGE`; once `f+1` peers have also moved on (first chance) or
//! a full quorum agrees (guaranteed progress), the new primary collects
//! the evidence into a `NEW_VIEW`, verifies it, and broadcasts it so
//! every replica (not just the new primary) installs the new view.
//!
//! Grounded in `cst::RecoveryState`'s evidence-collection pattern and
//! `original_source/platform/consensus/ordering/simple_pbft/algorithm`'s
//! view-change handling.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::collections::{self, HashMap, HashSet};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::globals::ReplicaContext;
use crate::bft::ordering::{Orderable, SeqNo, View};

/// One instance this replica had reached `Preparing`/`Committing` on
/// before its view-change timer fired: the aggregate `digest` is what
/// other replicas' claims are matched against (§4.7's f+1 rule), and the
/// constituent `requests` are carried along so the *next* primary can
/// replay the batch even if it never saw the original `PRE-PREPARE`
/// itself.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct PreparedInstance {
    seq: SeqNo,
    digest: Digest,
    requests: Vec<Digest>,
}

impl PreparedInstance {
    pub fn new(seq: SeqNo, digest: Digest, requests: Vec<Digest>) -> Self {
        Self {
            seq,
            digest,
            requests,
        }
    }

    /// The batch is only trustworthy as replay content if its hash
    /// actually matches the digest a quorum agreed was prepared — a
    /// Byzantine voter could otherwise attach unrelated content to a
    /// correct digest claim.
    fn content_matches_digest(&self) -> bool {
        let recomputed = crate::bft::crypto::hash::digest(
            &self
                .requests
                .iter()
                .flat_map(|d| d.as_ref().to_vec())
                .collect::<Vec<u8>>(),
        );
        recomputed == self.digest
    }
}

/// `VIEW_CHANGE{new_view, last_stable, [PreparedInstance]*}` (§4.7, §6):
/// a replica's claim about what it believes was prepared (but possibly
/// not yet committed) as of its last stable checkpoint.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ViewChangeMessage {
    new_view: View,
    last_stable: SeqNo,
    prepared: Vec<PreparedInstance>,
}

impl ViewChangeMessage {
    pub fn new(new_view: View, last_stable: SeqNo, prepared: Vec<PreparedInstance>) -> Self {
        Self {
            new_view,
            last_stable,
            prepared,
        }
    }

    pub fn new_view(&self) -> View {
        self.new_view
    }

    pub fn last_stable(&self) -> SeqNo {
        self.last_stable
    }

    pub fn prepared(&self) -> &[PreparedInstance] {
        &self.prepared
    }
}

/// `NEW_VIEW{new_view, [(sender, ViewChangeMessage)]*, [pre_prepare]*}`
/// (§4.7, §6): the incoming primary's proof that a quorum agreed to move
/// to `new_view`, together with the set of `(seq, digest)` pairs it is
/// permitted to re-propose — every batch claimed prepared by at least
/// `f+1` distinct voters in the evidence (§4.7's integrity rule).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct NewViewMessage {
    new_view: View,
    evidence: Vec<(NodeId, ViewChangeMessage)>,
    pre_prepares: Vec<(SeqNo, Vec<Digest>)>,
}

impl NewViewMessage {
    /// Builds a `NEW_VIEW` out of the evidence a [`Synchronizer`] just
    /// finished collecting a quorum of: a batch is only carried forward
    /// into `pre_prepares` if at least `f+1` distinct voters (never
    /// fewer, since a single Byzantine voter could otherwise fabricate a
    /// prepared claim) agree on the same digest for it, and at least one
    /// of them attached content that actually hashes to that digest.
    pub fn from_evidence(new_view: View, evidence: Vec<(NodeId, ViewChangeMessage)>, f: usize) -> Self {
        let mut counts: HashMap<(SeqNo, Digest), usize> = collections::hash_map();
        let mut content: HashMap<(SeqNo, Digest), Vec<Digest>> = collections::hash_map();
        for (_, vc) in &evidence {
            for instance in vc.prepared() {
                let key = (instance.seq, instance.digest.clone());
                *counts.entry(key.clone()).or_insert(0) += 1;
                if !content.contains_key(&key) && instance.content_matches_digest() {
                    content.insert(key, instance.requests.clone());
                }
            }
        }
        let mut pre_prepares: Vec<(SeqNo, Vec<Digest>)> = counts
            .into_iter()
            .filter(|(_, count)| *count >= f + 1)
            .filter_map(|(key, _)| content.get(&key).cloned().map(|reqs| (key.0, reqs)))
            .collect();
        pre_prepares.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        Self {
            new_view,
            evidence,
            pre_prepares,
        }
    }

    pub fn new_view(&self) -> View {
        self.new_view
    }

    pub fn evidence(&self) -> &[(NodeId, ViewChangeMessage)] {
        &self.evidence
    }

    /// The batches the incoming primary re-proposes under the new view,
    /// oldest first, already reduced to the per-request digests a fresh
    /// `PRE-PREPARE` needs.
    pub fn pre_prepares(&self) -> &[(SeqNo, Vec<Digest>)] {
        &self.pre_prepares
    }

    /// The highest sequence number any voter claims to have prepared;
    /// the incoming primary must re-propose from here, not from scratch.
    pub fn high_water(&self) -> SeqNo {
        self.evidence
            .iter()
            .flat_map(|(_, vc)| vc.prepared.iter().map(|p| p.seq))
            .max_by(|a, b| a.partial_cmp(b).unwrap())
            .unwrap_or(SeqNo::ZERO)
    }

    /// Checks a received `NEW_VIEW` before installing it (§4.7): a real
    /// quorum of *distinct* senders, all of whom voted for the view this
    /// message claims to install. A forged `NEW_VIEW` with fewer voters,
    /// a duplicated voter standing in for a missing one, or evidence for
    /// the wrong view is rejected rather than installed.
    pub fn is_valid(&self, ctx: &ReplicaContext) -> bool {
        if self.evidence.len() < ctx.quorum() {
            return false;
        }
        if !self.evidence.iter().all(|(_, vc)| vc.new_view() == self.new_view) {
            return false;
        }
        let mut seen: HashSet<NodeId> = collections::hash_set();
        self.evidence.iter().all(|(id, _)| seen.insert(*id))
    }
}

/// Collects `VIEW_CHANGE` votes for a candidate view, and decides when
/// enough evidence exists for *this* replica — if it is `leader(v+1)` —
/// to assemble a `NEW_VIEW` (§4.7: "requires a quorum of `VIEW_CHANGE`s").
pub struct Synchronizer {
    current_view: View,
    votes: HashMap<View, Vec<(NodeId, ViewChangeMessage)>>,
}

impl Synchronizer {
    pub fn new(current_view: View) -> Self {
        Self {
            current_view,
            votes: collections::hash_map(),
        }
    }

    pub fn current_view(&self) -> View {
        self.current_view
    }

    /// Records a `VIEW_CHANGE` vote; returns `Some` with the evidence set
    /// (sender paired with its claim) once the quorum threshold is
    /// crossed for the first time.
    pub fn receive_view_change(
        &mut self,
        from: NodeId,
        message: ViewChangeMessage,
        ctx: &ReplicaContext,
    ) -> Option<Vec<(NodeId, ViewChangeMessage)>> {
        if message.new_view() <= self.current_view {
            return None;
        }
        let entry = self.votes.entry(message.new_view()).or_insert_with(Vec::new);
        if !entry.iter().any(|(id, _)| *id == from) {
            entry.push((from, message));
        }

        if entry.len() == ctx.quorum() {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// `f+1` matching votes are enough for any *correct* replica to know
    /// it is behind and join the view change, even before a full quorum
    /// has voted (§4.7's "first chance" rule) — this is distinct from
    /// the `quorum`-sized threshold required to actually *install* a
    /// `NEW_VIEW`.
    pub fn should_join_view_change(&self, new_view: View, ctx: &ReplicaContext) -> bool {
        self.votes
            .get(&new_view)
            .map(|v| v.len() >= ctx.f() + 1)
            .unwrap_or(false)
    }

    /// Installs a verified `NEW_VIEW`, advancing the current view and
    /// dropping any now-stale view-change votes.
    pub fn install_new_view(&mut self, new_view: NewViewMessage) {
        self.current_view = new_view.new_view();
        self.votes.retain(|v, _| *v > self.current_view);
    }
}
