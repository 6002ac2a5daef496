//! The DAG-based ordering protocol (§3, "dag"): every replica proposes
//! one block per round, citing `2f+1` certified blocks from the
//! previous round as strong parents plus, optionally, a handful of
//! uncertified stragglers as weak parents; a wave leader's block is
//! committed once a quorum of the next wave's blocks reference it
//! (directly or transitively, strong or weak), at which point a BFS
//! walk of its causal history orders every as-yet-uncommitted ancestor.
//! Grounded in `original_source/platform/consensus/ordering/
//! tusk/algorithm` and `fairdag/algorithm`.

pub mod fairness;

use crate::bft::collections::{self, HashMap, HashSet};
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::Signature;
use crate::bft::communication::NodeId;
use crate::bft::globals::ReplicaContext;
use crate::bft::ordering::{Orderable, Round, SeqNo};
#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// A signed vote-for-inclusion on some other replica's block, analogous
/// to the chained protocol's `VoteMessage`, but scoped to one block
/// rather than one round.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct CertMessage {
    round: Round,
    author: NodeId,
    block_digest: Digest,
    signers: Vec<(NodeId, Signature)>,
}

impl CertMessage {
    pub fn round(&self) -> Round {
        self.round
    }

    pub fn author(&self) -> NodeId {
        self.author
    }

    pub fn block_digest(&self) -> &Digest {
        &self.block_digest
    }

    pub fn is_valid(&self, quorum: usize) -> bool {
        self.signers.len() >= quorum
    }

    pub fn signers(&self) -> &[(NodeId, Signature)] {
        &self.signers
    }

    /// Builds the single-signer wire vote a replica sends upon certifying
    /// a block it has received (§3): aggregated into a full quorum
    /// certificate by [`Dag::add_cert`]/[`Dag::quorum_cert_for`] once
    /// `2f+1` of these have arrived for the same `block_digest`.
    pub fn new_vote(round: Round, author: NodeId, block_digest: Digest, voter: NodeId, sig: Signature) -> Self {
        Self {
            round,
            author,
            block_digest,
            signers: vec![(voter, sig)],
        }
    }
}

/// `BLOCK{round, author, seq, [digest]*, [parent_cert]*, [weak_parent]*}`
/// — one replica's proposal for a DAG round, referencing at least `2f+1`
/// certified blocks from `round - 1` as strong parents, plus zero or
/// more weak (uncertified, non-voting) parents: round - 1 blocks that
/// missed quorum certification but are still worth keeping in this
/// replica's causal history so they aren't starved out by every later
/// wave leader skipping straight past them.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct BlockMessage {
    round: Round,
    author: NodeId,
    seq: SeqNo,
    digests: Vec<Digest>,
    parents: Vec<CertMessage>,
    weak_parents: Vec<Digest>,
}

impl BlockMessage {
    pub fn new(
        round: Round,
        author: NodeId,
        seq: SeqNo,
        digests: Vec<Digest>,
        parents: Vec<CertMessage>,
        weak_parents: Vec<Digest>,
    ) -> Self {
        Self {
            round,
            author,
            seq,
            digests,
            parents,
            weak_parents,
        }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn author(&self) -> NodeId {
        self.author
    }

    pub fn digests(&self) -> &[Digest] {
        &self.digests
    }

    pub fn parents(&self) -> &[CertMessage] {
        &self.parents
    }

    pub fn weak_parents(&self) -> &[Digest] {
        &self.weak_parents
    }

    pub fn block_digest(&self) -> Digest {
        crate::bft::crypto::hash::digest(
            &self
                .digests
                .iter()
                .flat_map(|d| d.as_ref().to_vec())
                .collect::<Vec<u8>>(),
        )
    }
}

impl Orderable for BlockMessage {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

#[derive(Clone)]
struct DagVertex {
    author: NodeId,
    round: Round,
    digests: Vec<Digest>,
    parents: Vec<Digest>,
    weak_parents: Vec<Digest>,
}

/// The local view of the block DAG: per-round vertices, their
/// certificate tallies, and the set of already-committed digests used
/// to cut off the BFS walk on wave-leader commit (§3).
pub struct Dag {
    vertices: HashMap<Digest, DagVertex>,
    by_round: HashMap<Round, Vec<Digest>>,
    certs: HashMap<Digest, Vec<(NodeId, Signature)>>,
    committed: HashSet<Digest>,
    last_committed_wave: Option<Round>,
}

impl Dag {
    pub fn new() -> Self {
        Self {
            vertices: collections::hash_map(),
            by_round: collections::hash_map(),
            certs: collections::hash_map(),
            committed: collections::hash_set(),
            last_committed_wave: None,
        }
    }

    pub fn insert_block(&mut self, block: &BlockMessage) -> Digest {
        let digest = block.block_digest();
        self.vertices.insert(
            digest.clone(),
            DagVertex {
                author: block.author(),
                round: block.round(),
                digests: block.digests().to_vec(),
                parents: block.parents().iter().map(|c| c.block_digest().clone()).collect(),
                weak_parents: block.weak_parents().to_vec(),
            },
        );
        self.by_round
            .entry(block.round())
            .or_insert_with(Vec::new)
            .push(digest.clone());
        digest
    }

    pub fn add_cert(&mut self, digest: Digest, voter: NodeId, sig: Signature) {
        let entry = self.certs.entry(digest).or_insert_with(Vec::new);
        if !entry.iter().any(|(id, _)| *id == voter) {
            entry.push((voter, sig));
        }
    }

    fn is_certified(&self, digest: &Digest, quorum: usize) -> bool {
        self.certs.get(digest).map(|v| v.len() >= quorum).unwrap_or(false)
    }

    /// Assembles the full aggregate certificate for `digest` out of the
    /// individual votes collected so far, for embedding as a parent-proof
    /// in this replica's next `BLOCK` proposal. `None` until a quorum of
    /// votes has arrived.
    pub fn quorum_cert_for(&self, digest: &Digest, quorum: usize) -> Option<CertMessage> {
        let vertex = self.vertices.get(digest)?;
        let signers = self.certs.get(digest)?;
        if signers.len() < quorum {
            return None;
        }
        Some(CertMessage {
            round: vertex.round,
            author: vertex.author,
            block_digest: digest.clone(),
            signers: signers.clone(),
        })
    }

    /// Runs the wave-leader commit rule (§3): the leader of `wave` is
    /// `round.dag_wave_leader(n)`; if its block has a quorum of
    /// certificates from the following round, it (and every
    /// not-yet-committed ancestor reachable by certified edges) commits.
    /// Returns committed blocks in a causally consistent order (oldest
    /// ancestor first), ready for the fairness reordering pass of §3.2.
    pub fn try_commit_wave(&mut self, wave: Round, ctx: &ReplicaContext) -> Vec<Digest> {
        let leader = wave.dag_wave_leader(ctx.n());
        let leader_block = match self.by_round.get(&wave) {
            Some(blocks) => blocks
                .iter()
                .find(|d| self.vertices.get(*d).map(|v| v.author == NodeId::from(leader)).unwrap_or(false))
                .cloned(),
            None => None,
        };
        let leader_block = match leader_block {
            Some(d) => d,
            None => return Vec::new(),
        };

        if !self.is_certified(&leader_block, ctx.quorum()) {
            return Vec::new();
        }
        if let Some(last) = self.last_committed_wave {
            if wave <= last {
                return Vec::new();
            }
        }

        let order = self.bfs_uncommitted(&leader_block);
        for digest in &order {
            self.committed.insert(digest.clone());
        }
        self.last_committed_wave = Some(wave);
        order
    }

    /// BFS over causal ancestors of `root`, skipping already-committed
    /// vertices, returning oldest-first (§3's deterministic total order).
    fn bfs_uncommitted(&self, root: &Digest) -> Vec<Digest> {
        let mut seen = collections::hash_set();
        let mut queue = std::collections::VecDeque::new();
        let mut order = Vec::new();

        queue.push_back(root.clone());
        seen.insert(root.clone());

        while let Some(digest) = queue.pop_front() {
            if self.committed.contains(&digest) {
                continue;
            }
            order.push(digest.clone());
            if let Some(vertex) = self.vertices.get(&digest) {
                for parent in vertex.parents.iter().chain(vertex.weak_parents.iter()) {
                    if !seen.contains(parent) && !self.committed.contains(parent) {
                        seen.insert(parent.clone());
                        queue.push_back(parent.clone());
                    }
                }
            }
        }

        order.reverse();
        order
    }

    /// Selects at least `quorum` certified blocks from `round.prev()` to
    /// cite as parents of this replica's next proposal (§3: "referencing
    /// `2f+1` blocks from the previous round"). Returns fewer than
    /// `quorum` only once, at genesis, when there is no previous round.
    pub fn parents_for(&self, round: Round, quorum: usize) -> Vec<CertMessage> {
        let prev = match round.prev() {
            Some(r) => r,
            None => return Vec::new(),
        };
        let blocks = match self.by_round.get(&prev) {
            Some(b) => b,
            None => return Vec::new(),
        };
        blocks
            .iter()
            .filter_map(|d| self.quorum_cert_for(d, quorum))
            .collect()
    }

    /// The weak-cert construction rule left unpinned by the source this
    /// was ported from: every uncommitted, uncertified ancestor this
    /// replica knows of — its entire local DAG view, minus whatever it
    /// already cites as a strong (`2f+1`-certified) parent — is folded in
    /// as a weak, non-voting parent of the next proposal, so nothing a
    /// straggler once proposed is silently forgotten once the wave moves
    /// on. `strong` is this proposal's already-chosen strong parents,
    /// excluded here to avoid double-citing a digest.
    pub fn weak_parents_for(&self, quorum: usize, strong: &[CertMessage]) -> Vec<Digest> {
        let cited: HashSet<Digest> = strong.iter().map(|c| c.block_digest().clone()).collect();
        self.vertices
            .keys()
            .filter(|d| !cited.contains(*d) && !self.committed.contains(*d) && !self.is_certified(d, quorum))
            .cloned()
            .collect()
    }

    pub fn batch_digests(&self, block_digest: &Digest) -> &[Digest] {
        self.vertices
            .get(block_digest)
            .map(|v| v.digests.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::hash::digest;

    fn block(round: u64, author: u32, tag: &[u8], parents: Vec<CertMessage>, weak: Vec<Digest>) -> BlockMessage {
        BlockMessage::new(
            Round::from(round),
            NodeId::from(author),
            SeqNo::ZERO,
            vec![digest(tag)],
            parents,
            weak,
        )
    }

    #[test]
    fn weak_parents_picks_up_uncertified_stragglers() {
        let mut dag = Dag::new();
        let round0 = Round::ZERO;

        let strong_block = block(0, 0, b"strong", Vec::new(), Vec::new());
        let straggler_block = block(0, 1, b"straggler", Vec::new(), Vec::new());
        let strong_digest = dag.insert_block(&strong_block);
        let straggler_digest = dag.insert_block(&straggler_block);

        dag.add_cert(strong_digest.clone(), NodeId::from(0u32), Signature::zeroed());
        dag.add_cert(strong_digest.clone(), NodeId::from(1u32), Signature::zeroed());
        dag.add_cert(strong_digest.clone(), NodeId::from(2u32), Signature::zeroed());

        let round1 = round0.next();
        let quorum = 3;
        let strong = dag.parents_for(round1, quorum);
        assert_eq!(strong.len(), 1);
        assert_eq!(strong[0].block_digest(), &strong_digest);

        let weak = dag.weak_parents_for(quorum, &strong);
        assert_eq!(weak, vec![straggler_digest]);
    }

    #[test]
    fn weak_parents_covers_every_known_uncertified_ancestor_across_rounds() {
        let mut dag = Dag::new();
        let mut digests = Vec::new();
        for round in 0..3u64 {
            let b = block(round, round as u32, format!("b{round}").as_bytes(), Vec::new(), Vec::new());
            digests.push(dag.insert_block(&b));
        }

        let weak = dag.weak_parents_for(3, &[]);
        assert_eq!(weak.len(), digests.len());
        for d in &digests {
            assert!(weak.contains(d));
        }
    }

    #[test]
    fn weak_parents_excludes_already_cited_digests() {
        let mut dag = Dag::new();
        let cited_block = block(0, 1, b"cited", Vec::new(), Vec::new());
        let remaining_block = block(0, 2, b"remaining", Vec::new(), Vec::new());
        let cited_digest = dag.insert_block(&cited_block);
        let remaining_digest = dag.insert_block(&remaining_block);

        dag.add_cert(cited_digest.clone(), NodeId::from(0u32), Signature::zeroed());
        dag.add_cert(cited_digest.clone(), NodeId::from(1u32), Signature::zeroed());
        dag.add_cert(cited_digest.clone(), NodeId::from(2u32), Signature::zeroed());
        let strong = dag.parents_for(Round::from(1), 3);

        let weak = dag.weak_parents_for(3, &strong);
        assert!(!weak.contains(&cited_digest));
        assert!(weak.contains(&remaining_digest));
    }

    #[test]
    fn bfs_uncommitted_follows_weak_edges_too() {
        let mut dag = Dag::new();
        let root = block(0, 0, b"root", Vec::new(), Vec::new());
        let root_digest = dag.insert_block(&root);

        let child = block(1, 1, b"child", Vec::new(), vec![root_digest.clone()]);
        let child_digest = dag.insert_block(&child);

        let order = dag.bfs_uncommitted(&child_digest);
        assert_eq!(order, vec![root_digest, child_digest]);
    }
}
