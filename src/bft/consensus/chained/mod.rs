//! The chained ordering protocol (§3, "chained"): a HotStuff-style
//! pipeline of `PROPOSAL`/`VOTE` rounds, with a rotating leader per round
//! and a three-chain commit rule. Grounded in `original_source/platform/
//! consensus/ordering/hs/algorithm` and `hs2/algorithm`.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::message::Header;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::Signature;
use crate::bft::globals::ReplicaContext;
use crate::bft::ordering::{Orderable, Round, SeqNo};

/// A quorum certificate: `2f+1` matching votes for a proposed block,
/// carried forward by the next round's proposal to extend the chain.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct QuorumCert {
    round: Round,
    block_digest: Digest,
    signers: Vec<(NodeId, Signature)>,
}

impl QuorumCert {
    pub fn genesis() -> Self {
        Self {
            round: Round::ZERO,
            block_digest: Digest::blank(),
            signers: Vec::new(),
        }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn block_digest(&self) -> &Digest {
        &self.block_digest
    }

    pub fn is_valid(&self, quorum: usize) -> bool {
        self.signers.len() >= quorum
    }
}

/// `PROPOSAL{round, seq, parent_qc, [digest]*}` — the round leader's
/// batch proposal, extending the chain from `parent_qc`.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ProposalMessage {
    round: Round,
    seq: SeqNo,
    parent_qc: QuorumCert,
    digests: Vec<Digest>,
}

impl ProposalMessage {
    pub fn new(round: Round, seq: SeqNo, parent_qc: QuorumCert, digests: Vec<Digest>) -> Self {
        Self {
            round,
            seq,
            parent_qc,
            digests,
        }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn parent_qc(&self) -> &QuorumCert {
        &self.parent_qc
    }

    pub fn digests(&self) -> &[Digest] {
        &self.digests
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

impl Orderable for ProposalMessage {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// `VOTE{round, block_digest}` — a replica's signed endorsement of the
/// current round's proposal.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct VoteMessage {
    round: Round,
    block_digest: Digest,
}

impl VoteMessage {
    pub fn new(round: Round, block_digest: Digest) -> Self {
        Self { round, block_digest }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn block_digest(&self) -> &Digest {
        &self.block_digest
    }
}

/// One link of the local chain, kept around until it is either committed
/// via the three-chain rule or abandoned after a leader timeout.
struct ChainNode {
    qc: QuorumCert,
    digests: Vec<Digest>,
}

/// Tracks the pipelined chain of proposals and decides, on each new
/// quorum certificate, whether the three-chain commit rule fires (§3:
/// "a block commits once it and its next two descendants all carry a
/// QC in strictly increasing, contiguous rounds").
pub struct Chain {
    locked_qc: QuorumCert,
    high_qc: QuorumCert,
    nodes: HashMap<Round, ChainNode>,
    votes: HashMap<Round, Vec<(NodeId, Signature)>>,
}

impl Chain {
    pub fn new() -> Self {
        Self {
            locked_qc: QuorumCert::genesis(),
            high_qc: QuorumCert::genesis(),
            nodes: collections::hash_map(),
            votes: collections::hash_map(),
        }
    }

    pub fn high_qc(&self) -> &QuorumCert {
        &self.high_qc
    }

    /// Leader-side: begins a new round, proposing on top of `high_qc`.
    pub fn propose(&self, round: Round, seq: SeqNo, digests: Vec<Digest>) -> ProposalMessage {
        ProposalMessage::new(round, seq, self.high_qc.clone(), digests)
    }

    /// Records a received proposal, to later collect votes for it.
    pub fn accept_proposal(&mut self, proposal: &ProposalMessage) {
        self.nodes.insert(
            proposal.round(),
            ChainNode {
                qc: proposal.parent_qc().clone(),
                digests: proposal.digests().to_vec(),
            },
        );
        if proposal.parent_qc().round() >= self.high_qc.round() {
            self.high_qc = proposal.parent_qc().clone();
        }
    }

    /// Records one vote; once `quorum` is reached, forms a fresh
    /// `QuorumCert` for `round` and runs the three-chain commit check,
    /// returning every newly committed round's digests, oldest first.
    pub fn add_vote(
        &mut self,
        round: Round,
        block_digest: Digest,
        voter: NodeId,
        sig: Signature,
        ctx: &ReplicaContext,
    ) -> Vec<(Round, Vec<Digest>)> {
        let votes = self.votes.entry(round).or_insert_with(Vec::new);
        if !votes.iter().any(|(id, _)| *id == voter) {
            votes.push((voter, sig));
        }

        if votes.len() < ctx.quorum() {
            return Vec::new();
        }

        let qc = QuorumCert {
            round,
            block_digest,
            signers: votes.clone(),
        };
        if qc.round() >= self.high_qc.round() {
            self.high_qc = qc.clone();
        }

        self.try_commit(round)
    }

    /// The three-chain rule: round `k` commits once rounds `k`, `k+1` and
    /// `k+2` each carry a QC and are contiguous. We check this by walking
    /// back from the just-certified round.
    fn try_commit(&mut self, latest_certified: Round) -> Vec<(Round, Vec<Digest>)> {
        let r2 = latest_certified;
        let r1 = match r2.prev() {
            Some(r) => r,
            None => return Vec::new(),
        };
        let r0 = match r1.prev() {
            Some(r) => r,
            None => return Vec::new(),
        };

        let all_present = self.nodes.contains_key(&r0)
            && self.nodes.contains_key(&r1)
            && self.nodes.contains_key(&r2);
        if !all_present {
            return Vec::new();
        }

        if r2.prev() != Some(r1) || r1.prev() != Some(r0) {
            return Vec::new();
        }

        if self.locked_qc.round() >= r0 {
            return Vec::new();
        }
        self.locked_qc = QuorumCert {
            round: r0,
            block_digest: Digest::blank(),
            signers: Vec::new(),
        };

        let mut committed = Vec::new();
        if let Some(node) = self.nodes.remove(&r0) {
            committed.push((r0, node.digests));
        }
        committed
    }
}
