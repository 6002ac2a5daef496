//! The classical three-phase ordering protocol (§3, "classical"):
//! PRE-PREPARE / PREPARE / COMMIT over a single rotating primary,
//! generalized from a single-instance `consensus::Consensus` state machine.
//! Grounded further in `original_source/platform/consensus/ordering/
//! simple_pbft/algorithm` for the exact phase-transition shape.

use std::collections::VecDeque;

use either::{Left, Right};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::collections::{self, HashSet};
use crate::bft::communication::message::Header;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::globals::ReplicaContext;
use crate::bft::log::RequestPool;
use crate::bft::ordering::{Orderable, SeqNo, View};

/// `PRE-PREPARE{seq, view, [digest]*}` — the leader's batch proposal.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct PrePrepareMessage {
    seq: SeqNo,
    view: View,
    digests: Vec<Digest>,
}

impl PrePrepareMessage {
    pub fn new(seq: SeqNo, view: View, digests: Vec<Digest>) -> Self {
        Self { seq, view, digests }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn digests(&self) -> &[Digest] {
        &self.digests
    }
}

impl Orderable for PrePrepareMessage {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// `PREPARE{seq, view, digest}` — a replica voting to accept the batch.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct PrepareMessage {
    seq: SeqNo,
    view: View,
    digest: Digest,
}

impl PrepareMessage {
    pub fn new(seq: SeqNo, view: View, digest: Digest) -> Self {
        Self { seq, view, digest }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl Orderable for PrepareMessage {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// `COMMIT{seq, view, digest}` — a replica certifying it observed a
/// quorum of matching `PREPARE`s.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct CommitMessage {
    seq: SeqNo,
    view: View,
    digest: Digest,
}

impl CommitMessage {
    pub fn new(seq: SeqNo, view: View, digest: Digest) -> Self {
        Self { seq, view, digest }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl Orderable for CommitMessage {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// Any of the three classical phase messages, tagged, for the purposes of
/// the time-bound-ordering queue below.
pub enum ClassicalMessage {
    PrePrepare(PrePrepareMessage),
    Prepare(PrepareMessage),
    Commit(CommitMessage),
}

impl Orderable for ClassicalMessage {
    fn sequence_number(&self) -> SeqNo {
        match self {
            ClassicalMessage::PrePrepare(m) => m.sequence_number(),
            ClassicalMessage::Prepare(m) => m.sequence_number(),
            ClassicalMessage::Commit(m) => m.sequence_number(),
        }
    }
}

/// Buffers out-of-order classical messages per consensus instance, so a
/// `PREPARE` that outruns its `PRE-PREPARE` is not simply discarded.
pub struct TboQueue {
    curr_seq: SeqNo,
    window: i32,
    get_queue: bool,
    pre_prepares: VecDeque<VecDeque<(Header, PrePrepareMessage)>>,
    prepares: VecDeque<VecDeque<(Header, PrepareMessage)>>,
    commits: VecDeque<VecDeque<(Header, CommitMessage)>>,
}

impl TboQueue {
    pub fn new(curr_seq: SeqNo, window: i32) -> Self {
        Self {
            curr_seq,
            window,
            get_queue: false,
            pre_prepares: VecDeque::new(),
            prepares: VecDeque::new(),
            commits: VecDeque::new(),
        }
    }

    pub fn signal(&mut self) {
        self.get_queue = true;
    }

    pub fn sequence_number(&self) -> SeqNo {
        self.curr_seq
    }

    fn pop_message<M>(tbo: &mut VecDeque<VecDeque<(Header, M)>>) -> Option<(Header, M)> {
        if tbo.is_empty() {
            None
        } else {
            tbo[0].pop_front()
        }
    }

    fn queue_message<M: Orderable>(
        curr_seq: SeqNo,
        window: i32,
        tbo: &mut VecDeque<VecDeque<(Header, M)>>,
        h: Header,
        m: M,
    ) {
        let index = match m.sequence_number().index(curr_seq, window) {
            Right(i) => i,
            Left(_) => return,
        };
        if index >= tbo.len() {
            let len = index - tbo.len() + 1;
            tbo.extend(std::iter::repeat_with(VecDeque::new).take(len));
        }
        tbo[index].push_back((h, m));
    }

    fn advance<M>(tbo: &mut VecDeque<VecDeque<(Header, M)>>) {
        if let Some(mut vec) = tbo.pop_front() {
            vec.clear();
            tbo.push_back(vec);
        }
    }

    pub fn next_instance_queue(&mut self) {
        self.curr_seq = self.curr_seq.next();
        Self::advance(&mut self.pre_prepares);
        Self::advance(&mut self.prepares);
        Self::advance(&mut self.commits);
    }

    pub fn queue_pre_prepare(&mut self, h: Header, m: PrePrepareMessage) {
        Self::queue_message(self.curr_seq, self.window, &mut self.pre_prepares, h, m)
    }

    pub fn queue_prepare(&mut self, h: Header, m: PrepareMessage) {
        Self::queue_message(self.curr_seq, self.window, &mut self.prepares, h, m)
    }

    pub fn queue_commit(&mut self, h: Header, m: CommitMessage) {
        Self::queue_message(self.curr_seq, self.window, &mut self.commits, h, m)
    }
}

/// The current phase of a classical consensus instance (§3: pre-prepare,
/// prepare, commit).
#[derive(Debug, Copy, Clone)]
pub enum ProtoPhase {
    Init,
    PrePreparing,
    PreparingRequests,
    Preparing(usize),
    Committing(usize),
}

/// Outcome of polling a classical instance for its next action.
pub enum PollStatus {
    Recv,
    TryProposeAndRecv,
    NextPrePrepare(Header, PrePrepareMessage),
    NextPrepare(Header, PrepareMessage),
    NextCommit(Header, CommitMessage),
}

/// Outcome of processing one classical-phase message.
pub enum ConsensusStatus {
    VotedTwice(NodeId),
    Deciding,
    Decided(Vec<Digest>),
}

/// Tracks one active classical consensus instance plus its look-ahead
/// buffer of future-instance messages (§5's per-consensus bookkeeping).
pub struct Consensus {
    batch_size: usize,
    phase: ProtoPhase,
    tbo: TboQueue,
    current: Vec<Digest>,
    missing_requests: VecDeque<Digest>,
    missing_swapbuf: Vec<usize>,
    prepare_voters: HashSet<NodeId>,
    commit_voters: HashSet<NodeId>,
}

fn batch_digest(digests: &[Digest]) -> Digest {
    crate::bft::crypto::hash::digest(
        &digests.iter().flat_map(|d| d.as_ref().to_vec()).collect::<Vec<u8>>(),
    )
}

impl Consensus {
    pub fn new(initial_seq_no: SeqNo, window: i32) -> Self {
        Self {
            batch_size: 0,
            phase: ProtoPhase::Init,
            tbo: TboQueue::new(initial_seq_no, window),
            current: Vec::new(),
            missing_requests: VecDeque::new(),
            missing_swapbuf: Vec::new(),
            prepare_voters: collections::hash_set(),
            commit_voters: collections::hash_set(),
        }
    }

    pub fn sequence_number(&self) -> SeqNo {
        self.tbo.sequence_number()
    }

    pub fn signal(&mut self) {
        self.tbo.signal()
    }

    pub fn phase(&self) -> ProtoPhase {
        self.phase
    }

    pub fn next_instance(&mut self) {
        self.tbo.next_instance_queue();
        self.prepare_voters.clear();
        self.commit_voters.clear();
    }

    /// If `ctx` identifies this replica as leader of `view` and the
    /// instance is freshly started, advances to `PrePreparing` and
    /// returns the `PRE-PREPARE` the caller should broadcast (§3, §4.4).
    /// The actual send is left to `core::server`, which owns the
    /// transport handle; this only gates and builds the message.
    pub fn propose(
        &mut self,
        digests: Vec<Digest>,
        view: View,
        ctx: &ReplicaContext,
    ) -> Option<PrePrepareMessage> {
        if !matches!(self.phase, ProtoPhase::Init) {
            return None;
        }
        if ctx.id() != ctx.leader_of(view) {
            return None;
        }
        self.phase = ProtoPhase::PrePreparing;
        self.current = digests.clone();
        self.batch_size = digests.len();
        Some(PrePrepareMessage::new(self.sequence_number(), view, digests))
    }

    pub fn poll(&mut self, log: &impl RequestPool) -> PollStatus {
        match self.phase {
            ProtoPhase::Init if self.tbo.get_queue => {
                if let Some((h, m)) = TboQueue::pop_message(&mut self.tbo.pre_prepares) {
                    self.phase = ProtoPhase::PrePreparing;
                    PollStatus::NextPrePrepare(h, m)
                } else {
                    self.tbo.get_queue = false;
                    PollStatus::Recv
                }
            }
            ProtoPhase::Init => PollStatus::TryProposeAndRecv,
            ProtoPhase::PrePreparing if self.tbo.get_queue => {
                if let Some((h, m)) = TboQueue::pop_message(&mut self.tbo.pre_prepares) {
                    PollStatus::NextPrePrepare(h, m)
                } else {
                    self.tbo.get_queue = false;
                    PollStatus::Recv
                }
            }
            ProtoPhase::PreparingRequests => {
                let iterator = self
                    .missing_requests
                    .iter()
                    .enumerate()
                    .filter(|(_, digest)| log.has_request(digest));
                for (index, _) in iterator {
                    self.missing_swapbuf.push(index);
                }
                for index in self.missing_swapbuf.drain(..) {
                    self.missing_requests.swap_remove_back(index);
                }
                if self.missing_requests.is_empty() {
                    if let Some((h, m)) = TboQueue::pop_message(&mut self.tbo.prepares) {
                        self.phase = ProtoPhase::Preparing(0);
                        PollStatus::NextPrepare(h, m)
                    } else {
                        self.tbo.get_queue = false;
                        PollStatus::Recv
                    }
                } else {
                    PollStatus::Recv
                }
            }
            ProtoPhase::Preparing(_) if self.tbo.get_queue => {
                if let Some((h, m)) = TboQueue::pop_message(&mut self.tbo.prepares) {
                    PollStatus::NextPrepare(h, m)
                } else {
                    self.tbo.get_queue = false;
                    PollStatus::Recv
                }
            }
            ProtoPhase::Committing(_) if self.tbo.get_queue => {
                if let Some((h, m)) = TboQueue::pop_message(&mut self.tbo.commits) {
                    PollStatus::NextCommit(h, m)
                } else {
                    self.tbo.get_queue = false;
                    PollStatus::Recv
                }
            }
            _ => PollStatus::Recv,
        }
    }

    pub fn install_sequence_number(&mut self, seq: SeqNo, window: i32) {
        match seq.index(self.sequence_number(), window) {
            Right(0) => return,
            Right(limit) if limit >= self.tbo.pre_prepares.len() => {
                self.tbo.pre_prepares.clear();
                self.tbo.prepares.clear();
                self.tbo.commits.clear();
            }
            Right(limit) => {
                self.tbo.pre_prepares.drain(..limit).for_each(drop);
                self.tbo.prepares.drain(..limit).for_each(drop);
                self.tbo.commits.drain(..limit).for_each(drop);
            }
            Left(_) => {
                self.tbo.pre_prepares.clear();
                self.tbo.prepares.clear();
                self.tbo.commits.clear();
            }
        }
        self.tbo.curr_seq = seq;
        self.phase = ProtoPhase::Init;
        self.prepare_voters.clear();
        self.commit_voters.clear();
    }

    /// Accepts a `PRE-PREPARE` from the leader, adopting its batch as the
    /// current instance's content and (if we are not the leader)
    /// broadcasting our own `PREPARE`. Returns the `PREPARE` this replica
    /// should send, if any.
    pub fn process_pre_prepare(
        &mut self,
        header: Header,
        message: PrePrepareMessage,
        current_view: View,
        ctx: &ReplicaContext,
        log: &impl RequestPool,
    ) -> (ConsensusStatus, Option<PrepareMessage>) {
        // Tie-break (i): a batch whose view does not match the
        // receiver's current view is dropped outright, never buffered —
        // it can never become valid just by waiting, unlike a merely
        // out-of-order sequence number.
        if message.view() != current_view {
            return (ConsensusStatus::Deciding, None);
        }

        match self.phase {
            ProtoPhase::Init => {
                self.tbo.queue_pre_prepare(header, message);
                return (ConsensusStatus::Deciding, None);
            }
            ProtoPhase::PrePreparing => {}
            _ if message.sequence_number() != self.sequence_number() => {
                self.tbo.queue_pre_prepare(header, message);
                return (ConsensusStatus::Deciding, None);
            }
            _ => {
                self.tbo.queue_pre_prepare(header, message);
                return (ConsensusStatus::Deciding, None);
            }
        }

        self.batch_size = message.digests.len();
        self.current = message.digests.clone();

        let batch_digest = batch_digest(&self.current);

        let prepare = if ctx.id() != ctx.leader_of(message.view()) {
            Some(PrepareMessage::new(
                self.sequence_number(),
                message.view(),
                batch_digest,
            ))
        } else {
            None
        };

        for digest in self.current.iter().filter(|d| !log.has_request(d)) {
            self.missing_requests.push_back(digest.clone());
        }
        self.phase = if self.missing_requests.is_empty() {
            ProtoPhase::Preparing(0)
        } else {
            ProtoPhase::PreparingRequests
        };

        (ConsensusStatus::Deciding, prepare)
    }

    /// Accepts a `PREPARE` vote; returns the `COMMIT` this replica should
    /// broadcast once quorum is reached (§3's "2f+1 matching PREPAREs").
    pub fn process_prepare(
        &mut self,
        header: Header,
        message: PrepareMessage,
        ctx: &ReplicaContext,
    ) -> (ConsensusStatus, Option<CommitMessage>) {
        let i = match self.phase {
            ProtoPhase::Preparing(i) if message.sequence_number() == self.sequence_number() => i,
            _ => {
                self.tbo.queue_prepare(header, message);
                return (ConsensusStatus::Deciding, None);
            }
        };

        let voter = header.from();
        if !self.prepare_voters.insert(voter) {
            return (ConsensusStatus::VotedTwice(voter), None);
        }

        let i = i + 1;
        let commit = if i == ctx.quorum() {
            self.phase = ProtoPhase::Committing(0);
            Some(CommitMessage::new(
                self.sequence_number(),
                message.view(),
                message.digest,
            ))
        } else {
            self.phase = ProtoPhase::Preparing(i);
            None
        };

        (ConsensusStatus::Deciding, commit)
    }

    /// The instance this replica has reached `Preparing`/`Committing` on,
    /// if any — the "prepared certificate" a `VIEW_CHANGE` carries
    /// forward so the next primary can replay it (§4.7).
    pub fn prepared_batch(&self) -> Option<(SeqNo, Digest, Vec<Digest>)> {
        match self.phase {
            ProtoPhase::Init | ProtoPhase::PrePreparing => None,
            _ => Some((self.sequence_number(), batch_digest(&self.current), self.current.clone())),
        }
    }

    /// Accepts a `COMMIT` certificate; once `2f+1` matching commits have
    /// arrived, the batch is decided and handed to the executor (§3).
    pub fn process_commit(
        &mut self,
        header: Header,
        message: CommitMessage,
        ctx: &ReplicaContext,
    ) -> ConsensusStatus {
        let i = match self.phase {
            ProtoPhase::Committing(i) if message.sequence_number() == self.sequence_number() => i,
            _ => {
                self.tbo.queue_commit(header, message);
                return ConsensusStatus::Deciding;
            }
        };

        let voter = header.from();
        if !self.commit_voters.insert(voter) {
            return ConsensusStatus::VotedTwice(voter);
        }

        let i = i + 1;
        if i == ctx.quorum() {
            self.phase = ProtoPhase::Init;
            ConsensusStatus::Decided(self.current.clone())
        } else {
            self.phase = ProtoPhase::Committing(i);
            ConsensusStatus::Deciding
        }
    }
}
