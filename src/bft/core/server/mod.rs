//! The replica's main loop (§4, §5): owns the transport [`Node`], the
//! active ordering [`Protocol`], the shared [`Log`] and [`TxnTable`], and
//! drives them all from a single-threaded event loop — handing off to
//! the worker pool and execution thread for anything CPU-heavy, and
//! never blocking on peer I/O inside the loop itself.

use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::channel::{new_bounded, ChannelRx, ChannelTx};
use crate::bft::communication::keyexchange::KeyExchange;
use crate::bft::communication::message::{
    ClientResponseMessage, Header, KeyExchangeMessage, Message, SystemMessage,
};
use crate::bft::communication::serialize::{deserialize_message, serialize_message};
use crate::bft::communication::{Node, NodeConfig, NodeId};
use crate::bft::config::ReplicaConfig;
use crate::bft::consensus::chained;
use crate::bft::consensus::dag::{self, fairness};
use crate::bft::consensus::{classical, OrderingProtocol, Protocol};
use crate::bft::core::batching::BatchAssembler;
use crate::bft::core::txn_table::TxnTable;
use crate::bft::core::workqueue::{self, CheckpointWork, NewTxnWork, WorkerResult};
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::{AuthMode, KeyPair};
use crate::bft::error::*;
use crate::bft::executable::{
    CheckpointReady, Executor, ExecutorHandle, Reply, Request, Service, State, Update, UpdateBatch,
};
use crate::bft::globals::ReplicaContext;
use crate::bft::log::Log;
use crate::bft::ordering::{Orderable, Round, SeqNo, View};
use crate::bft::prng;
use crate::bft::sync::{NewViewMessage, PreparedInstance, Synchronizer, ViewChangeMessage};
use crate::bft::threadpool;
use crate::bft::timeouts::{TimeoutKind, Timeouts};

/// The wire operation type carried by every [`Node`]/[`SystemMessage`] in
/// this crate: requests travel as opaque, pre-digested bytes up to the
/// point of execution, where they are decoded into the application's own
/// [`Request<S>`] by the `decode_request` closure supplied at bootstrap.
/// This is what lets the ordering layer (and the request pool keyed by
/// digest) stay generic over any `Service`, without needing `Request<S>`
/// to implement anything beyond what the application itself requires.
pub type Wire = Vec<u8>;

/// Everything a running replica owns, besides the transport `Node`
/// itself (kept separate since it is generic only over the wire
/// operation type, not the full `Service`).
pub struct Replica<S: Service> {
    ctx: Arc<ReplicaContext>,
    protocol_kind: OrderingProtocol,
    protocol: Protocol,
    window: i32,
    current_round: Round,
    next_seq: SeqNo,
    checkpoint_votes: HashMap<SeqNo, Vec<(NodeId, Digest)>>,
    log: Arc<Log<State<S>>>,
    txn_table: Arc<TxnTable>,
    synchronizer: Synchronizer,
    batcher: BatchAssembler,
    executor: ExecutorHandle<S>,
    timeouts: Timeouts<Wire>,
    fairness_threshold: usize,
    view_change_timeout: Duration,
    view_changes_enabled: bool,
    max_txn_in_flight: usize,
    msg_size_max: u64,
    decode_request: Arc<dyn Fn(&[u8]) -> Request<S> + Send + Sync>,
    reply_rx: ChannelRx<(NodeId, ClientResponseMessage)>,
    checkpoint_rx: ChannelRx<CheckpointReady<State<S>>>,
    checkpoint_gossip_tx: ChannelTx<CheckpointWork>,
    checkpoint_gossip_rx: ChannelRx<CheckpointWork>,
    new_txn_tx: ChannelTx<NewTxnWork>,
    worker_rx: ChannelRx<WorkerResult>,
    fairness: fairness::FairnessGraph,
    key_exchange: Option<KeyExchange>,
}

fn leader_of_round(round: Round, n: usize) -> NodeId {
    NodeId::from(round.chained_leader(n))
}

/// Builds the closure handed to [`Node::spawn_read_loop`]: deserializes
/// the payload and verifies it against whichever authentication
/// discipline this replica runs (§4.2). `KEY_EXCHANGE` is verified
/// against its own embedded public key instead, since the peer table
/// it would otherwise be checked against is exactly what it populates
/// (§4.3).
fn make_decoder(
    ctx: Arc<ReplicaContext>,
    my_key: Arc<KeyPair>,
) -> impl Fn(Header, &[u8]) -> Option<Message<Wire>> + Send + 'static {
    move |header, payload| {
        let msg: SystemMessage<Wire> = deserialize_message(payload).ok()?;
        if let SystemMessage::KeyExchange(ref kem) = msg {
            return if kem.public_key.verify_bootstrap(payload, header.signature()) {
                Some(Message::System(header, msg))
            } else {
                None
            };
        }
        let verified = match my_key.method().mode() {
            AuthMode::Digital => ctx
                .peer_keys()
                .get(header.from())
                .map(|pk| pk.verify_digital(payload, header.signature()))
                .unwrap_or(false),
            AuthMode::Authenticator => {
                my_key.verify_authenticated(header.from(), payload, header.signature())
            }
        };
        if !verified {
            return None;
        }
        Some(Message::System(header, msg))
    }
}

impl<S> Replica<S>
where
    S: Service + Send + 'static,
    State<S>: Send + Clone + 'static,
    Request<S>: Send + Clone + 'static,
    Reply<S>: Send + 'static,
{
    /// Bootstraps transport, crypto, and every sub-protocol from a parsed
    /// [`ReplicaConfig`], per §6's config surface. `decode_request` turns
    /// the raw bytes stored in the request pool back into the
    /// application's own operation type at execution time.
    pub async fn bootstrap(
        cfg: ReplicaConfig,
        service: S,
        decode_request: impl Fn(&[u8]) -> Request<S> + Send + Sync + 'static,
    ) -> Result<(Self, Node<Wire>)> {
        cfg.check_tport_type()?;
        let crypto_method = cfg.crypto_method()?;
        let sk = KeyPair::generate(crypto_method)?;

        let node_cfg = NodeConfig {
            f: cfg.f,
            id: cfg.node_id(),
            addrs: cfg.peer_addrs(),
            sk,
        };
        let (node, ctx, _rogue) = Node::bootstrap(node_cfg).await?;

        let protocol_kind = cfg.ordering_protocol()?;
        let window = cfg.txn_per_checkpoint as i32;
        let protocol = Protocol::new(protocol_kind, SeqNo::ZERO, window);

        let log = Arc::new(Log::new(cfg.txn_per_checkpoint));
        let txn_table = Arc::new(TxnTable::new());
        let synchronizer = Synchronizer::new(View::ZERO);
        let batcher = BatchAssembler::new(
            cfg.max_batch_size,
            Duration::from_millis(cfg.batch_timeout_ms),
        );

        let (reply_tx, reply_rx) = new_bounded(cfg.max_batch_size.max(128));
        let (checkpoint_tx, checkpoint_rx) = new_bounded(4);
        let (checkpoint_gossip_tx, checkpoint_gossip_rx) = workqueue::checkpoint_queue(4);

        let queue_bound = cfg.max_batch_size.max(128);
        let (new_txn_tx, mut new_txn_rx) = workqueue::new_txn_queue(queue_bound);
        let (worker_tx, worker_rx) = workqueue::worker_queue(queue_bound);
        let worker_pool = threadpool::new(cfg.worker_threads)?;

        // Bridges the async new-txn queue into the fixed worker pool
        // (§5): digesting a request is CPU-bound and must never block the
        // single event loop that drives everything else, so it runs on a
        // plain OS thread and the result comes back over `worker_rx`.
        crate::bft::async_runtime::spawn(async move {
            while let Ok(work) = new_txn_rx.recv().await {
                let mut worker_tx = worker_tx.clone();
                worker_pool.execute(move || {
                    let digest = crate::bft::crypto::hash::digest(&work.query.operation);
                    let _ = worker_tx.try_send(WorkerResult {
                        from: work.from,
                        client_startts: work.client_startts,
                        digest,
                        query: work.query,
                    });
                });
            }
        });

        let executor = Executor::new(reply_tx, checkpoint_tx, service)?;
        let timeouts = Timeouts::new(node.sender());

        let replica = Replica {
            ctx,
            protocol_kind,
            protocol,
            window,
            current_round: Round::ZERO,
            next_seq: SeqNo::ZERO,
            checkpoint_votes: collections::hash_map(),
            log,
            txn_table,
            synchronizer,
            batcher,
            executor,
            timeouts,
            fairness_threshold: cfg.fairness_threshold(),
            view_change_timeout: Duration::from_millis(cfg.view_change_timeout_ms),
            view_changes_enabled: cfg.view_changes,
            max_txn_in_flight: cfg.max_txn_in_flight as usize,
            msg_size_max: cfg.msg_size_max,
            decode_request: Arc::new(decode_request),
            reply_rx,
            checkpoint_rx,
            checkpoint_gossip_tx,
            checkpoint_gossip_rx,
            new_txn_tx,
            worker_rx,
            fairness: fairness::FairnessGraph::new(),
            key_exchange: Some(KeyExchange::new(node.context().n())),
        };
        Ok((replica, node))
    }

    pub fn context(&self) -> &Arc<ReplicaContext> {
        &self.ctx
    }

    pub fn current_view(&self) -> View {
        self.synchronizer.current_view()
    }

    pub fn log(&self) -> &Arc<Log<State<S>>> {
        &self.log
    }

    pub fn txn_table(&self) -> &Arc<TxnTable> {
        &self.txn_table
    }

    pub fn fairness_threshold(&self) -> usize {
        self.fairness_threshold
    }

    /// Accepts one digested, verified request into the current batch;
    /// returns `true` if the batch just became full and should be
    /// proposed without waiting for the timer (§4.4).
    ///
    /// The request pool's `try_claim` guards against queuing a client
    /// retransmission (§7 (a)) a second time while the first copy is
    /// still awaiting a decision: the log keeps the body either way, so a
    /// late `CL_RSP` can still be served out of it.
    pub fn offer_request(
        &mut self,
        from: NodeId,
        client_startts: u64,
        digest: Digest,
        query: crate::bft::communication::message::ClientQuery<Vec<u8>>,
    ) -> bool {
        // §4.5 backpressure: once the gap between the highest assigned id
        // and the last committed one exceeds MAX_TXN_IN_FLIGHT, refuse new
        // batches outright rather than let the pipeline grow unbounded.
        let gap = u32::from(self.highest_assigned_seq()).saturating_sub(u32::from(self.log.low_watermark()));
        if gap as usize > self.max_txn_in_flight {
            return false;
        }

        self.log.insert_request(digest.clone(), from, query.clone());
        let entry = self
            .txn_table
            .insert(from, client_startts, query.clone(), digest.clone());
        if !entry.try_claim() {
            return false;
        }
        self.batcher.push(from, client_startts, digest, query)
    }

    /// The highest sequence number this replica has assigned to a batch
    /// so far, under whichever ordering protocol is active (§4.5).
    fn highest_assigned_seq(&self) -> SeqNo {
        match &self.protocol {
            Protocol::Classical(c) => c.sequence_number(),
            _ => self.next_seq,
        }
    }

    /// Schedules the batch timer for the instance about to be proposed
    /// (§4.4); fires `TimeoutKind::Batch` if nothing else proposes first.
    pub fn arm_batch_timer(&self, seq: SeqNo) {
        self.timeouts.timeout(self.batcher.batch_timeout(), TimeoutKind::Batch(seq));
    }

    /// Arms the view-change timer for the *next* view, per §4.7: fired
    /// whenever a proposal is accepted, and disarmed (by simply letting
    /// it fire into a no-op once superseded) once that proposal commits.
    pub fn arm_view_change_timer(&self) {
        if !self.view_changes_enabled {
            return;
        }
        // jittered so correct replicas don't all fire VIEW_CHANGE for the
        // same view in lockstep
        let jitter = prng::jitter_ms(self.view_change_timeout.as_millis() as u64 / 4);
        self.timeouts.timeout(
            self.view_change_timeout + Duration::from_millis(jitter),
            TimeoutKind::ViewChange(self.current_view().next()),
        );
    }

    /// Drains the current batch and, if this replica leads the current
    /// view, proposes it to a classical consensus instance (§3, §4.4),
    /// returning the `PRE-PREPARE` the caller (the replica's main loop,
    /// which owns the `Node` handle) should broadcast.
    ///
    /// The chained and DAG variants propose on their own per-round/per-
    /// leader cadence rather than gated on an empty-batch check, so they
    /// are driven directly from the main loop via `Chain::propose` /
    /// `Dag::insert_block` instead of through this helper.
    pub fn try_propose_classical(&mut self) -> Option<classical::PrePrepareMessage> {
        if self.protocol_kind != OrderingProtocol::Classical || self.batcher.is_empty() {
            return None;
        }
        let consensus = match &mut self.protocol {
            Protocol::Classical(c) => c,
            _ => return None,
        };
        if self.ctx.id() != self.ctx.leader_of(self.current_view()) {
            return None;
        }

        let drained = self.batcher.drain();
        let digests: Vec<_> = drained.iter().map(|(_, _, d, _)| d.clone()).collect();
        consensus.propose(digests, self.current_view(), &self.ctx)
    }

    /// Builds an `UpdateBatch` out of a freshly decided set of digests,
    /// resolving each to its request body via the shared log (§3, §4.5).
    /// Digests whose body never arrived locally (possible only after CST
    /// recovery glosses over a gap) are silently skipped.
    fn build_update_batch(&self, seq: SeqNo, digests: &[Digest]) -> UpdateBatch<Request<S>> {
        let updates = digests
            .iter()
            .filter_map(|d| {
                let (from, query) = self.log.get_request(d)?;
                let operation = (self.decode_request)(&query.operation);
                Some(Update::new(from, query.client_startts, d.clone(), operation))
            })
            .collect();
        UpdateBatch::new(seq, updates)
    }

    /// Common tail of every "batch just got decided" path: hands the
    /// batch to the executor, appends it to the log, and begins a new
    /// checkpoint once the period elapses (§4.6).
    fn on_decided(&mut self, seq: SeqNo, digests: Vec<Digest>) {
        let info = self.log.finalize_batch(seq, digests.clone());
        let batch = self.build_update_batch(seq, &digests);
        let want_checkpoint = matches!(info, crate::bft::log::Info::BeginCheckpoint);
        if want_checkpoint {
            self.log.begin_checkpoint(seq);
            let _ = self.executor.queue_update_and_get_appstate(batch);
        } else {
            let _ = self.executor.queue_update(batch);
        }
    }

    async fn send_system_to(
        &self,
        node: &Node<Wire>,
        targets: impl Iterator<Item = NodeId>,
        msg: &SystemMessage<Wire>,
    ) {
        let mut payload = Vec::new();
        if serialize_message(&mut payload, msg).is_err() {
            return;
        }
        let key = node.key_pair();
        for dest in targets {
            if dest == node.id() {
                continue;
            }
            let sig = match key.method().mode() {
                AuthMode::Digital => key.sign_digital(&payload),
                AuthMode::Authenticator => match key.authenticate_for(dest, &payload) {
                    Ok(s) => s,
                    Err(_) => continue,
                },
            };
            let (header, _) =
                crate::bft::communication::message::WireMessage::new(node.id(), dest, &payload, sig)
                    .into_inner();
            let _ = node.send_to(dest, header, &payload).await;
        }
    }

    async fn broadcast(&self, node: &Node<Wire>, msg: SystemMessage<Wire>) {
        self.send_system_to(node, NodeId::targets(0..self.ctx.n() as u32), &msg).await;
    }

    async fn unicast(&self, node: &Node<Wire>, to: NodeId, msg: SystemMessage<Wire>) {
        self.send_system_to(node, std::iter::once(to), &msg).await;
    }

    /// Sends a `KEY_EXCHANGE` message, always signed with the sender's
    /// Ed25519 identity key (§4.3) regardless of `CRYPTO_METHOD` — unlike
    /// every other outbound message, this one cannot go through
    /// `send_system_to`'s mode-based signing, since an `Authenticator`-
    /// mode replica has no pairwise secret established yet to sign with.
    async fn send_key_exchange(&self, node: &Node<Wire>, to: NodeId, msg: KeyExchangeMessage) {
        let system = SystemMessage::KeyExchange(msg);
        let mut payload = Vec::new();
        if serialize_message(&mut payload, &system).is_err() {
            return;
        }
        let sig = node.key_pair().sign_bootstrap(&payload);
        let (header, _) =
            crate::bft::communication::message::WireMessage::new(node.id(), to, &payload, sig)
                .into_inner();
        let _ = node.send_to(to, header, &payload).await;
    }

    /// Announces this replica's public key to every peer (§4.3); in
    /// `Authenticator` mode, also proposes a fresh pairwise secret to
    /// each of them. Re-sent on a timer until every peer has checked in.
    async fn announce_key_exchange(&self, node: &Node<Wire>) {
        let key = node.key_pair();
        for dest in NodeId::targets(0..self.ctx.n() as u32) {
            if dest == node.id() {
                continue;
            }
            let msg = match key.method().mode() {
                AuthMode::Digital => KeyExchange::announcement(key),
                AuthMode::Authenticator => {
                    let secret = KeyPair::generate_pairwise_secret();
                    key.install_pairwise_secret(dest, secret);
                    KeyExchange::unicast_secret(key, secret)
                }
            };
            self.send_key_exchange(node, dest, msg).await;
        }
    }

    /// Records one peer's `KEY_EXCHANGE` announcement; once every peer
    /// has checked in, freezes the verification key table (§4.3).
    fn handle_key_exchange(&mut self, node: &Node<Wire>, from: NodeId, msg: KeyExchangeMessage) {
        let key_exchange = match &mut self.key_exchange {
            Some(ke) => ke,
            None => return,
        };
        key_exchange.receive(from, node.key_pair(), msg);
        if key_exchange.is_complete() {
            if let Some(ke) = self.key_exchange.take() {
                if let Ok(keys) = ke.into_public_key_set() {
                    self.ctx.install_peer_keys(keys);
                }
            }
        }
    }

    /// Drives the classical protocol's reaction to one `System` message,
    /// broadcasting/unicasting whatever phase message falls out (§3).
    async fn handle_classical(&mut self, node: &Node<Wire>, header: Header, msg: SystemMessage<Wire>) {
        let current_view = self.current_view();
        let consensus = match &mut self.protocol {
            Protocol::Classical(c) => c,
            _ => return,
        };
        match msg {
            SystemMessage::PrePrepare(m) => {
                let (_status, prepare) =
                    consensus.process_pre_prepare(header, m, current_view, &self.ctx, &*self.log);
                if let Some(prepare) = prepare {
                    self.broadcast(node, SystemMessage::Prepare(prepare)).await;
                }
            }
            SystemMessage::Prepare(m) => {
                let (_status, commit) = consensus.process_prepare(header, m, &self.ctx);
                if let Some(commit) = commit {
                    self.broadcast(node, SystemMessage::Commit(commit)).await;
                }
            }
            SystemMessage::Commit(m) => {
                let seq = m.sequence_number();
                if let classical::ConsensusStatus::Decided(digests) =
                    consensus.process_commit(header, m, &self.ctx)
                {
                    consensus.next_instance();
                    self.on_decided(seq, digests);
                }
            }
            _ => {}
        }
    }

    /// Drives the chained protocol's reaction to one `System` message
    /// (§3): non-leaders vote back to the round's leader; the leader
    /// aggregates votes into quorum certs and runs the three-chain
    /// commit rule.
    async fn handle_chained(&mut self, node: &Node<Wire>, header: Header, msg: SystemMessage<Wire>) {
        let n = self.ctx.n();
        match msg {
            SystemMessage::Proposal(m) => {
                let digest = m.block_digest();
                let round = m.round();
                if let Protocol::Chained(chain) = &mut self.protocol {
                    chain.accept_proposal(&m);
                }
                let sig = node.key_pair().sign_digital(digest.as_ref());
                let vote = chained::VoteMessage::new(round, digest);
                self.unicast(node, leader_of_round(round, n), SystemMessage::Vote(vote)).await;
                let _ = sig;
            }
            SystemMessage::Vote(m) => {
                let round = m.round();
                let digest = m.block_digest().clone();
                let committed = if let Protocol::Chained(chain) = &mut self.protocol {
                    chain.add_vote(round, digest, header.from(), *header.signature(), &self.ctx)
                } else {
                    Vec::new()
                };
                for (committed_round, digests) in committed {
                    let seq = SeqNo::from(u64::from(committed_round) as u32);
                    self.on_decided(seq, digests);
                }
            }
            _ => {}
        }
    }

    /// Drives the DAG protocol's reaction to one `System` message (§3,
    /// §3.2): every block is certified on receipt, certificates are
    /// aggregated, and each round end is checked for a wave-leader
    /// commit, reordered for fairness before being handed to execution.
    async fn handle_dag(&mut self, node: &Node<Wire>, _header: Header, msg: SystemMessage<Wire>) {
        match msg {
            SystemMessage::Block(m) => {
                let round = m.round();
                let author = m.author();
                let digest = if let Protocol::Dag(d) = &mut self.protocol {
                    Some(d.insert_block(&m))
                } else {
                    None
                };
                let digest = match digest {
                    Some(d) => d,
                    None => return,
                };
                let sig = node.key_pair().sign_digital(digest.as_ref());
                let vote = dag::CertMessage::new_vote(round, author, digest, self.ctx.id(), sig);
                self.broadcast(node, SystemMessage::Cert(vote)).await;
            }
            SystemMessage::Cert(m) => {
                let digest = m.block_digest().clone();
                let signers: Vec<_> = m.signers().to_vec();
                for (voter, sig) in signers {
                    if let Protocol::Dag(d) = &mut self.protocol {
                        d.add_cert(digest.clone(), voter, sig);
                    }
                }
                let wave = m.round();
                let committed = if let Protocol::Dag(d) = &mut self.protocol {
                    d.try_commit_wave(wave, &self.ctx)
                } else {
                    Vec::new()
                };
                if committed.is_empty() {
                    return;
                }
                let request_digests: Vec<Digest> = if let Protocol::Dag(d) = &self.protocol {
                    committed.iter().flat_map(|b| d.batch_digests(b).to_vec()).collect()
                } else {
                    Vec::new()
                };
                // This replica's own causal-history walk is the only
                // "local order" ballot fed into the graph: no wire message
                // here carries peers' locally-derived orders to aggregate
                // against a real 2f+1 threshold, so the threshold is 1.
                self.fairness.record(&fairness::LocalOrder {
                    sequence: request_digests.clone(),
                });
                let fair_order = self.fairness.order(1);
                let seq = self.next_seq;
                self.next_seq = self.next_seq.next();
                self.on_decided(seq, fair_order);
            }
            _ => {}
        }
    }

    /// Dispatches one decoded, verified `System` message to whichever
    /// handler it concerns: the active ordering protocol, client-batch
    /// intake, or the checkpoint/key-exchange side channels.
    async fn handle_system(&mut self, node: &Node<Wire>, header: Header, msg: SystemMessage<Wire>) {
        match (&msg, self.protocol_kind) {
            (SystemMessage::ClientBatch(_), _) => {
                if let SystemMessage::ClientBatch(batch) = msg {
                    for query in batch.queries {
                        let _ = self
                            .new_txn_tx
                            .send(NewTxnWork {
                                from: query.client_id,
                                client_startts: query.client_startts,
                                query,
                            })
                            .await;
                    }
                }
            }
            (SystemMessage::PrePrepare(_), OrderingProtocol::Classical)
            | (SystemMessage::Prepare(_), OrderingProtocol::Classical)
            | (SystemMessage::Commit(_), OrderingProtocol::Classical) => {
                self.handle_classical(node, header, msg).await;
            }
            (SystemMessage::Proposal(_), OrderingProtocol::Chained)
            | (SystemMessage::Vote(_), OrderingProtocol::Chained) => {
                self.handle_chained(node, header, msg).await;
            }
            (SystemMessage::Block(_), OrderingProtocol::Dag)
            | (SystemMessage::Cert(_), OrderingProtocol::Dag) => {
                self.handle_dag(node, header, msg).await;
            }
            (SystemMessage::Checkpoint(_), _) => {
                if let SystemMessage::Checkpoint(m) = msg {
                    self.handle_checkpoint_vote(header.from(), m);
                }
            }
            (SystemMessage::KeyExchange(_), _) => {
                if let SystemMessage::KeyExchange(m) = msg {
                    self.handle_key_exchange(node, header.from(), m);
                }
            }
            (SystemMessage::ViewChange(_), _) => {
                if let SystemMessage::ViewChange(m) = msg {
                    let next_view = m.new_view();
                    if let Some(evidence) = self.synchronizer.receive_view_change(header.from(), m, &self.ctx) {
                        // Only the incoming primary assembles and
                        // broadcasts the NEW_VIEW (§4.7); every other
                        // replica waits to receive and verify one rather
                        // than installing on its own tally, closing the
                        // "any replica can self-install" gap.
                        if self.ctx.id() == self.ctx.leader_of(next_view) {
                            let nv = NewViewMessage::from_evidence(next_view, evidence, self.ctx.f());
                            self.broadcast(node, SystemMessage::NewView(nv.clone())).await;
                            self.install_new_view(node, nv).await;
                        }
                    }
                }
            }
            (SystemMessage::NewView(_), _) => {
                if let SystemMessage::NewView(m) = msg {
                    let valid = m.new_view() > self.current_view()
                        && header.from() == self.ctx.leader_of(m.new_view())
                        && m.is_valid(&self.ctx);
                    if valid {
                        self.install_new_view(node, m).await;
                    }
                }
            }
            _ => {}
        }
    }

    /// Installs a verified `NEW_VIEW`: advances the synchronizer, resets
    /// the round-robin bookkeeping the other ordering protocols use, and
    /// — for the classical protocol only — replays the oldest batch the
    /// evidence proves was prepared under the old view, under a fresh
    /// `PRE-PREPARE` in the new one (§4.7). The single-active-instance
    /// design of `classical::Consensus` means there is at most one such
    /// batch to carry forward at a time; any later instances proceed
    /// through ordinary batching once this one decides.
    async fn install_new_view(&mut self, node: &Node<Wire>, nv: NewViewMessage) {
        self.synchronizer.install_new_view(nv.clone());
        self.current_round = Round::ZERO;
        self.ctx.clear_all_failed();

        if self.protocol_kind != OrderingProtocol::Classical {
            return;
        }
        let (seq, digests) = match nv.pre_prepares().first().cloned() {
            Some(entry) => entry,
            None => return,
        };
        let new_view = nv.new_view();
        if self.ctx.id() != self.ctx.leader_of(new_view) {
            return;
        }
        let pp = if let Protocol::Classical(consensus) = &mut self.protocol {
            if seq != consensus.sequence_number() {
                consensus.install_sequence_number(seq, self.window);
            }
            consensus.propose(digests, new_view, &self.ctx)
        } else {
            None
        };
        if let Some(pp) = pp {
            self.arm_view_change_timer();
            self.broadcast(node, SystemMessage::PrePrepare(pp)).await;
        }
    }

    /// Tallies `CHECKPOINT` votes for a stable checkpoint (§4.6): once a
    /// quorum agrees on the same digest for `seq`, the log and txn pool
    /// are garbage-collected behind it.
    fn handle_checkpoint_vote(&mut self, from: NodeId, m: crate::bft::log::CheckpointMessage) {
        let seq = m.sequence_number();
        // §8: a checkpoint at a sequence number strictly less than (or
        // equal to, since it would be a no-op either way) the current
        // stable checkpoint never moves the watermark backwards.
        if seq <= self.log.low_watermark() {
            return;
        }
        let digest = m.state_digest().clone();
        let entry = self.checkpoint_votes.entry(seq).or_insert_with(Vec::new);
        if !entry.iter().any(|(id, _)| *id == from) {
            entry.push((from, digest.clone()));
        }
        let matching = entry.iter().filter(|(_, d)| *d == digest).count();
        if matching >= self.ctx.quorum() {
            let released = self.log.prune_below(seq);
            self.txn_table.release(&released);
            self.ctx.advance_low_watermark(u32::from(seq));
            self.checkpoint_votes.retain(|s, _| *s > seq);
        }
    }

    /// Proposes the current batch under whichever protocol is active and
    /// broadcasts the resulting message, if this replica is the one that
    /// should propose right now.
    async fn try_propose_and_broadcast(&mut self, node: &Node<Wire>) {
        match self.protocol_kind {
            OrderingProtocol::Classical => {
                if let Some(pp) = self.try_propose_classical() {
                    self.arm_view_change_timer();
                    self.broadcast(node, SystemMessage::PrePrepare(pp)).await;
                }
            }
            OrderingProtocol::Chained => {
                if self.batcher.is_empty() {
                    return;
                }
                let n = self.ctx.n();
                if self.ctx.id() != leader_of_round(self.current_round, n) {
                    return;
                }
                let drained = self.batcher.drain();
                let digests: Vec<_> = drained.iter().map(|(_, _, d, _)| d.clone()).collect();
                let seq = self.next_seq;
                self.next_seq = self.next_seq.next();
                let round = self.current_round;
                self.current_round = self.current_round.next();
                if let Protocol::Chained(chain) = &self.protocol {
                    let proposal = chain.propose(round, seq, digests);
                    self.broadcast(node, SystemMessage::Proposal(proposal)).await;
                }
            }
            OrderingProtocol::Dag => {
                if self.batcher.is_empty() {
                    return;
                }
                let drained = self.batcher.drain();
                let digests: Vec<_> = drained.iter().map(|(_, _, d, _)| d.clone()).collect();
                let seq = self.next_seq;
                self.next_seq = self.next_seq.next();
                let round = self.current_round;
                self.current_round = self.current_round.next();
                let quorum = self.ctx.quorum();
                let (parents, weak_parents) = if let Protocol::Dag(d) = &self.protocol {
                    let parents = d.parents_for(round, quorum);
                    let weak_parents = d.weak_parents_for(quorum, &parents);
                    (parents, weak_parents)
                } else {
                    (Vec::new(), Vec::new())
                };
                let block = dag::BlockMessage::new(round, self.ctx.id(), seq, digests, parents, weak_parents);
                self.broadcast(node, SystemMessage::Block(block)).await;
            }
        }
    }

    /// Sends one completed `CL_RSP`, signed the same way as any other
    /// outbound message, directly to the client it answers (§4.5, §6).
    async fn send_client_response(&self, node: &Node<Wire>, to: NodeId, msg: ClientResponseMessage) {
        self.unicast(node, to, SystemMessage::ClientResponse(msg)).await;
    }

    /// Installs a just-completed local checkpoint and queues it to be
    /// gossiped (§4.6).
    fn handle_checkpoint_ready(&mut self, ready: CheckpointReady<State<S>>) {
        self.log.finalize_checkpoint(ready.state, ready.digest.clone());
        let _ = self.checkpoint_gossip_tx.clone().try_send(CheckpointWork {
            seq: ready.seq,
            state_digest: ready.digest,
        });
    }

    async fn broadcast_checkpoint(&self, node: &Node<Wire>, work: CheckpointWork) {
        let msg = crate::bft::log::CheckpointMessage::new(work.seq, work.state_digest);
        self.broadcast(node, SystemMessage::Checkpoint(msg)).await;
    }

    async fn handle_connection_event(&self, node: &mut Node<Wire>, message: Message<Wire>) {
        match message {
            Message::ConnectedTx(peer_id, sock) => {
                node.install_tx_socket(peer_id, sock);
            }
            Message::ConnectedRx(peer_id, sock) => {
                let decode = make_decoder(self.ctx.clone(), node.key_pair().clone());
                Node::spawn_read_loop(peer_id, sock, node.sender(), self.msg_size_max, decode);
            }
            Message::Error(peer_id, _e) => {
                self.ctx.mark_failed(peer_id);
            }
            _ => {}
        }
    }

    /// Reacts to a fired timeout (§4.7, §4.4, §4.8). Batch timeouts
    /// re-attempt a proposal with whatever has accumulated so far; view-
    /// change timeouts join (or start) a view change once this replica
    /// sees `f+1` peers doing the same; CST timeouts are not modeled
    /// here (recovery is driven externally via `bft::cst`, not from this
    /// loop, since a replica only ever runs CST while catching up, not
    /// during steady-state operation).
    async fn handle_timeout(&mut self, node: &Node<Wire>, kind: TimeoutKind) {
        match kind {
            TimeoutKind::Batch(_seq) => {
                self.try_propose_and_broadcast(node).await;
            }
            TimeoutKind::ViewChange(next_view) => {
                if next_view != self.current_view().next() {
                    return;
                }
                let stable = self.log.low_watermark();
                let prepared = match &self.protocol {
                    Protocol::Classical(c) => c
                        .prepared_batch()
                        .map(|(seq, digest, requests)| PreparedInstance::new(seq, digest, requests))
                        .into_iter()
                        .collect(),
                    _ => Vec::new(),
                };
                let vc = ViewChangeMessage::new(next_view, stable, prepared);
                self.broadcast(node, SystemMessage::ViewChange(vc)).await;
            }
            TimeoutKind::Cst(_) => {}
            TimeoutKind::KeyExchange => {
                if self.key_exchange.is_some() {
                    self.announce_key_exchange(node).await;
                    self.arm_key_exchange_timer();
                }
            }
        }
    }

    /// Re-arms the key-exchange retry timer (§4.3) as long as this
    /// replica hasn't collected every peer's key yet.
    fn arm_key_exchange_timer(&self) {
        self.timeouts
            .timeout(Duration::from_millis(500), TimeoutKind::KeyExchange);
    }

    /// The replica's single-threaded event loop (§5's "scheduling
    /// model"): everything but `Service::update` itself (off on its own
    /// thread, see `bft::executable::Executor`) and socket I/O (off on
    /// the async runtime's worker threads) happens here, one event at a
    /// time, so no two consensus-state mutations ever race.
    pub async fn run(mut self, mut node: Node<Wire>) -> ! {
        self.arm_batch_timer(SeqNo::ZERO);
        self.announce_key_exchange(&node).await;
        self.arm_key_exchange_timer();
        loop {
            futures::select! {
                incoming = node.receiver().recv().fuse() => {
                    match incoming {
                        Ok(Message::System(header, msg)) => self.handle_system(&node, header, msg).await,
                        Ok(Message::Timeout(kind)) => self.handle_timeout(&node, kind).await,
                        Ok(other) => self.handle_connection_event(&mut node, other).await,
                        Err(_) => {}
                    }
                }
                reply = self.reply_rx.recv().fuse() => {
                    if let Ok((to, msg)) = reply {
                        self.send_client_response(&node, to, msg).await;
                    }
                }
                chk = self.checkpoint_rx.recv().fuse() => {
                    if let Ok(ready) = chk {
                        self.handle_checkpoint_ready(ready);
                    }
                }
                gossip = self.checkpoint_gossip_rx.recv().fuse() => {
                    if let Ok(work) = gossip {
                        self.broadcast_checkpoint(&node, work).await;
                    }
                }
                digested = self.worker_rx.recv().fuse() => {
                    if let Ok(wr) = digested {
                        let became_full = self.offer_request(wr.from, wr.client_startts, wr.digest, wr.query);
                        if became_full {
                            self.try_propose_and_broadcast(&node).await;
                        }
                    }
                }
            }
        }
    }
}
