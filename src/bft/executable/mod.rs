//! User application execution (§4.5): requests decided by whichever
//! ordering protocol is active are handed here, in commit order, to be
//! applied against the service's state and turned into `CL_RSP` replies.
//! `Executor`/`ExecutorHandle` run a dedicated thread-per-service design,
//! keeping the (possibly slow, user-supplied) `Service::update` off the
//! async runtime's worker threads.

use std::sync::mpsc;
use std::thread;

use crate::bft::communication::channel::ChannelTx;
use crate::bft::communication::message::ClientResponseMessage;
use crate::bft::communication::serialize::SharedData;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::{self, Digest};
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;

/// A single client update request, carried alongside the bookkeeping
/// needed to route its reply back.
#[derive(Clone)]
pub struct Update<O> {
    from: NodeId,
    client_startts: u64,
    digest: Digest,
    operation: O,
}

impl<O> Update<O> {
    pub fn new(from: NodeId, client_startts: u64, digest: Digest, operation: O) -> Self {
        Self {
            from,
            client_startts,
            digest,
            operation,
        }
    }

    pub fn into_inner(self) -> (NodeId, u64, Digest, O) {
        (self.from, self.client_startts, self.digest, self.operation)
    }
}

/// A single client update reply, paired with the request it answers.
#[derive(Clone)]
pub struct UpdateReply<P> {
    to: NodeId,
    client_startts: u64,
    digest: Digest,
    payload: P,
}

/// A batch of client update requests, decided together by one consensus
/// instance and executed together (§3's "batch" unit).
#[derive(Clone)]
pub struct UpdateBatch<O> {
    seq: crate::bft::ordering::SeqNo,
    inner: Vec<Update<O>>,
}

impl<O> UpdateBatch<O> {
    pub fn new(seq: crate::bft::ordering::SeqNo, inner: Vec<Update<O>>) -> Self {
        Self { seq, inner }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn into_inner(self) -> Vec<Update<O>> {
        self.inner
    }
}

/// A batch of client update replies.
pub struct UpdateBatchReplies<P> {
    view: u32,
    inner: Vec<UpdateReply<P>>,
}

impl<P> UpdateBatchReplies<P> {
    pub fn with_capacity(view: u32, capacity: usize) -> Self {
        Self {
            view,
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, to: NodeId, client_startts: u64, digest: Digest, payload: P) {
        self.inner.push(UpdateReply {
            to,
            client_startts,
            digest,
            payload,
        });
    }

    /// Groups replies by destination client and turns them into one
    /// `CL_RSP` per client, per §6's client-protocol framing.
    pub fn into_responses(self) -> Vec<(NodeId, ClientResponseMessage)> {
        use crate::bft::collections::{self, HashMap};
        let mut by_client: HashMap<NodeId, Vec<(u64, u64)>> = collections::hash_map();
        for reply in self.inner {
            by_client
                .entry(reply.to)
                .or_insert_with(Vec::new)
                .push((reply.digest.as_ref()[0] as u64, reply.client_startts));
        }
        by_client
            .into_iter()
            .map(|(to, entries)| {
                (
                    to,
                    ClientResponseMessage {
                        view: self.view,
                        entries,
                    },
                )
            })
            .collect()
    }
}

enum ExecutionRequest<S, O> {
    InstallState(S, Vec<O>),
    Update(UpdateBatch<O>),
    UpdateAndGetAppstate(UpdateBatch<O>),
}

/// A completed local checkpoint (§4.6): the execution thread serializes
/// and hashes the state itself, since it is the only thread holding it.
pub struct CheckpointReady<S> {
    pub seq: SeqNo,
    pub state: S,
    pub digest: Digest,
}

/// State type of the `Service`.
pub type State<S> = <<S as Service>::Data as SharedData>::State;
/// Request type of the `Service`.
pub type Request<S> = <<S as Service>::Data as SharedData>::Request;
/// Reply type of the `Service`.
pub type Reply<S> = <<S as Service>::Data as SharedData>::Reply;

/// A user-defined state machine: the only piece of this crate the
/// embedding application must implement (§4.5, "deterministic KV-store
/// apply function").
pub trait Service {
    type Data: SharedData;

    fn initial_state(&mut self) -> Result<State<Self>>;

    /// Processes one request deterministically, updating `state` in
    /// place and producing the reply sent back to the client.
    fn update(&mut self, state: &mut State<Self>, request: Request<Self>) -> Reply<Self>;
}

/// Stateful data of the dedicated execution thread.
pub struct Executor<S: Service> {
    service: S,
    state: State<S>,
    e_rx: mpsc::Receiver<ExecutionRequest<State<S>, Request<S>>>,
    reply_tx: ChannelTx<(NodeId, ClientResponseMessage)>,
    checkpoint_tx: ChannelTx<CheckpointReady<State<S>>>,
}

/// A handle to the execution thread, cloneable so every part of the
/// core server that needs to queue work can hold one.
pub struct ExecutorHandle<S: Service> {
    e_tx: mpsc::Sender<ExecutionRequest<State<S>, Request<S>>>,
}

impl<S: Service> Clone for ExecutorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            e_tx: self.e_tx.clone(),
        }
    }
}

impl<S> ExecutorHandle<S>
where
    S: Service + Send + 'static,
    Request<S>: Send + 'static,
    Reply<S>: Send + 'static,
{
    pub fn install_state(&self, state: State<S>, after: Vec<Request<S>>) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::InstallState(state, after))
            .simple(ErrorKind::Executable)
    }

    pub fn queue_update(&self, batch: UpdateBatch<Request<S>>) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::Update(batch))
            .simple(ErrorKind::Executable)
    }

    /// Same as `queue_update`, additionally reporting the serialized
    /// application state — used to complete a local checkpoint (§4.6).
    pub fn queue_update_and_get_appstate(&self, batch: UpdateBatch<Request<S>>) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::UpdateAndGetAppstate(batch))
            .simple(ErrorKind::Executable)
    }
}

impl<S> Executor<S>
where
    S: Service + Send + 'static,
    State<S>: Send + Clone + 'static,
    Request<S>: Send + 'static,
    Reply<S>: Send + 'static,
{
    /// Spawns the execution thread. Kept off the async runtime
    /// deliberately: a user `Service::update` implementation may run
    /// arbitrary, possibly slow, synchronous code.
    pub fn new(
        reply_tx: ChannelTx<(NodeId, ClientResponseMessage)>,
        checkpoint_tx: ChannelTx<CheckpointReady<State<S>>>,
        mut service: S,
    ) -> Result<ExecutorHandle<S>> {
        let (e_tx, e_rx) = mpsc::channel();
        let state = service.initial_state()?;
        let mut exec = Executor {
            e_rx,
            reply_tx,
            checkpoint_tx,
            service,
            state,
        };

        thread::spawn(move || {
            while let Ok(exec_req) = exec.e_rx.recv() {
                match exec_req {
                    ExecutionRequest::InstallState(checkpoint, after) => {
                        exec.state = checkpoint;
                        for req in after {
                            exec.service.update(&mut exec.state, req);
                        }
                    }
                    ExecutionRequest::Update(batch) => {
                        let reply_batch = exec.apply_batch(batch);
                        for (to, msg) in reply_batch.into_responses() {
                            let _ = exec.reply_tx.try_send((to, msg));
                        }
                    }
                    ExecutionRequest::UpdateAndGetAppstate(batch) => {
                        let seq = batch.seq;
                        let reply_batch = exec.apply_batch(batch);
                        for (to, msg) in reply_batch.into_responses() {
                            let _ = exec.reply_tx.try_send((to, msg));
                        }
                        let mut bytes = Vec::new();
                        let digest = if S::Data::serialize_state(&mut bytes, &exec.state).is_ok() {
                            hash::digest(&bytes[..])
                        } else {
                            Digest::blank()
                        };
                        let _ = exec.checkpoint_tx.try_send(CheckpointReady {
                            seq,
                            state: exec.state.clone(),
                            digest,
                        });
                    }
                }
            }
        });

        Ok(ExecutorHandle { e_tx })
    }
}

impl<S> Executor<S>
where
    S: Service,
    State<S>: Clone,
{
    fn apply_batch(&mut self, batch: UpdateBatch<Request<S>>) -> UpdateBatchReplies<Reply<S>> {
        let view = 0;
        let mut reply_batch = UpdateBatchReplies::with_capacity(view, batch.len());
        for update in batch.into_inner() {
            let (peer_id, startts, dig, req) = update.into_inner();
            let reply = self.service.update(&mut self.state, req);
            reply_batch.add(peer_id, startts, dig, reply);
        }
        reply_batch
    }
}
