//! Communication primitives for `concordbft`: wire message formats, and
//! the [`Node`] that owns one plaintext TCP connection per ordered pair
//! of replicas (§4.1).
//!
//! No TLS layer sits under the transport: §4.2's sign/verify discipline
//! is the only authentication and integrity mechanism, applied uniformly
//! whether the link is a loopback socket in a test or a routed
//! connection in production (see DESIGN.md for why `rustls`/`async-tls`
//! were not added to the dependency stack).

#[cfg(not(feature = "expose_impl"))]
mod socket;

#[cfg(feature = "expose_impl")]
pub mod socket;

pub mod channel;
pub mod keyexchange;
pub mod message;
pub mod serialize;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use std::collections::HashMap as StdHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::lock::Mutex;
use futures_timer::Delay;

use crate::bft::async_runtime as rt;
use crate::bft::communication::channel::{new_bounded, ChannelRx, ChannelTx};
use crate::bft::communication::message::{Header, Message, WireMessage};
use crate::bft::communication::socket::{Listener, Socket};
use crate::bft::crypto::signature::{KeyPair, PublicKey, Signature};
use crate::bft::error::*;
use crate::bft::globals::ReplicaContext;

/// A `NodeId` represents the id of a process in the BFT system: either a
/// replica (`0..n`) or a client, per §3.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator.into_iter().map(Self)
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(id: u32) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for usize {
    #[inline]
    fn from(id: NodeId) -> usize {
        id.0 as usize
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

struct NodeTxData {
    sock: Mutex<Socket>,
}

/// A `Node` owns every outbound and inbound connection to peer replicas,
/// and is the core component used in wire communication between
/// processes (§4.1).
pub struct Node<O> {
    id: NodeId,
    my_key: Arc<KeyPair>,
    ctx: Arc<ReplicaContext>,
    my_tx: ChannelTx<Message<O>>,
    my_rx: ChannelRx<Message<O>>,
    peer_addrs: StdHashMap<NodeId, SocketAddr>,
    peer_tx: parking_lot::RwLock<StdHashMap<NodeId, Arc<NodeTxData>>>,
}

/// Represents a configuration used to bootstrap a `Node`.
pub struct NodeConfig {
    /// The number of nodes allowed to fail in the system (§3); BFT
    /// systems require `n >= 3*f + 1`.
    pub f: usize,
    /// The id of this `Node`.
    pub id: NodeId,
    /// The addresses of all replicas in the system.
    pub addrs: StdHashMap<NodeId, SocketAddr>,
    /// The secret key of this particular `Node`.
    pub sk: KeyPair,
}

impl<O: Send + 'static> Node<O> {
    const CHAN_BOUND: usize = 128;

    /// Bootstrap a `Node`: open a listener, dial every peer of greater id
    /// (the lesser-id side dials, keeping exactly one connection per
    /// ordered pair), then run the key-exchange of §4.3 over the
    /// freshly-established links before returning.
    pub async fn bootstrap(
        cfg: NodeConfig,
    ) -> Result<(Self, Arc<ReplicaContext>, Vec<Message<O>>)> {
        let id = cfg.id;
        let n = cfg.addrs.len();

        if n < (3 * cfg.f + 1) {
            return Err("Invalid number of replicas").wrapped(ErrorKind::Communication);
        }
        if usize::from(id) >= n {
            return Err("Invalid node ID").wrapped(ErrorKind::Communication);
        }

        let listener = socket::bind(cfg.addrs[&id])
            .await
            .wrapped(ErrorKind::Communication)?;

        let (tx, rx) = new_bounded::<Message<O>>(Self::CHAN_BOUND);

        rt::spawn(Self::rx_side_accept(id, listener, tx.clone()));
        Self::tx_side_connect(id, tx.clone(), &cfg.addrs);

        let my_key = Arc::new(cfg.sk);
        let ctx = ReplicaContext::new(id, n, cfg.f);

        let node = Node {
            id,
            my_key,
            ctx: ctx.clone(),
            my_tx: tx,
            my_rx: rx,
            peer_addrs: cfg.addrs,
            peer_tx: parking_lot::RwLock::new(StdHashMap::new()),
        };
        Ok((node, ctx, Vec::new()))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn context(&self) -> &Arc<ReplicaContext> {
        &self.ctx
    }

    /// The key material this replica signs/authenticates with.
    pub fn key_pair(&self) -> &Arc<KeyPair> {
        &self.my_key
    }

    /// Sends a pre-framed [`WireMessage`] to `dest`, marking the peer
    /// failed (§4.1 (c)) if the write does not succeed. A slow or
    /// unreachable peer never blocks other destinations, since each
    /// connection is independently mutex-guarded.
    pub async fn send_to(&self, dest: NodeId, header: Header, payload: &[u8]) -> Result<()> {
        let conn = {
            let peers = self.peer_tx.read();
            peers.get(&dest).cloned()
        };
        let conn = match conn {
            Some(c) => c,
            None => {
                self.ctx.mark_failed(dest);
                return Err("No connection established to destination")
                    .wrapped(ErrorKind::Communication);
            }
        };

        let mut buf = Vec::with_capacity(Header::LENGTH + payload.len());
        buf.resize(Header::LENGTH, 0);
        header.serialize_into(&mut buf[..])?;
        buf.extend_from_slice(payload);

        let mut sock = conn.sock.lock().await;
        match sock.write_all(&buf[..]).await {
            Ok(()) => {
                self.ctx.clear_failed(dest);
                Ok(())
            }
            Err(_) => {
                self.ctx.mark_failed(dest);
                Err("Failed writing to peer socket").wrapped(ErrorKind::Communication)
            }
        }
    }

    /// Broadcasts the same pre-framed message to every id yielded by
    /// `targets`.
    pub async fn broadcast(
        &self,
        targets: impl Iterator<Item = NodeId>,
        header: Header,
        payload: &[u8],
    ) {
        for dest in targets {
            if dest == self.id {
                continue;
            }
            let _ = self.send_to(dest, header, payload).await;
        }
    }

    pub fn receiver(&mut self) -> &mut ChannelRx<Message<O>> {
        &mut self.my_rx
    }

    /// A clone of this node's own inbound channel sender, for tasks
    /// spawned outside `Node` itself (the per-connection read loop) that
    /// need to feed decoded messages back into the core server's single
    /// receive loop.
    pub fn sender(&self) -> ChannelTx<Message<O>> {
        self.my_tx.clone()
    }

    #[inline]
    fn tx_side_connect(my_id: NodeId, tx: ChannelTx<Message<O>>, addrs: &StdHashMap<NodeId, SocketAddr>) {
        let n = addrs.len() as u32;
        for peer_id in NodeId::targets(0..n).filter(|&id| id != my_id) {
            let tx = tx.clone();
            let addr = addrs[&peer_id];
            rt::spawn(Self::tx_side_connect_task(my_id, peer_id, tx, addr));
        }
    }

    async fn tx_side_connect_task(
        my_id: NodeId,
        peer_id: NodeId,
        mut tx: ChannelTx<Message<O>>,
        addr: SocketAddr,
    ) {
        const RETRY: usize = 10;
        for _ in 0..RETRY {
            if let Ok(sock) = socket::connect(addr).await {
                let (header, _) =
                    WireMessage::new(my_id, peer_id, &[], Signature::zeroed()).into_inner();
                let mut buf = [0; Header::LENGTH];
                if header.serialize_into(&mut buf[..]).is_err() {
                    return;
                }
                let mut sock = sock;
                if sock.write_all(&buf[..]).await.is_err() {
                    return;
                }
                tx.send(Message::ConnectedTx(peer_id, sock)).await.unwrap_or(());
                return;
            }
            Delay::new(Duration::from_secs(1)).await;
        }
        let e = Error::simple(ErrorKind::Communication);
        tx.send(Message::Error(peer_id, e)).await.unwrap_or(());
    }

    async fn rx_side_accept(my_id: NodeId, listener: Listener, tx: ChannelTx<Message<O>>) {
        loop {
            if let Ok(sock) = listener.accept().await {
                let tx = tx.clone();
                rt::spawn(Self::rx_side_accept_task(my_id, sock, tx));
            }
        }
    }

    // the handshake header doesn't need to be signed: it is never stored
    // in the decision log, only used to learn the peer's id
    async fn rx_side_accept_task(my_id: NodeId, sock: Socket, mut tx: ChannelTx<Message<O>>) {
        let mut buf_header = [0; Header::LENGTH];
        let mut sock = sock;

        if sock.read_exact(&mut buf_header[..]).await.is_err() {
            return;
        }

        let header = match Header::deserialize_from(&buf_header[..]) {
            Ok(h) => h,
            Err(_) => return,
        };

        let peer_id = match WireMessage::from_parts(header, &[]) {
            Ok(wm) if wm.header().to() != my_id => return,
            Ok(wm) => wm.header().from(),
            Err(_) => return,
        };

        tx.send(Message::ConnectedRx(peer_id, sock)).await.unwrap_or(());
    }

    /// Installs the socket half arriving from [`Message::ConnectedTx`] as
    /// this peer's write connection.
    pub fn install_tx_socket(&self, peer_id: NodeId, sock: Socket) {
        let mut peers = self.peer_tx.write();
        peers.insert(
            peer_id,
            Arc::new(NodeTxData {
                sock: Mutex::new(sock),
            }),
        );
    }

    /// Spawns a task that reads length-delimited frames off `sock` and
    /// forwards deserialized [`Message::System`] values into `tx`, until
    /// the connection errors out or is closed by the peer. Called by the
    /// core server loop once it consumes a [`Message::ConnectedRx`] event.
    pub fn spawn_read_loop<F>(
        peer_id: NodeId,
        mut sock: Socket,
        mut tx: ChannelTx<Message<O>>,
        msg_size_max: u64,
        decode: F,
    ) where
        F: Fn(Header, &[u8]) -> Option<Message<O>> + Send + 'static,
        O: Send + 'static,
    {
        rt::spawn(async move {
            let mut buf_header = [0; Header::LENGTH];
            loop {
                if sock.read_exact(&mut buf_header[..]).await.is_err() {
                    let e = Error::simple(ErrorKind::Communication);
                    tx.send(Message::Error(peer_id, e)).await.unwrap_or(());
                    return;
                }
                let header = match Header::deserialize_from(&buf_header[..]) {
                    Ok(h) => h,
                    Err(_) => continue,
                };
                // §6's MSG_SIZE_MAX: a peer claiming a frame bigger than
                // this is either corrupt or malicious — drop the
                // connection rather than allocate on its say-so.
                if header.length() > msg_size_max {
                    let e = Error::simple(ErrorKind::Communication);
                    tx.send(Message::Error(peer_id, e)).await.unwrap_or(());
                    return;
                }
                let mut payload = vec![0; header.length() as usize];
                if sock.read_exact(&mut payload[..]).await.is_err() {
                    let e = Error::simple(ErrorKind::Communication);
                    tx.send(Message::Error(peer_id, e)).await.unwrap_or(());
                    return;
                }
                if let Some(message) = decode(header, &payload[..]) {
                    tx.send(message).await.unwrap_or(());
                }
            }
        });
    }
}
