//! This module contains types associated with messages traded between the
//! system processes, per §4.2 ("Message envelope and codec") and §6
//! ("Peer wire format" / "Client protocol").

use std::mem::MaybeUninit;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::communication::socket::Socket;
use crate::bft::communication::NodeId;
use crate::bft::consensus::chained::{ProposalMessage, VoteMessage};
use crate::bft::consensus::classical::{CommitMessage, PrePrepareMessage, PrepareMessage};
use crate::bft::consensus::dag::{BlockMessage, CertMessage};
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::{CryptoMethod, PublicKey, Signature};
use crate::bft::error::*;
use crate::bft::log::CheckpointMessage;
use crate::bft::sync::{NewViewMessage, ViewChangeMessage};

/// A header that is sent before a message in transit in the wire.
///
/// A fixed amount of `Header::LENGTH` bytes are read before a message is
/// read. Per §6, the frame itself is `u32 dst, u32 src, u32 count,
/// {message}*`; this `Header` corresponds to one `{message}`'s fixed-size
/// prefix (everything up to, and including, the signature), with the
/// variable-length body following it on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct Header {
    version: u32,
    from: u32,
    to: u32,
    length: u64,
    signature: [u8; Signature::LENGTH],
}

impl Header {
    pub const LENGTH: usize = std::mem::size_of::<Self>();

    unsafe fn serialize_into_unchecked(self, buf: &mut [u8]) {
        let hdr: [u8; Self::LENGTH] = std::mem::transmute(self);
        buf[..Self::LENGTH].copy_from_slice(&hdr[..]);
    }

    pub fn serialize_into(self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to serialize into")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(unsafe { self.serialize_into_unchecked(buf) })
    }

    unsafe fn deserialize_from_unchecked(buf: &[u8]) -> Self {
        let mut hdr: [u8; Self::LENGTH] = MaybeUninit::uninit().assume_init();
        hdr.copy_from_slice(&buf[..Self::LENGTH]);
        std::mem::transmute(hdr)
    }

    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to deserialize from")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(unsafe { Self::deserialize_from_unchecked(buf) })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn from(&self) -> NodeId {
        NodeId::from(self.from)
    }

    pub fn to(&self) -> NodeId {
        NodeId::from(self.to)
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn signature(&self) -> &Signature {
        // SAFETY: `Signature` is `repr(transparent)`-compatible with its
        // inner byte array
        unsafe { std::mem::transmute(&self.signature) }
    }
}

/// A message to be sent over the wire. The payload should be a serialized
/// `SystemMessage`, for correctness.
#[derive(Debug)]
pub struct WireMessage<'a> {
    header: Header,
    payload: &'a [u8],
}

impl<'a> WireMessage<'a> {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(from: NodeId, to: NodeId, payload: &'a [u8], sig: Signature) -> Self {
        let signature = unsafe { std::mem::transmute(sig) };
        let (from, to): (u32, u32) = (from.into(), to.into());
        let header = Header {
            version: Self::CURRENT_VERSION,
            length: payload.len() as u64,
            signature,
            from,
            to,
        };
        Self { header, payload }
    }

    pub fn into_inner(self) -> (Header, &'a [u8]) {
        (self.header, self.payload)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn from_parts(header: Header, payload: &'a [u8]) -> Result<Self> {
        if header.version != Self::CURRENT_VERSION {
            return Err("Mismatched wire protocol version")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(Self { header, payload })
    }

    pub fn is_valid(&self) -> bool {
        self.header.version == Self::CURRENT_VERSION
    }
}

/// The `Message` type encompasses all the messages traded between
/// different threads/tasks in the system: system messages proper, plus
/// connection and control events local to this replica.
pub enum Message<O> {
    /// A validated system message, along with the header it arrived with.
    System(Header, SystemMessage<O>),
    /// A peer `NodeId` has finished connecting over the write-only `Socket`.
    ConnectedTx(NodeId, Socket),
    /// A peer `NodeId` has finished connecting over the read-only `Socket`.
    ConnectedRx(NodeId, Socket),
    /// A timer set by `bft::timeouts` has elapsed.
    Timeout(crate::bft::timeouts::TimeoutKind),
    /// Errors reported by asynchronous tasks (transport failures, §7 (d)).
    Error(NodeId, Error),
}

/// Per-message latency accounting fields (§6), opaque to the consensus
/// layer; populated by the statistics collaborator described in §6 and
/// otherwise passed through unchanged.
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct LatencyFields(pub [u64; 7]);

/// A `SystemMessage` corresponds to a message regarding one of the SMR
/// sub-protocols, or the client protocol. The `O` type argument is the
/// client operation type (a KV-store opcode, per §6).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum SystemMessage<O> {
    ClientBatch(ClientBatchMessage<O>),
    ClientResponse(ClientResponseMessage),
    PrePrepare(PrePrepareMessage),
    Prepare(PrepareMessage),
    Commit(CommitMessage),
    Proposal(ProposalMessage),
    Vote(VoteMessage),
    Block(BlockMessage),
    Cert(CertMessage),
    ViewChange(ViewChangeMessage),
    NewView(NewViewMessage),
    Checkpoint(CheckpointMessage),
    KeyExchange(KeyExchangeMessage),
    Ready,
}

/// One client request within a `CL_BATCH`, per §6's `ClientQuery`.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ClientQuery<O> {
    pub client_id: NodeId,
    pub client_startts: u64,
    pub operation: O,
}

/// `CL_BATCH{return_node, batch_size, [ClientQuery]*}` (§6).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ClientBatchMessage<O> {
    pub return_node: NodeId,
    pub queries: Vec<ClientQuery<O>>,
}

impl<O> ClientBatchMessage<O> {
    pub fn new(return_node: NodeId, queries: Vec<ClientQuery<O>>) -> Self {
        Self { return_node, queries }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// `CL_RSP{view, [(txn_id, client_startts)]*}` (§6), signed.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ClientResponseMessage {
    pub view: u32,
    pub entries: Vec<(u64, u64)>,
}

/// The bootstrap key-exchange message of §4.3.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct KeyExchangeMessage {
    pub method: CryptoMethod,
    pub public_key: PublicKey,
    /// Authenticator mode only: the pairwise secret proposed to the
    /// destination this copy of the message is addressed to (the message
    /// is unicast, not broadcast, when this is populated — see
    /// `bft::crypto::signature::KeyPair`'s doc comment).
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes_opt"))]
    pub pairwise_secret: Option<[u8; 32]>,
}

#[cfg(feature = "serialize_serde")]
mod serde_bytes_opt {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&bytes[..]),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        let opt: Option<Vec<u8>> = serde::Deserialize::deserialize(d)?;
        Ok(opt.map(|v| {
            let mut out = [0u8; 32];
            out.copy_from_slice(&v);
            out
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{Header, WireMessage};
    use crate::bft::communication::NodeId;
    use crate::bft::crypto::signature::Signature;

    #[test]
    fn test_header_serialize() {
        let signature = Signature::from_bytes(&[0; Signature::LENGTH][..])
            .expect("Invalid signature length");
        let (old_header, _) = WireMessage::new(
            NodeId::from(0),
            NodeId::from(3),
            b"I am a cool payload!",
            signature,
        )
        .into_inner();
        let mut buf = [0; Header::LENGTH];
        old_header
            .serialize_into(&mut buf[..])
            .expect("Serialize failed");
        let new_header = Header::deserialize_from(&buf[..]).expect("Deserialize failed");
        assert_eq!(old_header, new_header);
    }
}
