//! Wire (de)serialization of [`SystemMessage`]s, per §6's frame layout.
//!
//! `SharedData` is the seam between the transport and the client's own
//! operation/reply types (the KV-store opcode set): anything the caller
//! of the consensus library wants carried as `O`/`R` must implement it.

use std::io::{Read, Write};

use crate::bft::communication::message::SystemMessage;
use crate::bft::error::*;

/// Bridges the generic transport layer to application-specific request
/// and reply types, the way `bft::executable::Service` bridges the
/// execution layer.
pub trait SharedData: Send + Sync {
    type State: Send + Clone;
    type Request: Send + Clone;
    type Reply: Send + Clone;

    fn serialize_state<W: Write>(w: W, state: &Self::State) -> Result<()>;
    fn deserialize_state<R: Read>(r: R) -> Result<Self::State>;
}

#[cfg(feature = "serialize_serde")]
pub fn serialize_message<O, W: Write>(mut w: W, message: &SystemMessage<O>) -> Result<()>
where
    O: serde::Serialize,
{
    let bytes = bincode::serialize(message).wrapped(ErrorKind::CommunicationSerialize)?;
    w.write_all(&bytes)
        .wrapped(ErrorKind::CommunicationSerialize)
}

#[cfg(feature = "serialize_serde")]
pub fn deserialize_message<O, R: Read>(r: R) -> Result<SystemMessage<O>>
where
    O: serde::de::DeserializeOwned,
{
    bincode::deserialize_from(r).wrapped(ErrorKind::CommunicationSerialize)
}
