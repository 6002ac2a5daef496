//! A toy key/value [`Service`] shared by the demo binaries in this
//! directory: `Op::Set`/`Op::Get` against an in-memory string map.
//! Just enough application logic to exercise the replicated core end to
//! end, in the spirit of the small counter/KV toy services that usually
//! accompany a bootstrap demo like this one.

use std::collections::HashMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use concordbft::bft::communication::serialize::SharedData;
use concordbft::bft::executable::Service;
use concordbft::bft::error::*;

#[derive(Clone, Serialize, Deserialize)]
pub enum Op {
    Set(String, String),
    Get(String),
}

#[derive(Clone, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    Value(Option<String>),
}

pub struct KvData;

impl SharedData for KvData {
    type State = HashMap<String, String>;
    type Request = Op;
    type Reply = Reply;

    fn serialize_state<W: Write>(mut w: W, state: &Self::State) -> Result<()> {
        let bytes = bincode::serialize(state).wrapped(ErrorKind::CommunicationSerialize)?;
        w.write_all(&bytes).wrapped(ErrorKind::CommunicationSerialize)
    }

    fn deserialize_state<R: Read>(r: R) -> Result<Self::State> {
        bincode::deserialize_from(r).wrapped(ErrorKind::CommunicationSerialize)
    }
}

#[derive(Default)]
pub struct KvService;

impl Service for KvService {
    type Data = KvData;

    fn initial_state(&mut self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    fn update(&mut self, state: &mut HashMap<String, String>, request: Op) -> Reply {
        match request {
            Op::Set(k, v) => {
                state.insert(k, v);
                Reply::Ack
            }
            Op::Get(k) => Reply::Value(state.get(&k).cloned()),
        }
    }
}

/// Decodes a request body out of the opaque bytes carried on the wire
/// (see `Replica::bootstrap`'s `decode_request` parameter).
pub fn decode_op(bytes: &[u8]) -> Op {
    bincode::deserialize(bytes).expect("well-formed Op on the wire")
}
