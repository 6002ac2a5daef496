//! A minimal client, talking the wire protocol of §6 directly over a
//! blocking `TcpStream` rather than through a `Node` (clients don't run
//! the replica-to-replica transport machinery, just one framed
//! request/response exchange per submission). Submits a single `Op::Set`
//! followed by a `Op::Get` against whichever replica address is passed
//! on the command line, and prints the decoded reply.
//!
//! Run alongside `bootstrap-local` or four `bootstrap-cop` processes.

#[path = "kv_service.rs"]
mod kv_service;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{SystemTime, UNIX_EPOCH};

use concordbft::bft::communication::message::{
    ClientBatchMessage, ClientQuery, Header, SystemMessage, WireMessage,
};
use concordbft::bft::communication::serialize::{deserialize_message, serialize_message};
use concordbft::bft::communication::NodeId;
use concordbft::bft::crypto::signature::{CryptoMethod, KeyPair, Signature};

use kv_service::Op;

const CLIENT_ID: u32 = 1000;

fn main() {
    let replica_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:10100".to_string());
    let replica_id = std::env::args()
        .nth(2)
        .map(|s| s.parse().expect("replica id must be a u32"))
        .unwrap_or(0u32);

    let me = NodeId::from(CLIENT_ID);
    let replica = NodeId::from(replica_id);
    let sk = KeyPair::generate(CryptoMethod::Ed25519).expect("client keypair");

    let mut sock = TcpStream::connect(&replica_addr).expect("connect to replica");
    handshake(&mut sock, me, replica);

    submit(&mut sock, &sk, me, replica, Op::Set("hello".into(), "world".into()));
    submit(&mut sock, &sk, me, replica, Op::Get("hello".into()));
}

/// The same one-way handshake a replica's `Node::tx_side_connect_task`
/// performs: an unsigned header carrying just this connection's
/// endpoints, so the replica's accept loop learns our id.
fn handshake(sock: &mut TcpStream, from: NodeId, to: NodeId) {
    let (header, _) = WireMessage::new(from, to, &[], Signature::zeroed()).into_inner();
    let mut buf = [0u8; Header::LENGTH];
    header.serialize_into(&mut buf[..]).unwrap();
    sock.write_all(&buf[..]).unwrap();
}

fn submit(sock: &mut TcpStream, sk: &KeyPair, from: NodeId, to: NodeId, op: Op) {
    let client_startts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64;
    let operation = bincode::serialize(&op).expect("serialize op");
    let query = ClientQuery {
        client_id: from,
        client_startts,
        operation,
    };
    let batch = ClientBatchMessage::new(from, vec![query]);
    let system = SystemMessage::ClientBatch(batch);

    let mut payload = Vec::new();
    serialize_message(&mut payload, &system).expect("serialize client batch");
    let sig = sk.sign_digital(&payload);

    let (header, _) = WireMessage::new(from, to, &payload, sig).into_inner();
    let mut buf = Vec::with_capacity(Header::LENGTH + payload.len());
    buf.resize(Header::LENGTH, 0);
    header.serialize_into(&mut buf[..]).unwrap();
    buf.extend_from_slice(&payload);
    sock.write_all(&buf[..]).unwrap();

    let mut header_buf = [0u8; Header::LENGTH];
    sock.read_exact(&mut header_buf[..]).expect("read response header");
    let resp_header = Header::deserialize_from(&header_buf[..]).expect("decode response header");
    let mut resp_payload = vec![0u8; resp_header.length() as usize];
    sock.read_exact(&mut resp_payload[..]).expect("read response body");
    let resp: SystemMessage<Vec<u8>> =
        deserialize_message(&resp_payload[..]).expect("decode response");
    match resp {
        SystemMessage::ClientResponse(m) => println!("got response for view {}: {:?}", m.view, m.entries),
        other => println!("unexpected reply: not a ClientResponse ({:?} variants elided)", std::mem::discriminant(&other)),
    }
}
