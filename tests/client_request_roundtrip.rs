//! Drives one `Op::Set` through a live 4-replica classical cluster over
//! real loopback TCP, exactly the way `demos/client-local.rs` does, and
//! checks a signed `CL_RSP` comes back. Exercises the full request path
//! end to end: transport → new-txn queue → worker pool (digest) →
//! worker queue → batching → classical three-phase commit → execution →
//! client response — not just the bootstrap handshake already covered
//! by `bootstrap_cluster.rs`.

#[path = "../demos/kv_service.rs"]
mod kv_service;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use concordbft::bft::async_runtime as rt;
use concordbft::bft::communication::message::{
    ClientBatchMessage, ClientQuery, Header, SystemMessage, WireMessage,
};
use concordbft::bft::communication::serialize::{deserialize_message, serialize_message};
use concordbft::bft::communication::NodeId;
use concordbft::bft::config::{PeerEntry, ReplicaConfig};
use concordbft::bft::core::server::Replica;
use concordbft::bft::crypto::signature::{CryptoMethod, KeyPair, Signature};
use concordbft::bft::{init, InitConfig};

use kv_service::{decode_op, KvService, Op};

const N: u32 = 4;
const BASE_PORT: u16 = 10300;
const CLIENT_ID: u32 = 1000;

fn peers() -> Vec<PeerEntry> {
    (0..N)
        .map(|id| PeerEntry {
            id,
            addr: format!("127.0.0.1:{}", BASE_PORT + id as u16).parse().unwrap(),
        })
        .collect()
}

#[test]
fn a_client_set_commits_and_gets_a_signed_response() {
    let conf = InitConfig { async_threads: 4 };
    let _guard = unsafe { init(conf).unwrap() };

    rt::block_on(async move {
        for id in 0..N {
            let cfg = ReplicaConfig {
                id,
                f: 1,
                peers: peers(),
                client_node_cnt: 1,
                ordering_protocol: "classical".to_string(),
                crypto_method: "ed25519".to_string(),
                max_batch_size: 1,
                batch_timeout_ms: 50,
                client_exe_timeout_ns: 0,
                view_change_timeout_ms: 5_000,
                view_changes: true,
                txn_per_checkpoint: 64,
                worker_threads: 2,
                rem_thread_cnt: 1,
                send_thread_cnt: 1,
                max_txn_in_flight: 1_000,
                done_timer_ms: 0,
                warmup_timer_ms: 0,
                tport_type: "TCP".to_string(),
                tport_port: BASE_PORT,
                msg_size_max: 16 * 1024 * 1024,
                fairness_threshold: None,
            };
            let (replica, node) = Replica::bootstrap(cfg, KvService::default(), decode_op)
                .await
                .expect("replica bootstrap");
            rt::spawn(async move {
                replica.run(node).await;
            });
        }

        // let the cluster finish its bootstrap key exchange before a
        // client shows up, mirroring bootstrap_cluster.rs's own wait
        tokio::time::sleep(Duration::from_millis(500)).await;

        let me = NodeId::from(CLIENT_ID);
        let primary = NodeId::from(0u32);
        let addr = format!("127.0.0.1:{}", BASE_PORT);
        let sk = KeyPair::generate(CryptoMethod::Ed25519).expect("client keypair");

        let mut sock = TcpStream::connect(&addr).await.expect("connect to primary");
        handshake(&mut sock, me, primary).await;

        let reply = timeout(
            Duration::from_secs(5),
            submit(&mut sock, &sk, me, primary, Op::Set("hello".into(), "world".into())),
        )
        .await
        .expect("reply arrived before the deadline");

        match reply {
            SystemMessage::ClientResponse(m) => {
                assert_eq!(m.entries.len(), 1);
            }
            _ => panic!("expected a ClientResponse"),
        }
    });
}

async fn handshake(sock: &mut TcpStream, from: NodeId, to: NodeId) {
    let (header, _) = WireMessage::new(from, to, &[], Signature::zeroed()).into_inner();
    let mut buf = [0u8; Header::LENGTH];
    header.serialize_into(&mut buf[..]).unwrap();
    sock.write_all(&buf[..]).await.unwrap();
}

async fn submit(
    sock: &mut TcpStream,
    sk: &KeyPair,
    from: NodeId,
    to: NodeId,
    op: Op,
) -> SystemMessage<Vec<u8>> {
    let operation = bincode::serialize(&op).expect("serialize op");
    let query = ClientQuery {
        client_id: from,
        client_startts: 0,
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
    sock.write_all(&buf[..]).await.unwrap();

    let mut header_buf = [0u8; Header::LENGTH];
    sock.read_exact(&mut header_buf[..]).await.expect("read response header");
    let resp_header = Header::deserialize_from(&header_buf[..]).expect("decode response header");
    let mut resp_payload = vec![0u8; resp_header.length() as usize];
    sock.read_exact(&mut resp_payload[..]).await.expect("read response body");
    deserialize_message(&resp_payload[..]).expect("decode response")
}
