//! An end-to-end scenario from §8: four replicas bootstrap over real
//! loopback TCP sockets, exchange identity keys (§4.3), and every
//! correct replica ends up with a verification key for each of its
//! `n - 1` peers. Exercises the full `Replica::bootstrap`/`run` wiring,
//! not just the unit-level `KeyExchange` logic already covered in
//! `communication::keyexchange::tests`.

#[path = "../demos/kv_service.rs"]
mod kv_service;

use std::time::Duration;

use concordbft::bft::async_runtime as rt;
use concordbft::bft::config::{PeerEntry, ReplicaConfig};
use concordbft::bft::core::server::Replica;
use concordbft::bft::{init, InitConfig};

use kv_service::{decode_op, KvService};

const N: u32 = 4;
const BASE_PORT: u16 = 10200;

fn peers() -> Vec<PeerEntry> {
    (0..N)
        .map(|id| PeerEntry {
            id,
            addr: format!("127.0.0.1:{}", BASE_PORT + id as u16).parse().unwrap(),
        })
        .collect()
}

#[test]
fn four_replicas_complete_bootstrap_key_exchange() {
    let conf = InitConfig { async_threads: 4 };
    let _guard = unsafe { init(conf).unwrap() };

    rt::block_on(async move {
        let mut contexts = Vec::new();
        for id in 0..N {
            let cfg = ReplicaConfig {
                id,
                f: 1,
                peers: peers(),
                client_node_cnt: 1,
                ordering_protocol: "classical".to_string(),
                crypto_method: "ed25519".to_string(),
                max_batch_size: 32,
                batch_timeout_ms: 100,
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
            contexts.push(replica.context().clone());
            rt::spawn(async move {
                replica.run(node).await;
            });
        }

        // give the cluster a moment to exchange bootstrap announcements
        // over loopback before checking convergence
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let all_bootstrapped = contexts
                .iter()
                .all(|ctx| ctx.peer_keys().len() == (N as usize - 1));
            if all_bootstrapped {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "cluster did not finish key exchange within the deadline"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for ctx in &contexts {
            assert_eq!(ctx.peer_keys().len(), N as usize - 1);
        }
    });
}
