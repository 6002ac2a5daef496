//! Spins up a 4-replica, `f = 1` cluster entirely in one process, all on
//! loopback, running the classical ordering protocol over the toy KV
//! service in `kv_service.rs`. The point here is exercising
//! `Replica::bootstrap`/`Replica::run` end to end, not the wire format
//! itself (see `client-local.rs` for that).

#[path = "kv_service.rs"]
mod kv_service;

use std::time::Duration;

use futures_timer::Delay;

use concordbft::bft::async_runtime as rt;
use concordbft::bft::config::{PeerEntry, ReplicaConfig};
use concordbft::bft::core::server::Replica;
use concordbft::bft::{init, InitConfig};

use kv_service::{decode_op, KvService};

const N: u32 = 4;
const BASE_PORT: u16 = 10100;

fn main() {
    let conf = InitConfig {
        async_threads: num_cpus::get(),
    };
    let _guard = unsafe { init(conf).unwrap() };
    rt::block_on(async_main());
}

fn peers() -> Vec<PeerEntry> {
    (0..N)
        .map(|id| PeerEntry {
            id,
            addr: format!("127.0.0.1:{}", BASE_PORT + id as u16).parse().unwrap(),
        })
        .collect()
}

async fn async_main() {
    let mut handles = Vec::new();
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
        let handle = rt::spawn(async move {
            let (replica, node) = Replica::bootstrap(cfg, KvService::default(), decode_op)
                .await
                .expect("replica bootstrap");
            println!("Bootstrapped replica #{}", id);
            replica.run(node).await
        });
        handles.push(handle);
    }

    // let the cluster exchange keys and settle into a view before exiting
    Delay::new(Duration::from_secs(5)).await;
    println!("Cluster ran for 5 seconds with {} replicas; shutting down.", N);
}
