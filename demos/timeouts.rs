//! Standalone demonstration of the `Timeouts` plumbing (§4.7, §4.8),
//! independent of a running replica: schedules a handful of delayed
//! timeouts and drains them off the channel as they fire.

use std::time::Duration;

use concordbft::bft::async_runtime as rt;
use concordbft::bft::communication::channel::new_bounded;
use concordbft::bft::communication::message::Message;
use concordbft::bft::ordering::SeqNo;
use concordbft::bft::timeouts::{TimeoutKind, Timeouts};
use concordbft::bft::{init, InitConfig};

fn main() {
    let conf = InitConfig {
        async_threads: num_cpus::get(),
    };
    let _guard = unsafe { init(conf).unwrap() };
    rt::block_on(async_main());
}

async fn async_main() {
    let (tx, mut rx) = new_bounded::<Message<Vec<u8>>>(8);
    let timeouts = Timeouts::new(tx);

    for i in 1..=5u32 {
        println!("Scheduled a timeout of {} seconds", i);
        let dur = Duration::from_secs(i as u64);
        timeouts.timeout(dur, TimeoutKind::Cst(SeqNo::from(i)));
    }

    for _ in 0..5 {
        if let Ok(Message::Timeout(kind)) = rx.recv().await {
            println!("Received timeout: {:?}", kind);
        }
    }
}
