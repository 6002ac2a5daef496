//! A single replica process, configured from a TOML file on disk (§6).
//! Run four of these, one per `--config`, to stand up a real four-node
//! cluster across loopback or a LAN — the single-process variant in
//! `bootstrap-local.rs` is only for quick local experimentation.

#[path = "kv_service.rs"]
mod kv_service;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use concordbft::bft::async_runtime as rt;
use concordbft::bft::config::Cli;
use concordbft::bft::core::server::Replica;
use concordbft::bft::{init, InitConfig};

use kv_service::{decode_op, KvService};

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            cli.log_filter
                .clone()
                .map(EnvFilter::new)
                .unwrap_or_else(|| EnvFilter::new("info")),
        )
        .init();

    let cfg = cli.load_config().expect("failed to load replica config");

    let conf = InitConfig {
        async_threads: cfg.async_threads(),
    };
    let _guard = unsafe { init(conf).unwrap() };
    rt::block_on(async move {
        let id = cfg.id;
        let (replica, node) = Replica::bootstrap(cfg, KvService::default(), decode_op)
            .await
            .expect("replica bootstrap");
        tracing::info!(id, "bootstrapped; entering run loop");
        replica.run(node).await
    });
}
