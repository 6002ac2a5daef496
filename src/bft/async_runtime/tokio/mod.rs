//! `tokio`-backed async runtime, used by the I/O and output threads of
//! §2 and §5 to drive per-peer socket traffic without dedicating an OS
//! thread to every connection.

use std::future::Future;
use std::sync::OnceLock;

pub type JoinHandle<T> = ::tokio::task::JoinHandle<T>;
pub type Runtime = ::tokio::runtime::Runtime;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

pub fn init(num_threads: usize) -> Result<(), ()> {
    let rt = ::tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_threads)
        .thread_name("concordbft-io")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()
        .map_err(|_| ())?;
    // only the first caller wins; concurrent double-init is a programmer
    // error guarded against by `INITIALIZED` in `bft::init`
    let _ = RUNTIME.set(rt);
    Ok(())
}

pub fn drop() -> Result<(), ()> {
    // the runtime is torn down when the process exits; there is no
    // portable way to drop a `OnceLock` early, and nothing in this crate
    // needs to re-init a runtime within the same process
    Ok(())
}

fn runtime() -> &'static Runtime {
    RUNTIME.get().expect("async runtime not initialized; call bft::init() first")
}

pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    runtime().spawn(future)
}

pub fn block_on<F: Future>(future: F) -> F::Output {
    runtime().block_on(future)
}
