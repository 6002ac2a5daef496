//! The replica's non-transport machinery (§4, §5): the pooled request
//! table, the typed work queues between the transport, worker pool and
//! executor, the batch assembler, and the main server loop that ties it
//! all together.

pub mod batching;
pub mod server;
pub mod txn_table;
pub mod workqueue;
