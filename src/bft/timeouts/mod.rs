//! Timer plumbing (§4.7, §7): batch-assembly timeouts, view-change
//! timeouts and CST request timeouts all funnel through the same
//! fire-and-forget `Timeouts` handle, which schedules a delayed message
//! back onto the replica's own channel rather than blocking any worker.

use std::time::Duration;

use futures_timer::Delay;

use crate::bft::async_runtime as rt;
use crate::bft::communication::channel::ChannelTx;
use crate::bft::communication::message::Message;
use crate::bft::ordering::{SeqNo, View};

/// Identifies what a fired timeout is about, so the core server loop
/// can decide what corrective action (if any) to take.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimeoutKind {
    /// The batching timer for an in-progress batch elapsed (§4.4):
    /// propose whatever has accumulated so far, even if under the
    /// configured max batch size.
    Batch(SeqNo),
    /// No progress was observed before the view-change timer elapsed
    /// (§4.7): broadcast `VIEW_CHANGE` for the next view.
    ViewChange(View),
    /// A collaborative-state-transfer request timed out (§4.8): retry
    /// against a different peer.
    Cst(SeqNo),
    /// The bootstrap key-exchange of §4.3 has not yet collected every
    /// peer's key: re-announce.
    KeyExchange,
}

/// A handle used to schedule timeouts; cheaply cloneable, since every
/// scheduled timeout just spawns an independent delayed send.
pub struct Timeouts<O> {
    ch: ChannelTx<Message<O>>,
}

impl<O> Clone for Timeouts<O> {
    fn clone(&self) -> Self {
        Self { ch: self.ch.clone() }
    }
}

impl<O: Send + 'static> Timeouts<O> {
    pub fn new(ch: ChannelTx<Message<O>>) -> Self {
        Self { ch }
    }

    /// Schedules `kind` to be delivered as a [`Message::Timeout`] after
    /// `duration` elapses. Firing is best-effort: if the receiving end
    /// has since shut down, the send is silently dropped.
    pub fn timeout(&self, duration: Duration, kind: TimeoutKind) {
        let mut ch = self.ch.clone();
        rt::spawn(async move {
            Delay::new(duration).await;
            ch.send(Message::Timeout(kind)).await.unwrap_or(());
        });
    }
}
