//! A thin, backend-selectable bounded MPSC channel, used to wire together
//! the typed work queues of §5 (new-txn queue, worker queue, execution
//! queue, checkpoint queue) without tying the rest of the crate to one
//! channel implementation.

#[cfg(feature = "channel_futures_mpsc")]
mod futures_mpsc {
    use futures::channel::mpsc;
    use futures::SinkExt;

    pub struct ChannelTx<T>(mpsc::Sender<T>);
    pub struct ChannelRx<T>(mpsc::Receiver<T>);

    impl<T> Clone for ChannelTx<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone())
        }
    }

    pub fn new_bounded<T>(bound: usize) -> (ChannelTx<T>, ChannelRx<T>) {
        let (tx, rx) = mpsc::channel(bound);
        (ChannelTx(tx), ChannelRx(rx))
    }

    impl<T> ChannelTx<T> {
        pub async fn send(&mut self, message: T) -> super::Result<()> {
            use crate::bft::error::*;
            self.0
                .send(message)
                .await
                .wrapped(ErrorKind::CommunicationChannel)
        }

        /// Non-blocking send, for callers on a plain OS thread (the
        /// execution thread of `bft::executable`) that cannot `.await`
        /// without a runtime of their own.
        pub fn try_send(&mut self, message: T) -> super::Result<()> {
            use crate::bft::error::*;
            self.0
                .try_send(message)
                .wrapped(ErrorKind::CommunicationChannel)
        }
    }

    impl<T> ChannelRx<T> {
        pub async fn recv(&mut self) -> super::Result<T> {
            use crate::bft::error::*;
            use futures::StreamExt;
            self.0
                .next()
                .await
                .ok_or("Channel has disconnected")
                .wrapped(ErrorKind::CommunicationChannel)
        }
    }
}

#[cfg(feature = "channel_futures_mpsc")]
pub use futures_mpsc::{new_bounded, ChannelRx, ChannelTx};

#[cfg(feature = "channel_flume_mpmc")]
mod flume_mpmc {
    pub struct ChannelTx<T>(flume::Sender<T>);
    pub struct ChannelRx<T>(flume::Receiver<T>);

    impl<T> Clone for ChannelTx<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone())
        }
    }

    pub fn new_bounded<T>(bound: usize) -> (ChannelTx<T>, ChannelRx<T>) {
        let (tx, rx) = flume::bounded(bound);
        (ChannelTx(tx), ChannelRx(rx))
    }

    impl<T> ChannelTx<T> {
        pub async fn send(&mut self, message: T) -> super::Result<()> {
            use crate::bft::error::*;
            self.0
                .send_async(message)
                .await
                .wrapped(ErrorKind::CommunicationChannel)
        }

        /// Non-blocking send, for callers on a plain OS thread (the
        /// execution thread of `bft::executable`) that cannot `.await`
        /// without a runtime of their own.
        pub fn try_send(&mut self, message: T) -> super::Result<()> {
            use crate::bft::error::*;
            self.0
                .try_send(message)
                .wrapped(ErrorKind::CommunicationChannel)
        }
    }

    impl<T> ChannelRx<T> {
        pub async fn recv(&mut self) -> super::Result<T> {
            use crate::bft::error::*;
            self.0
                .recv_async()
                .await
                .wrapped(ErrorKind::CommunicationChannel)
        }
    }
}

#[cfg(feature = "channel_flume_mpmc")]
pub use flume_mpmc::{new_bounded, ChannelRx, ChannelTx};

pub(self) type Result<T> = super::super::error::Result<T>;
