use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::mpsc::{
    self, Receiver,
    error::{TryRecvError, TrySendError},
};
use tokio_util::sync::PollSender;

/// A bounded, bi-directional channel built from a pair of Tokio [`mpsc`]
/// channels.
///
/// The two endpoints returned by [`channel`] face each other: whatever one
/// side sends, the other receives. Used to attach the control plane to a
/// peer component (e.g. the platform connectivity layer) with a single
/// handle per side.
pub struct Channel<S, R> {
    tx: PollSender<S>,
    rx: Receiver<R>,
}

/// Creates a connected pair of [`Channel`] endpoints.
///
/// `S` is what the first endpoint sends (and the second receives), `R` the
/// reverse. Each direction gets its own buffer.
pub fn channel<S, R>(tx_buffer: usize, rx_buffer: usize) -> (Channel<S, R>, Channel<R, S>)
where
    S: Send,
    R: Send,
{
    let (tx1, rx1) = mpsc::channel(tx_buffer);
    let (tx2, rx2) = mpsc::channel(rx_buffer);

    (Channel { tx: PollSender::new(tx1), rx: rx2 }, Channel { tx: PollSender::new(tx2), rx: rx1 })
}

impl<S: Send + 'static, R> Channel<S, R> {
    /// Attempts to immediately send a message to the peer endpoint.
    ///
    /// Fails with [`TrySendError::Full`] if the buffer is full, and with
    /// [`TrySendError::Closed`] if the peer has been dropped.
    pub fn try_send(&mut self, msg: S) -> Result<(), TrySendError<S>> {
        if let Some(tx) = self.tx.get_ref() {
            tx.try_send(msg)
        } else {
            Err(TrySendError::Closed(msg))
        }
    }

    /// Receives the next message from the peer endpoint, waiting if none is
    /// buffered. Returns `None` once the peer has been dropped and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<R> {
        self.rx.recv().await
    }

    /// Attempts to receive a buffered message without waiting.
    pub fn try_recv(&mut self) -> Result<R, TryRecvError> {
        self.rx.try_recv()
    }

    /// Polls for the next message from the peer endpoint.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<R>> {
        self.rx.poll_recv(cx)
    }

    /// Returns `true` if the peer endpoint has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<S, R> Stream for Channel<S, R> {
    type Item = R;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
