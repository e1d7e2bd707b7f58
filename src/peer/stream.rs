//! A WebRTC data channel presented as a reliable, ordered duplex byte
//! stream.
//!
//! libdatachannel delivers events through synchronous callbacks on its
//! own threads; [`DcHandler`] forwards them into tokio channels and
//! [`DcStream`] adapts the receiving end to `AsyncRead`/`AsyncWrite`.
//! Message boundaries are not preserved: a read may return part of one
//! message or the concatenation of several, like a stream socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use datachannel::{DataChannelHandler, RtcDataChannel};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

/// Bridges one data channel's callbacks into async-land.
pub(crate) struct DcHandler {
    /// Taken on close/error so the stream side sees EOF.
    msg_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    open_tx: Option<oneshot::Sender<()>>,
}

impl DcHandler {
    /// Returns the handler plus the receiving ends it feeds.
    pub(crate) fn new() -> (
        Self,
        mpsc::UnboundedReceiver<Vec<u8>>,
        oneshot::Receiver<()>,
    ) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = oneshot::channel();
        (
            DcHandler {
                msg_tx: Some(msg_tx),
                open_tx: Some(open_tx),
            },
            msg_rx,
            open_rx,
        )
    }
}

impl DataChannelHandler for DcHandler {
    fn on_open(&mut self) {
        if let Some(tx) = self.open_tx.take() {
            let _ = tx.send(());
        }
    }

    fn on_message(&mut self, msg: &[u8]) {
        if let Some(tx) = &self.msg_tx {
            let _ = tx.send(msg.to_vec());
        }
    }

    fn on_closed(&mut self) {
        self.msg_tx.take();
    }

    fn on_error(&mut self, err: &str) {
        tracing::warn!(error = err, "data channel error");
        self.msg_tx.take();
    }
}

/// A duplex byte stream over one labeled data channel.
pub struct DcStream {
    port: u16,
    label: String,
    /// Taken on shutdown; dropping the channel closes it.
    dc: Option<Box<RtcDataChannel<DcHandler>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Bytes of the current inbound message not yet handed to a reader.
    pending: Vec<u8>,
    pos: usize,
}

impl DcStream {
    pub(crate) fn new(
        port: u16,
        label: String,
        dc: Box<RtcDataChannel<DcHandler>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        DcStream {
            port,
            label,
            dc: Some(dc),
            rx,
            pending: Vec::new(),
            pos: 0,
        }
    }

    /// Destination port encoded in the channel label.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for DcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcStream")
            .field("label", &self.label)
            .field("open", &self.dc.is_some())
            .finish()
    }
}

impl AsyncRead for DcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.pos < self.pending.len() {
                let n = buf.remaining().min(self.pending.len() - self.pos);
                let start = self.pos;
                buf.put_slice(&self.pending[start..start + n]);
                self.pos += n;
                if self.pos == self.pending.len() {
                    self.pending.clear();
                    self.pos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(msg)) => {
                    self.pending = msg;
                    self.pos = 0;
                }
                // Channel closed by either endpoint: clean EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for DcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let dc = match self.dc.as_mut() {
            Some(dc) => dc,
            None => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "stream is shut down",
                )))
            }
        };
        match dc.send(buf) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                e.to_string(),
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Sends are handed straight to the SCTP layer.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Dropping the channel closes it; idempotent.
        self.dc.take();
        Poll::Ready(Ok(()))
    }
}
