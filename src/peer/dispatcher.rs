//! Routes inbound streams to per-port listeners on the accepting side.
//!
//! Each listener owns a bounded queue; the accept loop enqueues without
//! blocking so one slow listener cannot stall the connection. A stream
//! for a port with no listener, or for a listener whose queue is full,
//! is closed immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{Conn, DcStream};
use crate::error::{Error, Result};

/// Streams queued per listener before overflow closes new ones.
pub const LISTENER_BACKLOG: usize = 16;

/// Port-indexed demultiplexer for one peer connection's inbound
/// streams. Cloning shares the listener table.
pub struct Dispatcher<S = DcStream> {
    listeners: Arc<Mutex<HashMap<u16, mpsc::Sender<S>>>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Dispatcher {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Dispatcher<S> {
    pub fn new() -> Self {
        Dispatcher {
            listeners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bind a listener for `port`.
    ///
    /// A port can carry at most one listener at a time; a second bind
    /// fails with [`Error::PortBusy`] until the first is closed.
    pub fn listen(&self, port: u16) -> Result<Listener<S>> {
        let mut map = self.listeners.lock().unwrap();
        if map.contains_key(&port) {
            return Err(Error::PortBusy(port));
        }
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        map.insert(port, tx.clone());
        Ok(Listener {
            port,
            tx,
            rx,
            listeners: Arc::clone(&self.listeners),
        })
    }

    /// Hand `stream` to the listener for `port`.
    ///
    /// Returns the stream back when no listener accepts it so the
    /// caller can close it.
    pub fn dispatch(&self, port: u16, stream: S) -> Result<(), S> {
        let map = self.listeners.lock().unwrap();
        match map.get(&port) {
            Some(tx) => match tx.try_send(stream) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(stream)) | Err(TrySendError::Closed(stream)) => {
                    Err(stream)
                }
            },
            None => Err(stream),
        }
    }
}

impl Dispatcher<DcStream> {
    /// Build a dispatcher fed by `conn`'s accept loop.
    ///
    /// The loop runs until the connection closes; unrouteable streams
    /// are dropped with a warning, transient accept errors pause one
    /// second and continue.
    pub fn spawn(conn: Arc<Conn>) -> Self {
        let dispatcher = Dispatcher::new();
        let inner = dispatcher.clone();
        tokio::spawn(async move {
            loop {
                match conn.accept().await {
                    Ok((stream, port)) => {
                        if inner.dispatch(port, stream).is_err() {
                            tracing::warn!(
                                port,
                                "closing stream: {}",
                                Error::NoRouteForPort(port)
                            );
                        }
                    }
                    Err(Error::Cancelled) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        dispatcher
    }
}

/// A bound port's stream queue.
///
/// Dropping (or closing) the listener unbinds the port but does not
/// touch streams already handed out.
pub struct Listener<S = DcStream> {
    port: u16,
    tx: mpsc::Sender<S>,
    rx: mpsc::Receiver<S>,
    listeners: Arc<Mutex<HashMap<u16, mpsc::Sender<S>>>>,
}

impl<S> Listener<S> {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next inbound stream.
    pub async fn accept(&mut self) -> Result<S> {
        self.rx.recv().await.ok_or(Error::Cancelled)
    }
}

impl<S> Drop for Listener<S> {
    fn drop(&mut self) {
        let mut map = self.listeners.lock().unwrap();
        // Only unbind our own registration, in case the port was
        // rebound after an earlier close.
        if map
            .get(&self.port)
            .is_some_and(|tx| tx.same_channel(&self.tx))
        {
            map.remove(&self.port);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct FakeStream(u32);

    #[test]
    fn test_double_listen_rejected() {
        let dispatcher: Dispatcher<FakeStream> = Dispatcher::new();
        let _listener = dispatcher.listen(80).unwrap();
        assert!(matches!(dispatcher.listen(80), Err(Error::PortBusy(80))));
    }

    #[test]
    fn test_close_unbinds_port() {
        let dispatcher: Dispatcher<FakeStream> = Dispatcher::new();
        let listener = dispatcher.listen(80).unwrap();
        drop(listener);
        assert!(dispatcher.listen(80).is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_reaches_listener() {
        let dispatcher: Dispatcher<FakeStream> = Dispatcher::new();
        let mut listener = dispatcher.listen(443).unwrap();

        dispatcher.dispatch(443, FakeStream(7)).unwrap();
        assert_eq!(listener.accept().await.unwrap(), FakeStream(7));
    }

    #[test]
    fn test_unknown_port_returns_stream() {
        let dispatcher: Dispatcher<FakeStream> = Dispatcher::new();
        let rejected = dispatcher.dispatch(9999, FakeStream(1)).unwrap_err();
        assert_eq!(rejected, FakeStream(1));
    }

    #[test]
    fn test_overflow_closes_extra_stream() {
        let dispatcher: Dispatcher<FakeStream> = Dispatcher::new();
        let _listener = dispatcher.listen(80).unwrap();

        for i in 0..LISTENER_BACKLOG as u32 {
            dispatcher.dispatch(80, FakeStream(i)).unwrap();
        }
        // The (capacity + 1)th stream comes straight back.
        let rejected = dispatcher
            .dispatch(80, FakeStream(LISTENER_BACKLOG as u32))
            .unwrap_err();
        assert_eq!(rejected, FakeStream(LISTENER_BACKLOG as u32));
    }

    #[tokio::test]
    async fn test_queued_streams_survive_close() {
        let dispatcher: Dispatcher<FakeStream> = Dispatcher::new();
        let mut listener = dispatcher.listen(80).unwrap();
        dispatcher.dispatch(80, FakeStream(1)).unwrap();

        // Port unbinds but the queued stream is still deliverable.
        {
            let map = listener.listeners.lock().unwrap();
            assert!(map.contains_key(&80));
        }
        assert_eq!(listener.accept().await.unwrap(), FakeStream(1));
        drop(listener);

        let dispatcher2: Dispatcher<FakeStream> = dispatcher.clone();
        assert!(dispatcher2.listen(80).is_ok());
    }
}
