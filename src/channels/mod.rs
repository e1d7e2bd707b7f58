//! Signal channels: named-mailbox pub/sub used for rendezvous.
//!
//! A signal channel pairs one `send` with one `recv` per opaque string
//! address. Implementations may block arbitrarily long; callers bound
//! the wait with `tokio::time::timeout` or by dropping the future.
//!
//! Channels are built through an explicit [`ChannelRegistry`] keyed by
//! URL scheme; there is no process-global factory state. The registry
//! owns the in-memory hub, so every `memory://` channel built from the
//! same registry shares mailboxes (which is what lets two in-process
//! peers rendezvous in tests).

pub mod apprtc;
pub mod operator;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::{Error, Result};

pub use apprtc::AppRtcChannel;
pub use operator::OperatorChannel;

/// A named-mailbox pub/sub used to exchange signaling messages.
///
/// A value passed to `send` stays available until exactly one `recv`
/// on the same address consumes it. Implementations must be safe under
/// concurrent use from many address pairs.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    async fn send(&self, addr: &str, data: &str) -> Result<()>;
    async fn recv(&self, addr: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type ChannelFactory = Box<dyn Fn(&str) -> Result<Arc<dyn SignalChannel>> + Send + Sync>;

/// Maps URL schemes to channel factories.
pub struct ChannelRegistry {
    factories: HashMap<String, ChannelFactory>,
}

impl ChannelRegistry {
    /// Build a registry with the built-in schemes registered:
    /// `memory://`, `operator://`, and `apprtc://`.
    pub fn new() -> Self {
        let mut registry = ChannelRegistry {
            factories: HashMap::new(),
        };

        let hub = Arc::new(MemoryHub::new());
        registry.register("memory", move |url| {
            let prefix = url.trim_start_matches("memory://");
            Ok(Arc::new(MemoryChannel::new(prefix, Arc::clone(&hub))))
        });
        registry.register("operator", |url| {
            let base = url.replacen("operator://", "https://", 1);
            Ok(Arc::new(OperatorChannel::new(base)?))
        });
        registry.register("apprtc", |_url| Ok(Arc::new(AppRtcChannel::new())));

        registry
    }

    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn SignalChannel>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.to_string(), Box::new(factory));
    }

    /// Build a channel for `url`, dispatching on its scheme.
    pub fn get(&self, url: &str) -> Result<Arc<dyn SignalChannel>> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| Error::Config(format!("invalid signal channel url: {url}")))?;
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| Error::Config(format!("no signal channel registered for {scheme}")))?;
        factory(url)
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// In-memory channel
// ---------------------------------------------------------------------------

/// One mailbox: a capacity-1 rendezvous queue.
#[derive(Clone)]
struct Mailbox {
    tx: mpsc::Sender<String>,
    rx: Arc<AsyncMutex<mpsc::Receiver<String>>>,
}

/// Process-local mailbox store shared by all `memory://` channels of
/// one registry.
pub struct MemoryHub {
    mailboxes: Mutex<HashMap<String, Mailbox>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        MemoryHub {
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    fn mailbox(&self, key: &str) -> Mailbox {
        let mut map = self.mailboxes.lock().unwrap();
        map.entry(key.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(1);
                Mailbox {
                    tx,
                    rx: Arc::new(AsyncMutex::new(rx)),
                }
            })
            .clone()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process signal channel, used by tests and intra-process peers.
pub struct MemoryChannel {
    prefix: String,
    hub: Arc<MemoryHub>,
}

impl MemoryChannel {
    pub fn new(prefix: impl Into<String>, hub: Arc<MemoryHub>) -> Self {
        MemoryChannel {
            prefix: prefix.into(),
            hub,
        }
    }
}

#[async_trait]
impl SignalChannel for MemoryChannel {
    async fn send(&self, addr: &str, data: &str) -> Result<()> {
        tracing::debug!(addr, "memory channel send");
        let mailbox = self.hub.mailbox(&format!("{}{}", self.prefix, addr));
        mailbox
            .tx
            .send(data.to_string())
            .await
            .map_err(|_| Error::Cancelled)
    }

    async fn recv(&self, addr: &str) -> Result<String> {
        tracing::debug!(addr, "memory channel recv");
        let mailbox = self.hub.mailbox(&format!("{}{}", self.prefix, addr));
        let mut rx = mailbox.rx.lock().await;
        rx.recv().await.ok_or(Error::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn memory_pair() -> (Arc<dyn SignalChannel>, Arc<dyn SignalChannel>) {
        let registry = ChannelRegistry::new();
        let a = registry.get("memory://test").unwrap();
        let b = registry.get("memory://test").unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_concurrent_send_recv_pair() {
        let (a, b) = memory_pair();

        let recv = tokio::spawn(async move { b.recv("addr").await.unwrap() });
        a.send("addr", "x").await.unwrap();
        assert_eq!(recv.await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_two_sends_two_recvs_no_loss() {
        let (a, b) = memory_pair();

        let sender = tokio::spawn(async move {
            a.send("addr", "first").await.unwrap();
            a.send("addr", "second").await.unwrap();
        });

        let one = timeout(Duration::from_secs(5), b.recv("addr"))
            .await
            .unwrap()
            .unwrap();
        let two = timeout(Duration::from_secs(5), b.recv("addr"))
            .await
            .unwrap()
            .unwrap();
        sender.await.unwrap();

        let mut got = vec![one, two];
        got.sort();
        assert_eq!(got, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_addresses_are_isolated() {
        let (a, b) = memory_pair();

        a.send("one", "for-one").await.unwrap();
        // A recv on a different address must not observe it.
        assert!(timeout(Duration::from_millis(100), b.recv("two"))
            .await
            .is_err());
        assert_eq!(b.recv("one").await.unwrap(), "for-one");
    }

    #[tokio::test]
    async fn test_registries_do_not_share_mailboxes() {
        let r1 = ChannelRegistry::new();
        let r2 = ChannelRegistry::new();
        let a = r1.get("memory://test").unwrap();
        let b = r2.get("memory://test").unwrap();

        a.send("addr", "x").await.unwrap();
        assert!(timeout(Duration::from_millis(100), b.recv("addr"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_prefix_separates_channels() {
        let registry = ChannelRegistry::new();
        let a = registry.get("memory://one").unwrap();
        let b = registry.get("memory://two").unwrap();

        a.send("addr", "x").await.unwrap();
        assert!(timeout(Duration::from_millis(100), b.recv("addr"))
            .await
            .is_err());
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let registry = ChannelRegistry::new();
        assert!(matches!(
            registry.get("carrier-pigeon://loft"),
            Err(Error::Config(_))
        ));
        assert!(matches!(registry.get("not a url"), Err(Error::Config(_))));
    }
}
