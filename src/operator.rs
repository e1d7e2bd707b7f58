//! The operator: a long-polling HTTP broker that pairs one publisher
//! with one subscriber per mailbox address.
//!
//! All pairing state lives inside a single event-loop task; the HTTP
//! handlers talk to it over a command channel, so handoff is serialized
//! and race-free without locks. A publisher or subscriber that finds no
//! counterpart registers as a waiter; the handler holds the request
//! open for one poll window and then answers 504, telling the client to
//! retry. Expired waiters are garbage collected with an explicit cancel
//! command.
//!
//! HTTP surface:
//! - `POST /pub` form fields `address`, `data` → 200 paired, 504 window
//!   expired, 400 data over 10 KiB
//! - `GET /sub?address=` → 200 + `text/plain` data, 504 window expired

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Largest accepted `data` form field.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024;

/// How long a pub or sub is held open before answering 504.
pub const DEFAULT_POLL_WINDOW: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

enum Command {
    Pub {
        addr: String,
        data: String,
        id: u64,
        done: oneshot::Sender<()>,
    },
    Sub {
        addr: String,
        id: u64,
        reply: oneshot::Sender<String>,
    },
    CancelPub {
        addr: String,
        id: u64,
    },
    CancelSub {
        addr: String,
        id: u64,
    },
}

struct PendingPub {
    id: u64,
    data: String,
    done: oneshot::Sender<()>,
}

struct PendingSub {
    id: u64,
    reply: oneshot::Sender<String>,
}

/// Handle to the broker event loop. Cloning shares the same loop;
/// dropping the last handle shuts it down and cancels all waiters.
#[derive(Clone)]
pub struct Broker {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    window: Duration,
}

impl Broker {
    pub fn new() -> Self {
        Self::with_poll_window(DEFAULT_POLL_WINDOW)
    }

    /// A broker with a custom poll window. Short windows are used by
    /// tests to observe 504 behavior without waiting 30 seconds.
    pub fn with_poll_window(window: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_event_loop(cmd_rx));
        Broker {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(0)),
            window,
        }
    }

    /// Hand `data` to exactly one subscriber of `addr`.
    ///
    /// Blocks until a subscriber consumes it or the poll window
    /// expires with [`Error::Timeout`].
    pub async fn publish(&self, addr: &str, data: String) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Pub {
                addr: addr.to_string(),
                data,
                id,
                done: done_tx,
            })
            .map_err(|_| Error::Cancelled)?;

        match timeout(self.window, done_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                let _ = self.cmd_tx.send(Command::CancelPub {
                    addr: addr.to_string(),
                    id,
                });
                Err(Error::Timeout)
            }
        }
    }

    /// Take one pending datum published to `addr`.
    pub async fn subscribe(&self, addr: &str) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Sub {
                addr: addr.to_string(),
                id,
                reply: reply_tx,
            })
            .map_err(|_| Error::Cancelled)?;

        match timeout(self.window, reply_rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                let _ = self.cmd_tx.send(Command::CancelSub {
                    addr: addr.to_string(),
                    id,
                });
                Err(Error::Timeout)
            }
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_event_loop(mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut pubs: HashMap<String, VecDeque<PendingPub>> = HashMap::new();
    let mut subs: HashMap<String, VecDeque<PendingSub>> = HashMap::new();

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Pub {
                addr,
                data,
                id,
                done,
            } => {
                let queue = subs.entry(addr.clone()).or_default();
                // Skip subscribers whose handler already gave up.
                let paired = loop {
                    match queue.pop_front() {
                        Some(sub) => {
                            if sub.reply.send(data.clone()).is_ok() {
                                break true;
                            }
                        }
                        None => break false,
                    }
                };
                if queue.is_empty() {
                    subs.remove(&addr);
                }
                if paired {
                    let _ = done.send(());
                } else {
                    pubs.entry(addr).or_default().push_back(PendingPub {
                        id,
                        data,
                        done,
                    });
                }
            }
            Command::Sub { addr, id, reply } => {
                let queue = pubs.entry(addr.clone()).or_default();
                let mut reply = Some(reply);
                while let Some(pending) = queue.pop_front() {
                    // A publisher whose handler expired must not be
                    // delivered; its oneshot receiver is already gone.
                    if pending.done.is_closed() {
                        continue;
                    }
                    let tx = reply.take().unwrap();
                    match tx.send(pending.data.clone()) {
                        Ok(()) => {
                            let _ = pending.done.send(());
                        }
                        Err(_) => {
                            // The subscriber died in flight; keep the
                            // publisher pending for the next one.
                            queue.push_front(pending);
                        }
                    }
                    break;
                }
                if queue.is_empty() {
                    pubs.remove(&addr);
                }
                if let Some(tx) = reply {
                    if !tx.is_closed() {
                        subs.entry(addr).or_default().push_back(PendingSub {
                            id,
                            reply: tx,
                        });
                    }
                }
            }
            Command::CancelPub { addr, id } => {
                if let Some(queue) = pubs.get_mut(&addr) {
                    queue.retain(|p| p.id != id);
                    if queue.is_empty() {
                        pubs.remove(&addr);
                    }
                }
            }
            Command::CancelSub { addr, id } => {
                if let Some(queue) = subs.get_mut(&addr) {
                    queue.retain(|s| s.id != id);
                    if queue.is_empty() {
                        subs.remove(&addr);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PubForm {
    address: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct SubQuery {
    address: String,
}

async fn handle_pub(State(broker): State<Broker>, Form(form): Form<PubForm>) -> Response {
    if form.data.len() > MAX_MESSAGE_SIZE {
        tracing::warn!(addr = %form.address, size = form.data.len(), "pub data too large");
        return (StatusCode::BAD_REQUEST, "data too large").into_response();
    }

    tracing::info!(addr = %form.address, "pub");
    match broker.publish(&form.address, form.data).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::GATEWAY_TIMEOUT.into_response(),
    }
}

async fn handle_sub(State(broker): State<Broker>, Query(query): Query<SubQuery>) -> Response {
    tracing::info!(addr = %query.address, "sub");
    match broker.subscribe(&query.address).await {
        Ok(data) => (StatusCode::OK, data).into_response(),
        Err(_) => StatusCode::GATEWAY_TIMEOUT.into_response(),
    }
}

/// The operator's HTTP router.
pub fn router(broker: Broker) -> Router {
    Router::new()
        .route("/pub", post(handle_pub))
        .route("/sub", get(handle_sub))
        .with_state(broker)
}

/// Bind and serve the operator until the process exits.
pub async fn serve(addr: SocketAddr, broker: Broker) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(local_addr = %addr, "starting operator server");
    axum::serve(listener, router(broker))
        .await
        .map_err(Error::Io)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pub_then_sub_pairs() {
        let broker = Broker::with_poll_window(Duration::from_secs(5));

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish("x", "hello".to_string()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.subscribe("x").await.unwrap(), "hello");
        publisher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sub_then_pub_pairs() {
        let broker = Broker::with_poll_window(Duration::from_secs(5));

        let subscriber = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.subscribe("x").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.publish("x", "hello".to_string()).await.unwrap();
        assert_eq!(subscriber.await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_expired_pub_is_not_delivered() {
        let broker = Broker::with_poll_window(Duration::from_millis(100));

        // Publisher expires unconsumed.
        assert!(matches!(
            broker.publish("y", "stale".to_string()).await,
            Err(Error::Timeout)
        ));

        // A later subscriber must not observe the expired value.
        assert!(matches!(broker.subscribe("y").await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_each_datum_delivered_once() {
        let broker = Broker::with_poll_window(Duration::from_secs(5));

        for data in ["one", "two"] {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish("z", data.to_string()).await });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut got = vec![
            broker.subscribe("z").await.unwrap(),
            broker.subscribe("z").await.unwrap(),
        ];
        got.sort();
        assert_eq!(got, vec!["one".to_string(), "two".to_string()]);

        // Nothing left.
        let broker = Broker {
            window: Duration::from_millis(100),
            ..broker
        };
        assert!(matches!(broker.subscribe("z").await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_addresses_are_independent() {
        let broker = Broker::with_poll_window(Duration::from_millis(100));

        let publisher = {
            let broker = Broker {
                window: Duration::from_secs(5),
                ..broker.clone()
            };
            tokio::spawn(async move { broker.publish("a", "for-a".to_string()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(broker.subscribe("b").await, Err(Error::Timeout)));

        let broker = Broker {
            window: Duration::from_secs(5),
            ..broker
        };
        assert_eq!(broker.subscribe("a").await.unwrap(), "for-a");
        publisher.await.unwrap().unwrap();
    }
}
