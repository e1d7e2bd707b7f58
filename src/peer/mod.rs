//! Peer connections: one WebRTC connection per remote peer, carrying
//! any number of port-forward streams as labeled data channels.
//!
//! Bring-up needs the signaling mailbox exactly twice. The peer with
//! the lexically smaller base58 public key creates the offer (no
//! coordination required); the other answers. Once ICE connects,
//! [`Conn::open`] starts a stream to a remote port by creating a data
//! channel labeled `rtctunnel:<port>`, and [`Conn::accept`] yields the
//! streams the remote opened; the label is the whole handshake.

pub mod dispatcher;
pub mod stream;

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use datachannel::{
    ConnectionState, DataChannelInfo, DataChannelInit, GatheringState, IceCandidate,
    PeerConnectionHandler, RtcConfig, RtcDataChannel, RtcPeerConnection, SdpType,
    SessionDescription,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::{sleep, timeout};

use crate::crypt::Key;
use crate::error::{Error, Result};
use crate::signal::{SignalMessage, Signaler};

pub use dispatcher::{Dispatcher, Listener};
pub use stream::DcStream;

use stream::DcHandler;

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Prefix of every stream-carrying data channel label.
const LABEL_PREFIX: &str = "rtctunnel";

/// Overall bring-up deadline: gathering plus signaling plus ICE.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for a single data channel to open.
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// The channel is not always writable the instant the open callback
/// fires; writes issued immediately can be dropped.
const OPEN_SETTLE: Duration = Duration::from_millis(50);

/// Role selection: the lexically smaller base58 key makes the offer.
pub fn is_offerer(local: &Key, remote: &Key) -> bool {
    local.to_string() < remote.to_string()
}

/// Parse a `rtctunnel:<port>` data channel label.
fn parse_stream_label(label: &str) -> Option<u16> {
    let (name, port) = label.rsplit_once(':')?;
    if name != LABEL_PREFIX {
        return None;
    }
    port.parse().ok()
}

fn stream_label(port: u16) -> String {
    format!("{LABEL_PREFIX}:{port}")
}

// ---------------------------------------------------------------------------
// Callback bridge
// ---------------------------------------------------------------------------

/// Connection state as seen by the async side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<ConnectionState> for PeerState {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::New => PeerState::New,
            ConnectionState::Connecting => PeerState::Connecting,
            ConnectionState::Connected => PeerState::Connected,
            ConnectionState::Disconnected => PeerState::Disconnected,
            ConnectionState::Failed => PeerState::Failed,
            ConnectionState::Closed => PeerState::Closed,
        }
    }
}

/// An incoming data channel paired with the receive queue its handler
/// feeds.
pub(crate) struct IncomingChannel {
    dc: Box<RtcDataChannel<DcHandler>>,
    msg_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

struct PendingParts {
    msg_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Forwards peer-connection callbacks (libdatachannel threads) into
/// channels; must never block.
struct PcHandler {
    candidate_tx: mpsc::UnboundedSender<IceCandidate>,
    gathering_tx: Option<oneshot::Sender<()>>,
    state_tx: watch::Sender<PeerState>,
    incoming_tx: mpsc::UnboundedSender<IncomingChannel>,
    /// Receive queue created in `data_channel_handler`, claimed by the
    /// matching `on_data_channel` (the two run back to back on the same
    /// thread).
    pending: Option<PendingParts>,
}

impl PeerConnectionHandler for PcHandler {
    type DCH = DcHandler;

    fn data_channel_handler(&mut self, _info: DataChannelInfo) -> DcHandler {
        let (handler, msg_rx, _open_rx) = DcHandler::new();
        self.pending = Some(PendingParts { msg_rx });
        handler
    }

    fn on_data_channel(&mut self, dc: Box<RtcDataChannel<DcHandler>>) {
        if let Some(parts) = self.pending.take() {
            let _ = self.incoming_tx.send(IncomingChannel {
                dc,
                msg_rx: parts.msg_rx,
            });
        }
    }

    fn on_candidate(&mut self, candidate: IceCandidate) {
        let _ = self.candidate_tx.send(candidate);
    }

    fn on_gathering_state_change(&mut self, state: GatheringState) {
        if state == GatheringState::Complete {
            if let Some(tx) = self.gathering_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    fn on_connection_state_change(&mut self, state: ConnectionState) {
        let _ = self.state_tx.send(state.into());
    }
}

// ---------------------------------------------------------------------------
// Conn
// ---------------------------------------------------------------------------

/// One WebRTC peer connection to a remote identified by its public
/// key. Useless after [`Conn::close`]; pending opens and accepts then
/// return [`Error::Cancelled`].
pub struct Conn {
    peer_key: Key,
    pc: StdMutex<Option<Box<RtcPeerConnection<PcHandler>>>>,
    /// The offerer's bootstrap channel, held so ICE stays alive even
    /// with no active streams.
    bootstrap: StdMutex<Option<Box<RtcDataChannel<DcHandler>>>>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<IncomingChannel>>,
}

impl Conn {
    /// Negotiate a connection to `peer_key` through the signaler.
    ///
    /// Runs the full offerer/answerer exchange and resolves once ICE
    /// reports connected, or fails after 60 seconds.
    pub async fn connect(signaler: &Signaler, peer_key: Key) -> Result<Conn> {
        let offerer = is_offerer(&signaler.public_key(), &peer_key);
        tracing::info!(peer = %peer_key, offerer, "creating webrtc peer connection");

        let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel();
        let (gathering_tx, gathering_rx) = oneshot::channel();
        let (state_tx, mut state_rx) = watch::channel(PeerState::New);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let handler = PcHandler {
            candidate_tx,
            gathering_tx: Some(gathering_tx),
            state_tx,
            incoming_tx,
            pending: None,
        };
        let config = RtcConfig::new(&[STUN_SERVER]);
        let mut pc = RtcPeerConnection::new(&config, handler)
            .map_err(|e| Error::WebRtc(format!("failed to create peer connection: {e}")))?;

        let mut bootstrap = None;
        if offerer {
            // Creating a channel kicks off ICE gathering; the label
            // has no port so the remote accept loop ignores it.
            let (dc_handler, _msg_rx, _open_rx) = DcHandler::new();
            let dc = pc
                .create_data_channel_ex("rtctunnel:init", dc_handler, &DataChannelInit::default())
                .map_err(|e| Error::WebRtc(format!("failed to create bootstrap channel: {e}")))?;
            bootstrap = Some(dc);

            timeout(CONNECT_TIMEOUT, gathering_rx)
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(|_| Error::Cancelled)?;

            let local = pc.local_description().ok_or_else(|| {
                Error::WebRtc("no local description after gathering".to_string())
            })?;
            let offer = SignalMessage {
                sdp: local.sdp.to_string(),
                ice_candidates: drain_candidates(&mut candidate_rx),
            };
            signaler.send(&peer_key, &offer).await?;

            let answer = signaler.recv(&peer_key).await?;
            apply_remote(&mut pc, SdpType::Answer, &answer)?;
        } else {
            let offer = signaler.recv(&peer_key).await?;
            // libdatachannel generates the local answer as part of
            // applying the remote offer.
            apply_remote(&mut pc, SdpType::Offer, &offer)?;

            timeout(CONNECT_TIMEOUT, gathering_rx)
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(|_| Error::Cancelled)?;

            let local = pc.local_description().ok_or_else(|| {
                Error::WebRtc("no local description after applying offer".to_string())
            })?;
            let answer = SignalMessage {
                sdp: local.sdp.to_string(),
                ice_candidates: drain_candidates(&mut candidate_rx),
            };
            signaler.send(&peer_key, &answer).await?;
        }

        wait_connected(&mut state_rx).await?;
        tracing::info!(peer = %peer_key, "peer connection established");

        Ok(Conn {
            peer_key,
            pc: StdMutex::new(Some(pc)),
            bootstrap: StdMutex::new(bootstrap),
            incoming: AsyncMutex::new(incoming_rx),
        })
    }

    pub fn peer_key(&self) -> Key {
        self.peer_key
    }

    /// Open a stream to `port` on the remote peer.
    pub async fn open(&self, port: u16) -> Result<DcStream> {
        let label = stream_label(port);
        let (handler, msg_rx, open_rx) = DcHandler::new();
        let dc = {
            let mut guard = self.pc.lock().unwrap();
            let pc = guard.as_mut().ok_or(Error::Cancelled)?;
            pc.create_data_channel_ex(&label, handler, &DataChannelInit::default())
                .map_err(|e| Error::WebRtc(format!("failed to open data channel: {e}")))?
        };

        timeout(OPEN_TIMEOUT, open_rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Cancelled)?;
        sleep(OPEN_SETTLE).await;

        tracing::info!(peer = %self.peer_key, port, "opened stream");
        Ok(DcStream::new(port, label, dc, msg_rx))
    }

    /// Wait for the next stream the remote peer opened.
    ///
    /// Channels whose label is not `rtctunnel:<port>` are dropped and
    /// iteration continues. Returns [`Error::Cancelled`] once the
    /// connection closes.
    pub async fn accept(&self) -> Result<(DcStream, u16)> {
        let mut incoming = self.incoming.lock().await;
        loop {
            let chan = incoming.recv().await.ok_or(Error::Cancelled)?;
            let label = chan.dc.label();
            match parse_stream_label(&label) {
                Some(port) => {
                    tracing::info!(peer = %self.peer_key, port, "accepted stream");
                    return Ok((DcStream::new(port, label, chan.dc, chan.msg_rx), port));
                }
                None => {
                    tracing::info!(label = %label, "ignoring datachannel");
                }
            }
        }
    }

    /// Close the connection. Idempotent; all derived streams become
    /// unusable and pending opens/accepts fail with
    /// [`Error::Cancelled`].
    pub fn close(&self) {
        self.bootstrap.lock().unwrap().take();
        let pc = self.pc.lock().unwrap().take();
        if pc.is_some() {
            tracing::info!(peer = %self.peer_key, "closing peer connection");
        }
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("peer_key", &self.peer_key)
            .field("open", &self.pc.lock().unwrap().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Bring-up helpers
// ---------------------------------------------------------------------------

fn drain_candidates(rx: &mut mpsc::UnboundedReceiver<IceCandidate>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(candidate) = rx.try_recv() {
        out.push(format!("{} {}", candidate.mid, candidate.candidate));
    }
    out
}

fn apply_remote(
    pc: &mut RtcPeerConnection<PcHandler>,
    sdp_type: SdpType,
    msg: &SignalMessage,
) -> Result<()> {
    let session = webrtc_sdp::parse_sdp(&msg.sdp, false)
        .map_err(|e| Error::WebRtc(format!("invalid remote sdp: {e:?}")))?;
    pc.set_remote_description(&SessionDescription {
        sdp_type,
        sdp: session,
    })
    .map_err(|e| Error::WebRtc(format!("failed to set remote description: {e}")))?;

    for entry in &msg.ice_candidates {
        let Some((mid, candidate)) = entry.split_once(' ') else {
            tracing::warn!(entry = %entry, "skipping malformed ice candidate");
            continue;
        };
        pc.add_remote_candidate(&IceCandidate {
            candidate: candidate.to_string(),
            mid: mid.to_string(),
        })
        .map_err(|e| Error::WebRtc(format!("failed to add ice candidate: {e}")))?;
    }
    Ok(())
}

async fn wait_connected(state_rx: &mut watch::Receiver<PeerState>) -> Result<()> {
    timeout(CONNECT_TIMEOUT, async {
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                PeerState::Connected => return Ok(()),
                PeerState::Failed | PeerState::Closed => {
                    return Err(Error::PeerConnectionFailed(format!(
                        "ice state {state:?}"
                    )))
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(Error::Cancelled);
            }
        }
    })
    .await
    .map_err(|_| Error::Timeout)?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::KeyPair;

    #[test]
    fn test_role_selection_is_deterministic() {
        for _ in 0..32 {
            let a = KeyPair::generate().public;
            let b = KeyPair::generate().public;
            // Exactly one side offers, regardless of evaluation order.
            assert_ne!(is_offerer(&a, &b), is_offerer(&b, &a));
            assert_eq!(
                is_offerer(&a, &b),
                a.to_string() < b.to_string()
            );
        }
    }

    #[test]
    fn test_stream_label_round_trip() {
        assert_eq!(parse_stream_label(&stream_label(10000)), Some(10000));
        assert_eq!(parse_stream_label("rtctunnel:1"), Some(1));
    }

    #[test]
    fn test_foreign_labels_ignored() {
        assert_eq!(parse_stream_label("rtctunnel:init"), None);
        assert_eq!(parse_stream_label("rtctunnel:"), None);
        assert_eq!(parse_stream_label("rtctunnel:70000"), None);
        assert_eq!(parse_stream_label("other:8080"), None);
        assert_eq!(parse_stream_label("no-colon"), None);
        assert_eq!(parse_stream_label(""), None);
    }
}
