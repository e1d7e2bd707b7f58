//! Error taxonomy shared across the crate.
//!
//! Variants map one-to-one onto the failure classes the retry policies
//! care about: the operator client retries only on [`Error::Timeout`],
//! peer bring-up aborts on anything, and proxy sessions treat
//! [`Error::Cancelled`] as a clean shutdown.

use std::io;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A key failed base58 decoding or is not exactly 32 bytes.
    #[error("invalid key")]
    InvalidKey,

    /// A sealed message is too short or failed box authentication.
    #[error("invalid message")]
    InvalidMessage,

    /// A signaling payload is not valid base58.
    #[error("invalid encoding")]
    InvalidEncoding,

    /// Network I/O failure talking to a signal channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// A rendezvous or connection deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled by shutdown or close.
    #[error("cancelled")]
    Cancelled,

    /// A dispatcher listener is already bound to this port.
    #[error("port {0} already has a listener")]
    PortBusy(u16),

    /// An inbound stream targeted a port with no configured route.
    #[error("no route for port {0}")]
    NoRouteForPort(u16),

    /// The ICE connection reached `failed` or closed unexpectedly.
    #[error("peer connection failed: {0}")]
    PeerConnectionFailed(String),

    /// The WebRTC stack rejected an offer, answer, or candidate.
    #[error("webrtc error: {0}")]
    WebRtc(String),

    /// Invalid or unloadable configuration.
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
