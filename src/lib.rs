//! rtctunnel builds authenticated, encrypted network tunnels between
//! two peers over WebRTC data channels.
//!
//! Peers are identified by long-lived NaCl keys and never need to know
//! each other's address: signaling travels through an untrusted
//! rendezvous mailbox (see [`operator`] for the broker and
//! [`channels`] for the client-side transports), sealed end to end
//! with the peers' key pairs ([`crypt`], [`signal`]). Once a
//! connection is up, every forwarded port rides its own data channel
//! ([`peer`]), and the [`tunnel`] runtime wires configured routes
//! ([`config`]) into local listeners and proxies.

pub mod channels;
pub mod config;
pub mod crypt;
pub mod error;
pub mod operator;
pub mod peer;
pub mod signal;
pub mod tunnel;

pub use error::{Error, Result};
