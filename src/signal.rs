//! Encrypted signaling on top of a [`SignalChannel`].
//!
//! Messages travel between directional mailboxes named
//! `"<recipient_pub>/<sender_pub>"`, so the offer and the answer use
//! opposite addresses and never collide. The payload is a JSON
//! [`SignalMessage`] sealed with NaCl box and base58-encoded for the
//! wire.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channels::SignalChannel;
use crate::crypt::{Key, KeyPair};
use crate::error::{Error, Result};

/// The plaintext exchanged during connection bring-up: the session
/// description plus any ICE candidates gathered alongside it. Each
/// candidate entry is `"<mid> <candidate>"` (a mid never contains a
/// space).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "SDP")]
    pub sdp: String,
    #[serde(rename = "ICECandidates", default)]
    pub ice_candidates: Vec<String>,
}

/// Sends and receives encrypted signaling messages for one local
/// identity over a shared signal channel.
#[derive(Clone)]
pub struct Signaler {
    keypair: KeyPair,
    channel: Arc<dyn SignalChannel>,
}

impl Signaler {
    pub fn new(keypair: KeyPair, channel: Arc<dyn SignalChannel>) -> Self {
        Signaler { keypair, channel }
    }

    pub fn public_key(&self) -> Key {
        self.keypair.public
    }

    /// Seal `msg` for `remote` and publish it to the remote's inbox.
    pub async fn send(&self, remote: &Key, msg: &SignalMessage) -> Result<()> {
        let plaintext = serde_json::to_vec(msg).map_err(|_| Error::InvalidEncoding)?;
        let sealed = self.keypair.encrypt(remote, &plaintext);
        let addr = format!("{}/{}", remote, self.keypair.public);
        self.channel
            .send(&addr, &bs58::encode(sealed).into_string())
            .await
    }

    /// Consume the next message `remote` published to our inbox.
    pub async fn recv(&self, remote: &Key) -> Result<SignalMessage> {
        let addr = format!("{}/{}", self.keypair.public, remote);
        let encoded = self.channel.recv(&addr).await?;
        let sealed = bs58::decode(&encoded)
            .into_vec()
            .map_err(|_| Error::InvalidEncoding)?;
        let plaintext = self.keypair.decrypt(remote, &sealed)?;
        serde_json::from_slice(&plaintext).map_err(|_| Error::InvalidMessage)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelRegistry;

    fn signaler_pair() -> (Signaler, Signaler) {
        let registry = ChannelRegistry::new();
        let a = Signaler::new(
            KeyPair::generate(),
            registry.get("memory://test").unwrap(),
        );
        let b = Signaler::new(
            KeyPair::generate(),
            registry.get("memory://test").unwrap(),
        );
        (a, b)
    }

    #[tokio::test]
    async fn test_signal_round_trip() {
        let (a, b) = signaler_pair();
        let msg = SignalMessage {
            sdp: "v=0\r\n".to_string(),
            ice_candidates: vec!["0 candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host".to_string()],
        };

        let a_pub = a.public_key();
        let b_pub = b.public_key();
        let sent = msg.clone();
        let sender = tokio::spawn(async move { a.send(&b_pub, &sent).await });
        let got = b.recv(&a_pub).await.unwrap();
        sender.await.unwrap().unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_tampered_signal_fails_fast() {
        let registry = ChannelRegistry::new();
        let channel = registry.get("memory://test").unwrap();
        let a = Signaler::new(KeyPair::generate(), Arc::clone(&channel));
        let b = Signaler::new(KeyPair::generate(), Arc::clone(&channel));

        let a_pub = a.public_key();
        let b_pub = b.public_key();
        let msg = SignalMessage {
            sdp: "v=0\r\n".to_string(),
            ice_candidates: vec![],
        };

        // Intercept the mailbox and flip one ciphertext byte.
        let inbox = format!("{}/{}", b_pub, a_pub);
        let sender = {
            let a = a.clone();
            tokio::spawn(async move { a.send(&b_pub, &msg).await })
        };
        let wire = channel.recv(&inbox).await.unwrap();
        sender.await.unwrap().unwrap();
        let mut sealed = bs58::decode(&wire).into_vec().unwrap();
        sealed[10] ^= 0xff;
        channel
            .send(&inbox, &bs58::encode(sealed).into_string())
            .await
            .unwrap();

        assert!(matches!(b.recv(&a_pub).await, Err(Error::InvalidMessage)));
    }

    #[tokio::test]
    async fn test_garbage_encoding_rejected() {
        let registry = ChannelRegistry::new();
        let channel = registry.get("memory://test").unwrap();
        let a = Signaler::new(KeyPair::generate(), Arc::clone(&channel));
        let b = Signaler::new(KeyPair::generate(), Arc::clone(&channel));

        let inbox = format!("{}/{}", b.public_key(), a.public_key());
        channel.send(&inbox, "not-base58-0OIl").await.unwrap();
        assert!(matches!(
            b.recv(&a.public_key()).await,
            Err(Error::InvalidEncoding)
        ));
    }

    #[test]
    fn test_wire_field_names() {
        let msg = SignalMessage {
            sdp: "sdp".to_string(),
            ice_candidates: vec!["c".to_string()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"SDP":"sdp","ICECandidates":["c"]}"#);
    }
}
