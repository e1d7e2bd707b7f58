//! Long-term peer identity keys and NaCl-box sealing of signaling
//! messages.
//!
//! Every peer is identified by a 32-byte Curve25519 public key whose
//! text form is base58. Signaling payloads are sealed with
//! `crypto_box` (X25519 + XSalsa20-Poly1305): a random 24-byte nonce is
//! generated per message and prepended to the ciphertext, so the wire
//! form is `nonce || box`. Only the addressed peer can open and
//! authenticate a message.

use std::fmt;
use std::str::FromStr;

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Size of a public or private key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of a box nonce in bytes.
pub const NONCE_SIZE: usize = 24;

/// A public or private encryption key.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// An all-zero key is the "unset" sentinel and never valid.
    pub fn valid(&self) -> bool {
        self.0 != [0u8; KEY_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; KEY_SIZE]> for Key {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl FromStr for Key {
    type Err = Error;

    /// Strict decode: base58, exactly 32 bytes.
    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s).into_vec().map_err(|_| Error::InvalidKey)?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| Error::InvalidKey)?;
        Ok(Key(bytes))
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A public/private key pair forming a peer's permanent identity.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(rename = "Public")]
    pub public: Key,
    #[serde(rename = "Private")]
    pub private: Key,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the private half.
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh key pair from OS randomness.
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        KeyPair {
            public: Key(*secret.public_key().as_bytes()),
            private: Key(secret.to_bytes()),
        }
    }

    /// Seal `plaintext` for `peer` using the local private key.
    ///
    /// Output layout: `nonce(24) || box ciphertext`.
    pub fn encrypt(&self, peer: &Key, plaintext: &[u8]) -> Vec<u8> {
        let sealer = SalsaBox::new(&PublicKey::from(peer.0), &SecretKey::from(self.private.0));
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let sealed = sealer
            .encrypt(&nonce, plaintext)
            .expect("XSalsa20-Poly1305 sealing of an in-memory buffer cannot fail");

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        out
    }

    /// Open a message sealed by `peer` for the local private key.
    ///
    /// Rejects anything shorter than a nonce and anything whose box
    /// authentication fails with [`Error::InvalidMessage`].
    pub fn decrypt(&self, peer: &Key, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(Error::InvalidMessage);
        }
        let (nonce, sealed) = data.split_at(NONCE_SIZE);
        let opener = SalsaBox::new(&PublicKey::from(peer.0), &SecretKey::from(self.private.0));
        opener
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map_err(|_| Error::InvalidMessage)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let plaintext = b"Hello World";
        let sealed = a.encrypt(&b.public, plaintext);
        assert_ne!(&sealed[NONCE_SIZE..], plaintext.as_slice());

        let opened = b.decrypt(&a.public, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_short_message_rejected() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let err = b.decrypt(&a.public, &[0u8; NONCE_SIZE - 1]).unwrap_err();
        assert!(matches!(err, Error::InvalidMessage));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let sealed = a.encrypt(&b.public, b"sensitive data");
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0xff;
            assert!(
                matches!(b.decrypt(&a.public, &tampered), Err(Error::InvalidMessage)),
                "flipping byte {} must invalidate the message",
                i
            );
        }
        // The untouched message still opens.
        assert!(b.decrypt(&a.public, &sealed).is_ok());
    }

    #[test]
    fn test_wrong_recipient_rejected() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let c = KeyPair::generate();

        let sealed = a.encrypt(&b.public, b"private");
        assert!(matches!(
            c.decrypt(&a.public, &sealed),
            Err(Error::InvalidMessage)
        ));
    }

    #[test]
    fn test_key_string_round_trip() {
        let pair = KeyPair::generate();
        let parsed: Key = pair.public.to_string().parse().unwrap();
        assert_eq!(parsed, pair.public);
    }

    #[test]
    fn test_key_parse_rejects_bad_input() {
        // Not base58.
        assert!(matches!("0OIl".parse::<Key>(), Err(Error::InvalidKey)));
        // Valid base58, wrong length.
        let short = bs58::encode([1u8; 16]).into_string();
        assert!(matches!(short.parse::<Key>(), Err(Error::InvalidKey)));
        let long = bs58::encode([1u8; 48]).into_string();
        assert!(matches!(long.parse::<Key>(), Err(Error::InvalidKey)));
    }

    #[test]
    fn test_zero_key_is_invalid() {
        assert!(!Key::default().valid());
        assert!(KeyPair::generate().public.valid());
    }

    #[test]
    fn test_distinct_keypairs() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public.to_string(), b.public.to_string());
    }

    #[test]
    fn test_key_serde_as_base58_string() {
        let pair = KeyPair::generate();
        let json = serde_json::to_string(&pair.public).unwrap();
        assert_eq!(json, format!("\"{}\"", pair.public));
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair.public);
    }
}
