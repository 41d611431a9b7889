//! X25519 key exchange
//!
//! Raw Diffie-Hellman plus the four-way pre-key agreement that
//! bootstraps a ratchet session without interaction.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::error::{CryptoError, CryptoResult};
use super::kdf;

/// Size of a shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// Derivation label for the pre-key agreement
const AGREEMENT_LABEL: &str = "keyport-agreement-v1";

/// An X25519 public key
///
/// Wraps the curve point directly; any 32-byte string is a valid
/// encoding, so construction never fails on well-sized input.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExchangePublicKey(X25519Public);

impl ExchangePublicKey {
    /// Parse from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(ExchangePublicKey(X25519Public::from(array)))
    }

    /// The encoded curve point
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// The encoded curve point, by value
    pub fn to_bytes(self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Hex encoding, for persistence
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Parse from hex
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }
}

impl From<[u8; 32]> for ExchangePublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        ExchangePublicKey(X25519Public::from(bytes))
    }
}

impl std::fmt::Debug for ExchangePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "x25519:{}..", &self.to_hex()[..12])
    }
}

impl serde::Serialize for ExchangePublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for ExchangePublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Shared secret derived from key exchange
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    secret: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    /// Wrap raw bytes as a shared secret
    pub fn from_bytes(secret: [u8; SHARED_SECRET_SIZE]) -> Self {
        SharedSecret { secret }
    }

    /// Raw secret bytes; keep the borrow short
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.secret
    }
}

/// A keypair minted for one handshake
///
/// Holds the dalek secret, which zeroizes itself on drop; the public
/// half is recomputed on demand.
pub struct EphemeralKeypair {
    secret: StaticSecret,
}

impl EphemeralKeypair {
    /// The public half, sent to the peer
    pub fn public_key(&self) -> ExchangePublicKey {
        ExchangePublicKey(X25519Public::from(&self.secret))
    }

    /// Diffie-Hellman against a peer key
    pub fn diffie_hellman(&self, peer: &ExchangePublicKey) -> SharedSecret {
        SharedSecret {
            secret: self.secret.diffie_hellman(&peer.0).to_bytes(),
        }
    }

    /// Raw secret bytes, for ratchet state that outlives the keypair
    pub(crate) fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// Mint a fresh keypair
pub fn generate_ephemeral() -> EphemeralKeypair {
    EphemeralKeypair {
        secret: StaticSecret::random_from_rng(OsRng),
    }
}

/// Public key for a raw static secret
///
/// Identity and pre-key secrets are stored raw; their publics are
/// derived when a bundle is published or a ratchet initialized.
pub fn public_from_secret(secret: &[u8; 32]) -> ExchangePublicKey {
    let secret = StaticSecret::from(*secret);
    ExchangePublicKey(X25519Public::from(&secret))
}

fn dh(secret: &[u8; 32], peer: &ExchangePublicKey) -> x25519_dalek::SharedSecret {
    StaticSecret::from(*secret).diffie_hellman(&peer.0)
}

/// Diffie-Hellman between a raw static secret and a peer key
pub(crate) fn static_diffie_hellman(secret: &[u8; 32], peer: &ExchangePublicKey) -> SharedSecret {
    SharedSecret {
        secret: dh(secret, peer).to_bytes(),
    }
}

/// Pre-key agreement, initiator side
///
/// Four DH outputs absorbed in a fixed order:
/// identity x signed-pre-key, ephemeral x identity,
/// ephemeral x signed-pre-key, and (when the bundle carried one)
/// ephemeral x one-time-pre-key.
pub fn agree_initiator(
    my_identity_secret: &[u8; 32],
    my_ephemeral: &EphemeralKeypair,
    their_identity: &ExchangePublicKey,
    their_signed_pre_key: &ExchangePublicKey,
    their_one_time: Option<&ExchangePublicKey>,
) -> SharedSecret {
    let dh1 = dh(my_identity_secret, their_signed_pre_key);
    let dh2 = my_ephemeral.diffie_hellman(their_identity);
    let dh3 = my_ephemeral.diffie_hellman(their_signed_pre_key);
    let dh4 = their_one_time.map(|one_time| my_ephemeral.diffie_hellman(one_time));

    let mut parts: Vec<&[u8]> = vec![dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()];
    if let Some(dh4) = &dh4 {
        parts.push(dh4.as_bytes());
    }

    SharedSecret {
        secret: kdf::absorb(AGREEMENT_LABEL, &parts),
    }
}

/// Pre-key agreement, responder side
///
/// The same four DH outputs computed from the responder's static
/// secrets, absorbed in the initiator's order.
pub fn agree_responder(
    my_identity_secret: &[u8; 32],
    my_signed_pre_key_secret: &[u8; 32],
    my_one_time_secret: Option<&[u8; 32]>,
    their_identity: &ExchangePublicKey,
    their_ephemeral: &ExchangePublicKey,
) -> SharedSecret {
    let dh1 = dh(my_signed_pre_key_secret, their_identity);
    let dh2 = dh(my_identity_secret, their_ephemeral);
    let dh3 = dh(my_signed_pre_key_secret, their_ephemeral);
    let dh4 = my_one_time_secret.map(|one_time| dh(one_time, their_ephemeral));

    let mut parts: Vec<&[u8]> = vec![dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()];
    if let Some(dh4) = &dh4 {
        parts.push(dh4.as_bytes());
    }

    SharedSecret {
        secret: kdf::absorb(AGREEMENT_LABEL, &parts),
    }
}
