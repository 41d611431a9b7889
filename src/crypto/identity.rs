//! Gateway identity
//!
//! Long-lived Ed25519 identity used for the ratchet handshake, carrying
//! the signed pre-key and the pool of one-time pre-keys published in
//! pre-key bundles. Created on first run, persisted, reused across
//! connections.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{CryptoError, CryptoResult};
use super::exchange::{self, ExchangePublicKey};

/// Number of one-time pre-keys kept in the pool
pub const ONE_TIME_POOL_SIZE: usize = 10;

/// A verified Ed25519 public key
///
/// Construction parses the curve point, so a held `PublicKey` is always
/// a valid verifier; malformed peer keys are rejected at the edge.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse and validate an encoded key
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        VerifyingKey::from_bytes(&array)
            .map(PublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// The encoded key
    pub fn to_bytes(self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Hex encoding, used as the storage key for pinned peers
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    /// Parse from hex
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// Verify a signature over `message`
    ///
    /// Uses strict verification, rejecting the malleable encodings the
    /// relaxed rules let through.
    pub fn verify(&self, message: &[u8], signature: &IdentitySignature) -> CryptoResult<()> {
        self.0
            .verify_strict(message, &signature.0)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ed25519:{}..", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// A detached Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentitySignature(Signature);

impl IdentitySignature {
    /// Parse an encoded signature
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Signature::from_slice(bytes)
            .map(IdentitySignature)
            .map_err(|_| CryptoError::InvalidSignatureLength {
                expected: 64,
                actual: bytes.len(),
            })
    }

    /// The encoded signature
    pub fn to_bytes(self) -> [u8; 64] {
        self.0.to_bytes()
    }

    /// Hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    /// Parse from hex
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::SignatureVerificationFailed)?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for IdentitySignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sig:{}..", &self.to_hex()[..12])
    }
}

impl serde::Serialize for IdentitySignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for IdentitySignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// A one-time pre-key, consumed on first use
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct OneTimePreKey {
    /// Identifier referenced by handshake frames
    #[zeroize(skip)]
    pub id: u32,
    pub(crate) secret: [u8; 32],
}

impl OneTimePreKey {
    /// Public half, published in bundles
    pub fn public_key(&self) -> ExchangePublicKey {
        exchange::public_from_secret(&self.secret)
    }
}

/// A cryptographic identity: signing keypair plus pre-key material
///
/// Secrets are zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    public_key: PublicKey,
    secret_key: [u8; 32],
    signed_pre_key: [u8; 32],
    #[zeroize(skip)]
    signed_pre_key_id: u32,
    #[zeroize(skip)]
    one_time: Vec<OneTimePreKey>,
    #[zeroize(skip)]
    next_one_time_id: u32,
    #[zeroize(skip)]
    registration_id: u32,
}

impl Identity {
    /// Generate a new random identity with a full pre-key pool
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);

        let mut identity = Identity {
            public_key: PublicKey(signing_key.verifying_key()),
            secret_key: signing_key.to_bytes(),
            signed_pre_key: super::random_bytes(),
            signed_pre_key_id: 1,
            one_time: Vec::new(),
            next_one_time_id: 1,
            registration_id: rand::random(),
        };
        identity.replenish_one_time();
        identity
    }

    /// Get the public signing key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Get the secret key bytes (for key exchange operations)
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        &self.secret_key
    }

    /// X25519 public key derived from the signing key
    pub fn exchange_public(&self) -> ExchangePublicKey {
        exchange::public_from_secret(&self.secret_key)
    }

    /// Registration id published in bundles
    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// Current signed pre-key id
    pub fn signed_pre_key_id(&self) -> u32 {
        self.signed_pre_key_id
    }

    /// Public half of the signed pre-key
    pub fn signed_pre_key_public(&self) -> ExchangePublicKey {
        exchange::public_from_secret(&self.signed_pre_key)
    }

    /// Secret half of the signed pre-key
    pub(crate) fn signed_pre_key_secret(&self) -> &[u8; 32] {
        &self.signed_pre_key
    }

    /// Signature over the signed pre-key public, under the identity key
    pub fn signed_pre_key_signature(&self) -> IdentitySignature {
        self.sign(self.signed_pre_key_public().as_bytes())
    }

    /// First unconsumed one-time pre-key, if any
    pub fn peek_one_time(&self) -> Option<&OneTimePreKey> {
        self.one_time.first()
    }

    /// Consume a one-time pre-key by id, returning its secret
    pub fn take_one_time(&mut self, id: u32) -> CryptoResult<[u8; 32]> {
        let idx = self
            .one_time
            .iter()
            .position(|k| k.id == id)
            .ok_or(CryptoError::UnknownPreKey(id))?;
        let key = self.one_time.remove(idx);
        Ok(key.secret)
    }

    /// Top the one-time pool back up to [`ONE_TIME_POOL_SIZE`]
    pub fn replenish_one_time(&mut self) {
        while self.one_time.len() < ONE_TIME_POOL_SIZE {
            self.one_time.push(OneTimePreKey {
                id: self.next_one_time_id,
                secret: super::random_bytes(),
            });
            self.next_one_time_id += 1;
        }
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> IdentitySignature {
        let signing_key = SigningKey::from_bytes(&self.secret_key);
        IdentitySignature(signing_key.sign(message))
    }

    /// Verify a signature (convenience method)
    pub fn verify(&self, message: &[u8], signature: &IdentitySignature) -> CryptoResult<()> {
        self.public_key.verify(message, signature)
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Identity {
            public_key: self.public_key,
            secret_key: self.secret_key,
            signed_pre_key: self.signed_pre_key,
            signed_pre_key_id: self.signed_pre_key_id,
            one_time: self.one_time.clone(),
            next_one_time_id: self.next_one_time_id,
            registration_id: self.registration_id,
        }
    }
}

// Persisted form: secrets hex-encoded, same shape the file store writes.
#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    secret_key: String,
    signed_pre_key: String,
    signed_pre_key_id: u32,
    one_time: Vec<OneTimeRecord>,
    next_one_time_id: u32,
    registration_id: u32,
}

#[derive(Serialize, Deserialize)]
struct OneTimeRecord {
    id: u32,
    secret: String,
}

fn hex32(s: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(s).map_err(|e| e.to_string())?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "expected 32 bytes".to_string())?;
    Ok(arr)
}

impl Serialize for Identity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        IdentityRecord {
            secret_key: hex::encode(self.secret_key),
            signed_pre_key: hex::encode(self.signed_pre_key),
            signed_pre_key_id: self.signed_pre_key_id,
            one_time: self
                .one_time
                .iter()
                .map(|k| OneTimeRecord {
                    id: k.id,
                    secret: hex::encode(k.secret),
                })
                .collect(),
            next_one_time_id: self.next_one_time_id,
            registration_id: self.registration_id,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let record = IdentityRecord::deserialize(deserializer)?;
        let secret_key = hex32(&record.secret_key).map_err(serde::de::Error::custom)?;
        let signing_key = SigningKey::from_bytes(&secret_key);

        let mut one_time = Vec::with_capacity(record.one_time.len());
        for k in record.one_time {
            one_time.push(OneTimePreKey {
                id: k.id,
                secret: hex32(&k.secret).map_err(serde::de::Error::custom)?,
            });
        }

        Ok(Identity {
            public_key: PublicKey(signing_key.verifying_key()),
            secret_key,
            signed_pre_key: hex32(&record.signed_pre_key).map_err(serde::de::Error::custom)?,
            signed_pre_key_id: record.signed_pre_key_id,
            one_time,
            next_one_time_id: record.next_one_time_id,
            registration_id: record.registration_id,
        })
    }
}

/// Pinned counterparty public identity
///
/// Created on first successful handshake, keyed by a stable logical
/// identifier; overwritten on reprovisioning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    /// Peer's signing key
    pub signing: PublicKey,
    /// Peer's exchange key
    pub exchange: ExchangePublicKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let id1 = Identity::generate();
        let id2 = Identity::generate();

        // Each identity should be unique
        assert_ne!(id1.public_key().to_bytes(), id2.public_key().to_bytes());
        assert_eq!(id1.one_time.len(), ONE_TIME_POOL_SIZE);
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"hello keyport";

        let signature = id.sign(message);
        assert!(id.verify(message, &signature).is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let id = Identity::generate();

        let signature = id.sign(b"original");
        assert!(id.verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn test_signature_bytes_round_trip() {
        let id = Identity::generate();
        let signature = id.sign(b"encoded");

        let restored = IdentitySignature::from_bytes(&signature.to_bytes()).unwrap();
        assert_eq!(restored, signature);
        assert!(id.verify(b"encoded", &restored).is_ok());

        assert!(matches!(
            IdentitySignature::from_bytes(&[0u8; 10]),
            Err(CryptoError::InvalidSignatureLength { actual: 10, .. })
        ));
    }

    #[test]
    fn test_invalid_point_rejected() {
        // All-ones is not a canonical curve point encoding
        let bytes = [0xFFu8; 32];
        assert!(PublicKey::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_signed_pre_key_signature_verifies() {
        let id = Identity::generate();
        let sig = id.signed_pre_key_signature();

        assert!(id
            .public_key()
            .verify(id.signed_pre_key_public().as_bytes(), &sig)
            .is_ok());
    }

    #[test]
    fn test_one_time_consumed_once() {
        let mut id = Identity::generate();
        let first = id.peek_one_time().unwrap().id;

        assert!(id.take_one_time(first).is_ok());
        assert_eq!(id.take_one_time(first), Err(CryptoError::UnknownPreKey(first)));
    }

    #[test]
    fn test_replenish_assigns_fresh_ids() {
        let mut id = Identity::generate();
        let first = id.peek_one_time().unwrap().id;
        id.take_one_time(first).unwrap();

        id.replenish_one_time();
        assert_eq!(id.one_time.len(), ONE_TIME_POOL_SIZE);
        assert!(id.one_time.iter().all(|k| k.id != first));
    }

    #[test]
    fn test_persist_round_trip() {
        let id = Identity::generate();
        let message = b"persisted";
        let signature = id.sign(message);

        let json = serde_json::to_string(&id).unwrap();
        let restored: Identity = serde_json::from_str(&json).unwrap();

        assert_eq!(id.public_key().to_bytes(), restored.public_key().to_bytes());
        assert_eq!(id.registration_id(), restored.registration_id());
        assert_eq!(
            id.signed_pre_key_public(),
            restored.signed_pre_key_public()
        );
        assert!(restored.verify(message, &signature).is_ok());
    }

    #[test]
    fn test_public_key_hex() {
        let id = Identity::generate();
        let hex = id.public_key().to_hex();
        let restored = PublicKey::from_hex(&hex).unwrap();

        assert_eq!(restored, *id.public_key());
    }
}
