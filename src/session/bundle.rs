//! Pre-key bundles and handshake frames
//!
//! A bundle is the publishable bootstrap material a client consumes to
//! establish a ratchet session without interaction: the server identity,
//! its signed pre-key (with attestation), and at most one one-time
//! pre-key. Bundles travel base64-encoded inside the discovery document.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::{
    CryptoError, CryptoResult, ExchangePublicKey, Identity, IdentitySignature, PublicKey,
};

/// Publishable bootstrap material for one handshake
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Server's Ed25519 identity key
    pub identity_signing: PublicKey,
    /// Server's X25519 identity key
    pub identity_exchange: ExchangePublicKey,
    /// Id of the signed pre-key below
    pub signed_pre_key_id: u32,
    /// X25519 signed pre-key (public)
    pub signed_pre_key: ExchangePublicKey,
    /// Signature over the signed pre-key by the identity key
    pub signed_pre_key_signature: IdentitySignature,
    /// Optional one-time pre-key id (consumed on first use)
    pub one_time_id: Option<u32>,
    /// Optional one-time pre-key (public)
    pub one_time_pre_key: Option<ExchangePublicKey>,
    /// Registration id of the publishing identity
    pub registration_id: u32,
}

impl PreKeyBundle {
    /// Publish a bundle for `identity`, including its first unconsumed
    /// one-time pre-key when the pool is not empty
    pub fn publish(identity: &Identity) -> Self {
        let one_time = identity.peek_one_time();
        PreKeyBundle {
            identity_signing: *identity.public_key(),
            identity_exchange: identity.exchange_public(),
            signed_pre_key_id: identity.signed_pre_key_id(),
            signed_pre_key: identity.signed_pre_key_public(),
            signed_pre_key_signature: identity.signed_pre_key_signature(),
            one_time_id: one_time.map(|k| k.id),
            one_time_pre_key: one_time.map(|k| k.public_key()),
            registration_id: identity.registration_id(),
        }
    }

    /// Verify the signed pre-key attestation under the identity key
    pub fn verify(&self) -> CryptoResult<()> {
        self.identity_signing
            .verify(self.signed_pre_key.as_bytes(), &self.signed_pre_key_signature)
            .map_err(|_| CryptoError::InvalidPreKeySignature)
    }

    /// Encode for the discovery document
    pub fn to_base64(&self) -> String {
        let json = serde_json::to_vec(self).expect("bundle serialization cannot fail");
        BASE64.encode(json)
    }

    /// Decode from the discovery document
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let json = BASE64
            .decode(encoded.trim())
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        serde_json::from_slice(&json).map_err(|_| CryptoError::InvalidPublicKey)
    }
}

/// First plaintext frame of a connection, initiator to responder
///
/// Carries everything the responder needs to derive the same shared
/// secret: the initiator's identity, the handshake ephemeral, and the
/// ids of the pre-keys consumed from the bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeInit {
    /// Initiator's Ed25519 identity key
    pub identity_signing: PublicKey,
    /// Initiator's X25519 identity key
    pub identity_exchange: ExchangePublicKey,
    /// Handshake ephemeral (public)
    pub ephemeral: ExchangePublicKey,
    /// Signed pre-key the initiator used
    pub signed_pre_key_id: u32,
    /// One-time pre-key the initiator used, if any
    pub one_time_id: Option<u32>,
}

impl HandshakeInit {
    /// Serialize for network transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + 32 + 32 + 4 + 5);
        bytes.extend_from_slice(&self.identity_signing.to_bytes());
        bytes.extend_from_slice(self.identity_exchange.as_bytes());
        bytes.extend_from_slice(self.ephemeral.as_bytes());
        bytes.extend_from_slice(&self.signed_pre_key_id.to_le_bytes());
        match self.one_time_id {
            Some(id) => {
                bytes.push(1);
                bytes.extend_from_slice(&id.to_le_bytes());
            }
            None => bytes.push(0),
        }
        bytes
    }

    /// Deserialize from network data
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() < 32 + 32 + 32 + 4 + 1 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 101,
                actual: bytes.len(),
            });
        }

        let identity_signing = PublicKey::from_bytes(&bytes[0..32])?;
        let identity_exchange = ExchangePublicKey::from_bytes(&bytes[32..64])?;
        let ephemeral = ExchangePublicKey::from_bytes(&bytes[64..96])?;
        let signed_pre_key_id = u32::from_le_bytes(bytes[96..100].try_into().unwrap());

        let one_time_id = match bytes[100] {
            0 => None,
            1 => {
                if bytes.len() < 105 {
                    return Err(CryptoError::InvalidKeyLength {
                        expected: 105,
                        actual: bytes.len(),
                    });
                }
                Some(u32::from_le_bytes(bytes[101..105].try_into().unwrap()))
            }
            _ => return Err(CryptoError::InvalidPublicKey),
        };

        Ok(HandshakeInit {
            identity_signing,
            identity_exchange,
            ephemeral,
            signed_pre_key_id,
            one_time_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_verifies() {
        let identity = Identity::generate();
        let bundle = PreKeyBundle::publish(&identity);
        assert!(bundle.verify().is_ok());
        assert!(bundle.one_time_id.is_some());
    }

    #[test]
    fn test_tampered_bundle_fails() {
        let identity = Identity::generate();
        let mut bundle = PreKeyBundle::publish(&identity);
        let mut bytes = bundle.signed_pre_key.to_bytes();
        bytes[0] ^= 0xFF;
        bundle.signed_pre_key = ExchangePublicKey::from(bytes);

        assert_eq!(bundle.verify(), Err(CryptoError::InvalidPreKeySignature));
    }

    #[test]
    fn test_foreign_identity_fails() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let mut bundle = PreKeyBundle::publish(&identity);
        bundle.identity_signing = *other.public_key();

        assert!(bundle.verify().is_err());
    }

    #[test]
    fn test_base64_round_trip() {
        let identity = Identity::generate();
        let bundle = PreKeyBundle::publish(&identity);

        let encoded = bundle.to_base64();
        let restored = PreKeyBundle::from_base64(&encoded).unwrap();

        assert_eq!(restored.identity_signing, bundle.identity_signing);
        assert_eq!(restored.signed_pre_key, bundle.signed_pre_key);
        assert_eq!(restored.one_time_id, bundle.one_time_id);
        assert!(restored.verify().is_ok());
    }

    #[test]
    fn test_handshake_frame_round_trip() {
        let identity = Identity::generate();
        let init = HandshakeInit {
            identity_signing: *identity.public_key(),
            identity_exchange: identity.exchange_public(),
            ephemeral: crate::crypto::exchange::generate_ephemeral().public_key(),
            signed_pre_key_id: 7,
            one_time_id: Some(42),
        };

        let restored = HandshakeInit::from_bytes(&init.to_bytes()).unwrap();
        assert_eq!(restored, init);

        let no_one_time = HandshakeInit {
            one_time_id: None,
            ..init
        };
        let restored = HandshakeInit::from_bytes(&no_one_time.to_bytes()).unwrap();
        assert_eq!(restored, no_one_time);
    }

    #[test]
    fn test_truncated_handshake_frame_fails() {
        let bytes = vec![0u8; 50];
        assert!(HandshakeInit::from_bytes(&bytes).is_err());
    }
}
