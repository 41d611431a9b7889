//! Cryptographic primitives for the gateway
//!
//! - `identity`: Ed25519 identity with pre-key material
//! - `exchange`: X25519 ECDH and the pre-key agreement
//! - `kdf`: labelled BLAKE3 key derivation

pub mod error;
pub mod exchange;
pub mod identity;
pub mod kdf;

// Re-export commonly used types
pub use error::{CryptoError, CryptoResult};
pub use exchange::{EphemeralKeypair, ExchangePublicKey, SharedSecret};
pub use identity::{Identity, IdentitySignature, OneTimePreKey, PublicKey, RemoteIdentity};

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::rngs::OsRng;
    use rand::RngCore;
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_pre_key_agreement_feeds_kdf() {
        // Initiator and responder agree on a secret via pre-keys
        let initiator = Identity::generate();
        let mut responder = Identity::generate();
        let ephemeral = exchange::generate_ephemeral();
        let one_time_id = responder.peek_one_time().unwrap().id;
        let one_time_public = responder.peek_one_time().unwrap().public_key();

        let init_shared = exchange::agree_initiator(
            initiator.secret_key_bytes(),
            &ephemeral,
            &responder.exchange_public(),
            &responder.signed_pre_key_public(),
            Some(&one_time_public),
        );

        let one_time_secret = responder.take_one_time(one_time_id).unwrap();
        let resp_shared = exchange::agree_responder(
            responder.secret_key_bytes(),
            responder.signed_pre_key_secret(),
            Some(&one_time_secret),
            &initiator.exchange_public(),
            &ephemeral.public_key(),
        );

        assert_eq!(init_shared.as_bytes(), resp_shared.as_bytes());

        // Both sides reach the same subkeys, and labels keep them apart
        let send = kdf::derive("test-sending", init_shared.as_bytes());
        assert_eq!(send, kdf::derive("test-sending", resp_shared.as_bytes()));
        assert_ne!(send, kdf::derive("test-receiving", init_shared.as_bytes()));
    }

    #[test]
    fn test_identity_and_signature_flow() {
        let id = Identity::generate();

        let document = b"pre-key attestation";
        let signature = id.sign(document);

        let public_key = *id.public_key();
        assert!(public_key.verify(document, &signature).is_ok());

        assert!(public_key.verify(b"something else", &signature).is_err());
    }

    #[test]
    fn test_random_bytes_distinct() {
        assert_ne!(random_bytes::<32>(), random_bytes::<32>());
    }
}
