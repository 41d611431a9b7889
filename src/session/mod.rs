//! Secure channel establishment and use
//!
//! Binds the pre-key handshake to the ratchet and to storage: a
//! [`SecureChannel`] seals and opens opaque frames, advancing the
//! ratchet under an exclusive borrow and persisting a snapshot before
//! the frame is released. A crash therefore never leaves the stored
//! state behind the state a peer has already observed.

mod bundle;

pub use bundle::{HandshakeInit, PreKeyBundle};

use std::sync::Arc;

use thiserror::Error;

use crate::crypto::{exchange, CryptoError, Identity, RemoteIdentity};
use crate::ratchet::Ratchet;
use crate::storage::{Storage, StorageError};

/// Errors raised while establishing or using a secure channel
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Handshake or frame cryptography failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Session state could not be persisted or loaded
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Initiate a session against a published bundle
///
/// Verifies the signed pre-key attestation, runs the pre-key agreement,
/// and returns the initiator ratchet together with the handshake frame
/// the responder needs. The caller pins `RemoteIdentity` from the bundle
/// on first success.
pub fn initiate(
    identity: &Identity,
    bundle: &PreKeyBundle,
) -> ChannelResult<(Ratchet, HandshakeInit)> {
    bundle.verify()?;

    let ephemeral = exchange::generate_ephemeral();
    let shared = exchange::agree_initiator(
        identity.secret_key_bytes(),
        &ephemeral,
        &bundle.identity_exchange,
        &bundle.signed_pre_key,
        bundle.one_time_pre_key.as_ref(),
    );

    let init = HandshakeInit {
        identity_signing: *identity.public_key(),
        identity_exchange: identity.exchange_public(),
        ephemeral: ephemeral.public_key(),
        signed_pre_key_id: bundle.signed_pre_key_id,
        one_time_id: bundle.one_time_id,
    };

    let ratchet = Ratchet::initialize_initiator(&shared, &bundle.signed_pre_key);
    Ok((ratchet, init))
}

/// Accept a handshake frame as the responder
///
/// Consumes the referenced one-time pre-key (the identity must be saved
/// by the caller afterwards) and returns the responder ratchet.
pub fn respond(identity: &mut Identity, init: &HandshakeInit) -> ChannelResult<Ratchet> {
    if init.signed_pre_key_id != identity.signed_pre_key_id() {
        return Err(CryptoError::UnknownPreKey(init.signed_pre_key_id).into());
    }

    let one_time_secret = match init.one_time_id {
        Some(id) => Some(identity.take_one_time(id)?),
        None => None,
    };

    let shared = exchange::agree_responder(
        identity.secret_key_bytes(),
        identity.signed_pre_key_secret(),
        one_time_secret.as_ref(),
        &init.identity_exchange,
        &init.ephemeral,
    );

    Ok(Ratchet::initialize_responder(
        &shared,
        identity.signed_pre_key_secret(),
    ))
}

/// Remote identity pinned from a bundle
pub fn pin_from_bundle(bundle: &PreKeyBundle) -> RemoteIdentity {
    RemoteIdentity {
        signing: bundle.identity_signing,
        exchange: bundle.identity_exchange,
    }
}

/// Remote identity pinned from a handshake frame
pub fn pin_from_handshake(init: &HandshakeInit) -> RemoteIdentity {
    RemoteIdentity {
        signing: init.identity_signing,
        exchange: init.identity_exchange,
    }
}

/// A live end-to-end channel with a peer
///
/// Encrypt and decrypt are serialized by the exclusive borrow; every
/// advance is persisted under the peer key before the frame leaves this
/// type.
pub struct SecureChannel {
    peer_key: String,
    ratchet: Ratchet,
    storage: Arc<dyn Storage>,
}

impl SecureChannel {
    /// Wrap a freshly established ratchet
    pub fn new(peer_key: impl Into<String>, ratchet: Ratchet, storage: Arc<dyn Storage>) -> Self {
        SecureChannel {
            peer_key: peer_key.into(),
            ratchet,
            storage,
        }
    }

    /// Resume a channel from a persisted session, if one exists
    pub async fn resume(
        peer_key: impl Into<String>,
        storage: Arc<dyn Storage>,
    ) -> ChannelResult<Option<Self>> {
        let peer_key = peer_key.into();
        match storage.load_session(&peer_key).await? {
            Some(state) => {
                let ratchet = Ratchet::restore(&state)?;
                Ok(Some(SecureChannel {
                    peer_key,
                    ratchet,
                    storage,
                }))
            }
            None => Ok(None),
        }
    }

    /// Encrypt a frame and persist the advanced state
    pub async fn seal(&mut self, plaintext: &[u8]) -> ChannelResult<Vec<u8>> {
        let frame = self.ratchet.encrypt(plaintext)?;
        self.persist().await?;
        Ok(frame)
    }

    /// Decrypt a frame and persist the advanced state
    pub async fn open(&mut self, frame: &[u8]) -> ChannelResult<Vec<u8>> {
        let plaintext = self.ratchet.decrypt(frame)?;
        self.persist().await?;
        Ok(plaintext)
    }

    /// Key this channel persists under
    pub fn peer_key(&self) -> &str {
        &self.peer_key
    }

    async fn persist(&self) -> ChannelResult<()> {
        self.storage
            .save_session(&self.peer_key, &self.ratchet.snapshot())
            .await?;
        Ok(())
    }
}
