//! Double Ratchet session primitive
//!
//! Forward-secret, post-compromise-secure encryption of opaque frames.
//! Each frame is sealed under a key derived from a chain key, and the
//! chains themselves are replaced on every Diffie-Hellman ratchet step.
//! Out-of-order delivery is tolerated within a bounded skipped-message
//! window.
//!
//! A frame on the wire is a fixed 48-byte header followed by the
//! ciphertext and tag. The AEAD nonce never travels: both the cipher
//! key and the nonce are derived from the per-message key, which is
//! used exactly once, and the header is bound as associated data.
//!
//! State advances on every encrypt/decrypt; callers that persist
//! sessions snapshot the state after each use and must never overwrite
//! a newer snapshot with an older one (see [`Ratchet::version`]).

use std::collections::HashMap;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::crypto::{exchange, kdf, CryptoError, CryptoResult, ExchangePublicKey, SharedSecret};

/// Size of chain keys
const KEY_SIZE: usize = 32;

/// Encoded size of a frame header on the wire
const HEADER_SIZE: usize = 8 + 8 + 32;

/// Poly1305 tag size
const TAG_SIZE: usize = 16;

/// Upper bound on message keys cached for out-of-order delivery
const MAX_SKIP: u64 = 1000;

/// Per-frame header, bound to the ciphertext as associated data
#[derive(Clone, Debug)]
pub struct FrameHeader {
    /// Frame number in the sender's current chain
    pub counter: u64,
    /// Length of the sender's previous chain (for ratchet steps)
    pub previous: u64,
    /// Sender's current ratchet public key
    pub ratchet_key: ExchangePublicKey,
}

impl FrameHeader {
    /// Encode to the fixed wire layout: counter, previous, ratchet key
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.counter.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.previous.to_be_bytes());
        bytes[16..48].copy_from_slice(self.ratchet_key.as_bytes());
        bytes
    }

    /// Decode from exactly [`HEADER_SIZE`] bytes
    pub fn decode(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: &[u8; HEADER_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(FrameHeader {
            counter: u64::from_be_bytes(bytes[0..8].try_into().expect("sized slice")),
            previous: u64::from_be_bytes(bytes[8..16].try_into().expect("sized slice")),
            ratchet_key: ExchangePublicKey::from_bytes(&bytes[16..48])?,
        })
    }
}

/// Seal a frame body under a one-use message key
///
/// Key and nonce are both derived from the message key; since a message
/// key encrypts exactly one frame, the pair can never repeat.
fn seal_frame(message_key: &[u8; KEY_SIZE], header: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let key = kdf::derive("frame-key", message_key);
    let nonce = kdf::derive("frame-nonce", message_key);

    ChaCha20Poly1305::new((&key).into())
        .encrypt(
            Nonce::from_slice(&nonce[..12]),
            Payload {
                msg: plaintext,
                aad: header,
            },
        )
        .expect("sealing cannot fail with a sized key")
}

/// Open a frame body; fails on any tag or header mismatch
fn open_frame(
    message_key: &[u8; KEY_SIZE],
    header: &[u8],
    ciphertext: &[u8],
) -> CryptoResult<Vec<u8>> {
    let key = kdf::derive("frame-key", message_key);
    let nonce = kdf::derive("frame-nonce", message_key);

    ChaCha20Poly1305::new((&key).into())
        .decrypt(
            Nonce::from_slice(&nonce[..12]),
            Payload {
                msg: ciphertext,
                aad: header,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Root KDF: (root, dh) -> (root', chain)
fn root_step(root: &[u8; KEY_SIZE], dh: &SharedSecret) -> ([u8; 32], [u8; 32]) {
    let parts: [&[u8]; 2] = [root, dh.as_bytes()];
    (
        kdf::absorb("root-ratchet", &parts),
        kdf::absorb("chain-ratchet", &parts),
    )
}

/// Chain KDF: chain -> (chain', message_key)
fn chain_step(chain: &[u8; KEY_SIZE]) -> ([u8; 32], [u8; 32]) {
    (
        kdf::derive("chain-advance", chain),
        kdf::derive("message-key", chain),
    )
}

/// Double Ratchet state machine
#[derive(ZeroizeOnDrop)]
pub struct Ratchet {
    /// Root key, replaced on every DH ratchet step
    root_key: [u8; KEY_SIZE],

    /// Our current ratchet keypair
    dh_secret: [u8; 32],
    #[zeroize(skip)]
    dh_public: ExchangePublicKey,

    /// Peer's current ratchet public key; None until the first frame arrives
    #[zeroize(skip)]
    remote_dh: Option<ExchangePublicKey>,

    /// Sending chain key; None on the responder side until it has
    /// received a frame and ratcheted
    sending_chain: Option<[u8; KEY_SIZE]>,

    /// Receiving chain key
    receiving_chain: Option<[u8; KEY_SIZE]>,

    #[zeroize(skip)]
    send_counter: u64,
    #[zeroize(skip)]
    recv_counter: u64,
    #[zeroize(skip)]
    previous_send_counter: u64,

    /// Skipped message keys for out-of-order delivery,
    /// keyed by (sender ratchet public, counter)
    #[zeroize(skip)]
    skipped_keys: HashMap<([u8; 32], u64), [u8; KEY_SIZE]>,

    /// Random marker distinguishing handshake lineages; a new session
    /// may overwrite an old one's snapshots regardless of version
    #[zeroize(skip)]
    epoch: String,

    /// Monotonic state version; advances on every encrypt/decrypt
    #[zeroize(skip)]
    version: u64,
}

impl std::fmt::Debug for Ratchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ratchet")
            .field("root_key", &"<redacted>")
            .field("dh_secret", &"<redacted>")
            .field("dh_public", &self.dh_public)
            .field("remote_dh", &self.remote_dh)
            .field("sending_chain", &self.sending_chain.as_ref().map(|_| "<redacted>"))
            .field("receiving_chain", &self.receiving_chain.as_ref().map(|_| "<redacted>"))
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .field("previous_send_counter", &self.previous_send_counter)
            .field("skipped_keys_count", &self.skipped_keys.len())
            .field("epoch", &self.epoch)
            .field("version", &self.version)
            .finish()
    }
}

impl Ratchet {
    /// Initialize as the handshake initiator
    ///
    /// `their_pre_key` is the responder's signed pre-key from the bundle;
    /// it acts as the responder's initial ratchet key, so a sending chain
    /// exists immediately and the first frame can be encrypted without a
    /// round trip.
    pub fn initialize_initiator(
        shared_secret: &SharedSecret,
        their_pre_key: &ExchangePublicKey,
    ) -> Self {
        let root = kdf::derive("keyport-root-v1", shared_secret.as_bytes());

        let keypair = exchange::generate_ephemeral();
        let dh_public = keypair.public_key();
        let dh_out = keypair.diffie_hellman(their_pre_key);
        let (root_key, sending_chain) = root_step(&root, &dh_out);

        Ratchet {
            root_key,
            dh_secret: keypair.secret_bytes(),
            dh_public,
            remote_dh: Some(*their_pre_key),
            sending_chain: Some(sending_chain),
            receiving_chain: None,
            send_counter: 0,
            recv_counter: 0,
            previous_send_counter: 0,
            skipped_keys: HashMap::new(),
            epoch: fresh_epoch(),
            version: 0,
        }
    }

    /// Initialize as the handshake responder
    ///
    /// The responder's initial ratchet keypair is its signed pre-key; the
    /// receiving chain is established when the initiator's first frame
    /// triggers the DH ratchet.
    pub fn initialize_responder(
        shared_secret: &SharedSecret,
        pre_key_secret: &[u8; 32],
    ) -> Self {
        let root = kdf::derive("keyport-root-v1", shared_secret.as_bytes());

        Ratchet {
            root_key: root,
            dh_secret: *pre_key_secret,
            dh_public: exchange::public_from_secret(pre_key_secret),
            remote_dh: None,
            sending_chain: None,
            receiving_chain: None,
            send_counter: 0,
            recv_counter: 0,
            previous_send_counter: 0,
            skipped_keys: HashMap::new(),
            epoch: fresh_epoch(),
            version: 0,
        }
    }

    /// Encrypt a frame
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let chain = self.sending_chain.ok_or(CryptoError::SendingChainNotReady)?;
        let (next_chain, message_key) = chain_step(&chain);
        self.sending_chain = Some(next_chain);

        let header = FrameHeader {
            counter: self.send_counter,
            previous: self.previous_send_counter,
            ratchet_key: self.dh_public,
        }
        .encode();

        let ciphertext = seal_frame(&message_key, &header, plaintext);

        self.send_counter += 1;
        self.version += 1;

        let mut frame = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Decrypt a frame
    pub fn decrypt(&mut self, frame: &[u8]) -> CryptoResult<Vec<u8>> {
        if frame.len() < HEADER_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let (header_bytes, ciphertext) = frame.split_at(HEADER_SIZE);
        let header = FrameHeader::decode(header_bytes)?;

        // A frame from a chain we already passed: use its cached key
        if let Some(message_key) = self
            .skipped_keys
            .remove(&(header.ratchet_key.to_bytes(), header.counter))
        {
            let plaintext = open_frame(&message_key, header_bytes, ciphertext)?;
            self.version += 1;
            return Ok(plaintext);
        }

        // New ratchet key from the peer: close out the old receiving chain
        // and perform the DH ratchet step
        if self.remote_dh != Some(header.ratchet_key) {
            self.skip_message_keys(header.previous)?;
            self.dh_ratchet(&header.ratchet_key);
        }

        self.skip_message_keys(header.counter)?;

        let chain = self.receiving_chain.ok_or(CryptoError::DecryptionFailed)?;
        let (next_chain, message_key) = chain_step(&chain);

        let plaintext = open_frame(&message_key, header_bytes, ciphertext)?;

        // Only commit state once the tag has verified
        self.receiving_chain = Some(next_chain);
        self.recv_counter = header.counter + 1;
        self.version += 1;
        Ok(plaintext)
    }

    /// Monotonic state version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Our current ratchet public key
    pub fn our_ephemeral(&self) -> &ExchangePublicKey {
        &self.dh_public
    }

    /// Perform a DH ratchet step on receiving a new peer ratchet key
    fn dh_ratchet(&mut self, new_remote: &ExchangePublicKey) {
        self.previous_send_counter = self.send_counter;
        self.send_counter = 0;
        self.recv_counter = 0;
        self.remote_dh = Some(*new_remote);

        // Receiving chain: our current keypair against their new key
        let dh_out = exchange::static_diffie_hellman(&self.dh_secret, new_remote);
        let (root_key, receiving_chain) = root_step(&self.root_key, &dh_out);
        self.root_key = root_key;
        self.receiving_chain = Some(receiving_chain);

        // Sending chain: a fresh keypair against their new key
        let keypair = exchange::generate_ephemeral();
        self.dh_public = keypair.public_key();
        let dh_out = keypair.diffie_hellman(new_remote);
        let (root_key, sending_chain) = root_step(&self.root_key, &dh_out);
        self.root_key = root_key;
        self.sending_chain = Some(sending_chain);
        self.dh_secret = keypair.secret_bytes();
    }

    /// Derive and cache message keys up to (not including) `until`
    fn skip_message_keys(&mut self, until: u64) -> CryptoResult<()> {
        if until > self.recv_counter + MAX_SKIP {
            return Err(CryptoError::KeyDerivationFailed(
                "Too many skipped messages".to_string(),
            ));
        }

        let Some(remote) = self.remote_dh else {
            return Ok(());
        };
        let Some(mut chain) = self.receiving_chain else {
            return Ok(());
        };

        while self.recv_counter < until {
            let (next_chain, message_key) = chain_step(&chain);
            self.skipped_keys
                .insert((remote.to_bytes(), self.recv_counter), message_key);
            chain = next_chain;
            self.recv_counter += 1;
        }
        self.receiving_chain = Some(chain);

        Ok(())
    }

    /// Capture the full state for persistence
    pub fn snapshot(&self) -> RatchetState {
        RatchetState {
            root_key: hex::encode(self.root_key),
            dh_secret: hex::encode(self.dh_secret),
            remote_dh: self.remote_dh.map(|k| k.to_hex()),
            sending_chain: self.sending_chain.map(hex::encode),
            receiving_chain: self.receiving_chain.map(hex::encode),
            send_counter: self.send_counter,
            recv_counter: self.recv_counter,
            previous_send_counter: self.previous_send_counter,
            skipped_keys: self
                .skipped_keys
                .iter()
                .map(|((ratchet_key, counter), key)| SkippedKeyRecord {
                    ratchet_key: hex::encode(ratchet_key),
                    counter: *counter,
                    key: hex::encode(key),
                })
                .collect(),
            epoch: self.epoch.clone(),
            version: self.version,
        }
    }

    /// Rebuild a ratchet from a persisted snapshot
    pub fn restore(state: &RatchetState) -> CryptoResult<Self> {
        let dh_secret = decode_key(&state.dh_secret)?;

        let mut skipped_keys = HashMap::with_capacity(state.skipped_keys.len());
        for record in &state.skipped_keys {
            skipped_keys.insert(
                (decode_key(&record.ratchet_key)?, record.counter),
                decode_key(&record.key)?,
            );
        }

        Ok(Ratchet {
            root_key: decode_key(&state.root_key)?,
            dh_public: exchange::public_from_secret(&dh_secret),
            dh_secret,
            remote_dh: match &state.remote_dh {
                Some(s) => Some(ExchangePublicKey::from_hex(s)?),
                None => None,
            },
            sending_chain: state.sending_chain.as_deref().map(decode_key).transpose()?,
            receiving_chain: state
                .receiving_chain
                .as_deref()
                .map(decode_key)
                .transpose()?,
            send_counter: state.send_counter,
            recv_counter: state.recv_counter,
            previous_send_counter: state.previous_send_counter,
            skipped_keys,
            epoch: state.epoch.clone(),
            version: state.version,
        })
    }
}

/// Persistable ratchet state
///
/// Secrets are hex-encoded; the containing store is responsible for
/// protecting the blob at rest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: String,
    dh_secret: String,
    remote_dh: Option<String>,
    sending_chain: Option<String>,
    receiving_chain: Option<String>,
    send_counter: u64,
    recv_counter: u64,
    previous_send_counter: u64,
    skipped_keys: Vec<SkippedKeyRecord>,
    /// Handshake lineage marker; versions only order within one epoch
    pub epoch: String,
    /// Monotonic version used by stores to refuse stale writes
    pub version: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SkippedKeyRecord {
    ratchet_key: String,
    counter: u64,
    key: String,
}

fn decode_key(s: &str) -> CryptoResult<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidSecretKey)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidSecretKey)
}

fn fresh_epoch() -> String {
    hex::encode(crate::crypto::random_bytes::<8>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    fn pair() -> (Ratchet, Ratchet) {
        let secret = random_bytes::<32>();
        let shared = SharedSecret::from_bytes(secret);
        let pre_key = random_bytes::<32>();

        let alice =
            Ratchet::initialize_initiator(&shared, &exchange::public_from_secret(&pre_key));
        let bob = Ratchet::initialize_responder(&shared, &pre_key);
        (alice, bob)
    }

    #[test]
    fn test_first_frame() {
        let (mut alice, mut bob) = pair();

        let ciphertext = alice.encrypt(b"hello").unwrap();
        assert_eq!(bob.decrypt(&ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn test_frame_layout() {
        let (mut alice, _bob) = pair();

        let frame = alice.encrypt(b"x").unwrap();
        // header || ciphertext || tag, no separate nonce
        assert_eq!(frame.len(), HEADER_SIZE + 1 + TAG_SIZE);

        let header = FrameHeader::decode(&frame[..HEADER_SIZE]).unwrap();
        assert_eq!(header.counter, 0);
        assert_eq!(header.ratchet_key, *alice.our_ephemeral());
    }

    #[test]
    fn test_header_round_trip() {
        let header = FrameHeader {
            counter: 12345,
            previous: 100,
            ratchet_key: ExchangePublicKey::from([42u8; 32]),
        };

        let restored = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(restored.counter, header.counter);
        assert_eq!(restored.previous, header.previous);
        assert_eq!(restored.ratchet_key, header.ratchet_key);

        assert!(FrameHeader::decode(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_responder_cannot_send_first() {
        let (_alice, mut bob) = pair();
        assert_eq!(
            bob.encrypt(b"early").unwrap_err(),
            CryptoError::SendingChainNotReady
        );
    }

    #[test]
    fn test_ping_pong() {
        let (mut alice, mut bob) = pair();

        for i in 0..10 {
            let msg = format!("ping {}", i);
            let ct = alice.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&ct).unwrap(), msg.as_bytes());

            let msg = format!("pong {}", i);
            let ct = bob.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(alice.decrypt(&ct).unwrap(), msg.as_bytes());
        }
    }

    #[test]
    fn test_many_in_one_direction() {
        let (mut alice, mut bob) = pair();

        for i in 0..25 {
            let msg = format!("frame {}", i);
            let ct = alice.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&ct).unwrap(), msg.as_bytes());
        }
    }

    #[test]
    fn test_out_of_order_within_chain() {
        let (mut alice, mut bob) = pair();

        let ct1 = alice.encrypt(b"one").unwrap();
        let ct2 = alice.encrypt(b"two").unwrap();
        let ct3 = alice.encrypt(b"three").unwrap();

        assert_eq!(bob.decrypt(&ct3).unwrap(), b"three");
        assert_eq!(bob.decrypt(&ct1).unwrap(), b"one");
        assert_eq!(bob.decrypt(&ct2).unwrap(), b"two");
    }

    #[test]
    fn test_out_of_order_across_ratchet_step() {
        let (mut alice, mut bob) = pair();

        let ct1 = alice.encrypt(b"before step 1").unwrap();
        let late = alice.encrypt(b"before step 2").unwrap();
        assert_eq!(bob.decrypt(&ct1).unwrap(), b"before step 1");

        // Bob replies, forcing a ratchet step on Alice's side
        let reply = bob.encrypt(b"reply").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"reply");

        // A frame from Alice's new chain overtakes the old one
        let fresh = alice.encrypt(b"after step").unwrap();
        assert_eq!(bob.decrypt(&fresh).unwrap(), b"after step");
        assert_eq!(bob.decrypt(&late).unwrap(), b"before step 2");
    }

    #[test]
    fn test_wrong_secret_fails() {
        let shared1 = SharedSecret::from_bytes(random_bytes::<32>());
        let shared2 = SharedSecret::from_bytes(random_bytes::<32>());
        let pre_key = random_bytes::<32>();

        let mut alice =
            Ratchet::initialize_initiator(&shared1, &exchange::public_from_secret(&pre_key));
        let mut bob = Ratchet::initialize_responder(&shared2, &pre_key);

        let ct = alice.encrypt(b"secret").unwrap();
        assert!(bob.decrypt(&ct).is_err());
    }

    #[test]
    fn test_tampered_frame_fails() {
        let (mut alice, mut bob) = pair();

        let mut ct = alice.encrypt(b"secret").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;

        assert!(bob.decrypt(&ct).is_err());
    }

    #[test]
    fn test_tampered_header_fails() {
        let (mut alice, mut bob) = pair();

        // Flip a counter bit; the header rides as associated data
        let mut ct = alice.encrypt(b"secret").unwrap();
        ct[7] ^= 0x01;

        assert!(bob.decrypt(&ct).is_err());
    }

    #[test]
    fn test_truncated_frame_fails() {
        let (mut alice, mut bob) = pair();

        let ct = alice.encrypt(b"secret").unwrap();
        assert!(bob.decrypt(&ct[..HEADER_SIZE + 4]).is_err());
    }

    #[test]
    fn test_too_many_skipped() {
        let (mut alice, mut bob) = pair();

        // Advance alice far past the skip bound without delivering
        for _ in 0..(MAX_SKIP + 2) {
            alice.encrypt(b"dropped").unwrap();
        }
        let ct = alice.encrypt(b"late").unwrap();

        assert!(matches!(
            bob.decrypt(&ct),
            Err(CryptoError::KeyDerivationFailed(_))
        ));
    }

    #[test]
    fn test_version_advances() {
        let (mut alice, mut bob) = pair();
        assert_eq!(alice.version(), 0);

        let ct = alice.encrypt(b"x").unwrap();
        assert_eq!(alice.version(), 1);

        bob.decrypt(&ct).unwrap();
        assert_eq!(bob.version(), 1);
    }

    #[test]
    fn test_snapshot_restore_continues_conversation() {
        let (mut alice, mut bob) = pair();

        let ct = alice.encrypt(b"first").unwrap();
        bob.decrypt(&ct).unwrap();
        let reply = bob.encrypt(b"ack").unwrap();
        alice.decrypt(&reply).unwrap();

        // Both sides restart from persisted state
        let mut alice = Ratchet::restore(&alice.snapshot()).unwrap();
        let mut bob = Ratchet::restore(&bob.snapshot()).unwrap();

        let ct = alice.encrypt(b"second").unwrap();
        assert_eq!(bob.decrypt(&ct).unwrap(), b"second");
        let reply = bob.encrypt(b"ack 2").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"ack 2");
    }

    #[test]
    fn test_snapshot_serializes() {
        let (mut alice, _bob) = pair();
        alice.encrypt(b"x").unwrap();

        let json = serde_json::to_string(&alice.snapshot()).unwrap();
        let state: RatchetState = serde_json::from_str(&json).unwrap();
        let restored = Ratchet::restore(&state).unwrap();
        assert_eq!(restored.version(), alice.version());
    }
}
