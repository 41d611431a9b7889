//! Gateway client
//!
//! Correlated request/response over the secure channel: every send is
//! assigned a monotonically increasing action id, parked in a pending
//! map, and resumed when the matching result arrives. Unsolicited
//! events are fanned out to subscribers. Closing the channel rejects
//! every still-pending call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::crypto::{CryptoError, Identity};
use crate::proto::{
    self, tags, ActionEnvelope, Algorithm, CertFormat, CryptoHandle, Envelope, EventEnvelope,
    GeneratedKey, HandleKind, KeyDescriptor, KeyFormat, KeyUsage, Outcome, ProtoError,
    ProviderInfoResult, TokenEventPayload, UNAUTHENTICATED_ACTIONS,
};
use crate::server::{ServerInfo, DISCOVERY_PATH};
use crate::session::{self as channel, ChannelError, PreKeyBundle, SecureChannel};
use crate::storage::{Storage, StorageError};
use crate::transport::{Transport, TransportError, WebSocketTransport};

/// Client-side errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// The channel is not in a state that permits this action
    #[error("Socket connection is not open")]
    NotOpen,

    /// The channel closed while the request was outstanding
    #[error("Connection closed")]
    Closed,

    /// A local request deadline expired
    #[error("Request timed out")]
    Timeout,

    /// The server answered with an in-band error
    #[error("{0}")]
    Remote(String),

    /// The discovery document could not be fetched
    #[error("Cannot GET response")]
    Discovery,

    /// Handshake failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Ratchet or persistence failure
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Malformed reply payload
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Store failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Frame-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Client channel states, tracking the server's session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Ratchet established, login pending
    Open,
    /// Full action surface enabled
    Authorized,
    /// Terminal
    Closed,
}

/// Unsolicited notifications from the gateway
#[derive(Clone, Debug)]
pub enum GatewayEvent {
    /// Login succeeded; the session is now authorized
    Authorized,
    /// Provider hotplug
    Token(TokenEventPayload),
}

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Local deadline per request; None waits for the channel
    pub request_timeout: Option<Duration>,
    /// Logical key the gateway identity is pinned under
    pub remote_key: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            request_timeout: Some(Duration::from_secs(60)),
            remote_key: "0".to_string(),
        }
    }
}

type PendingMap = StdMutex<HashMap<String, oneshot::Sender<Result<Vec<u8>, ClientError>>>>;

struct ClientInner {
    pending: PendingMap,
    counter: AtomicU64,
    out_tx: mpsc::Sender<Envelope>,
    shutdown_tx: mpsc::Sender<()>,
    state: StdRwLock<ChannelState>,
    events_tx: broadcast::Sender<GatewayEvent>,
    config: ClientConfig,
}

impl ClientInner {
    fn set_state(&self, state: ChannelState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    fn state(&self) -> ChannelState {
        *self.state.read().expect("state lock poisoned")
    }

    /// Reject every still-pending call
    fn drain_pending(&self) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ClientError::Closed));
        }
    }
}

/// Fetch the discovery document from a gateway address
pub async fn fetch_server_info(addr: &str) -> Result<ServerInfo, ClientError> {
    let url = format!("http://{}{}", addr, DISCOVERY_PATH);
    let response = reqwest::get(&url).await.map_err(|_| ClientError::Discovery)?;
    if !response.status().is_success() {
        return Err(ClientError::Discovery);
    }
    response.json().await.map_err(|_| ClientError::Discovery)
}

/// A connected gateway client
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Discover, handshake, and connect to a gateway at `host:port`
    pub async fn connect(
        addr: &str,
        storage: Arc<dyn Storage>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let info = fetch_server_info(addr).await?;
        let bundle = PreKeyBundle::from_base64(&info.pre_key)?;
        let transport = WebSocketTransport::connect(&format!("ws://{}", addr)).await?;
        Self::over_transport(transport, &bundle, storage, config).await
    }

    /// Handshake and run over an already-established transport
    pub async fn over_transport<T: Transport + 'static>(
        mut transport: T,
        bundle: &PreKeyBundle,
        storage: Arc<dyn Storage>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let identity = match storage.load_identity().await? {
            Some(identity) => identity,
            None => {
                let identity = Identity::generate();
                storage.save_identity(&identity).await?;
                identity
            }
        };

        let (ratchet, init) = channel::initiate(&identity, bundle)?;
        storage
            .save_remote_identity(&config.remote_key, &channel::pin_from_bundle(bundle))
            .await?;

        transport.send(&init.to_bytes()).await?;
        let secure = SecureChannel::new(
            format!("gateway-{}", config.remote_key),
            ratchet,
            storage.clone(),
        );

        let (out_tx, out_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (events_tx, _) = broadcast::channel(16);

        let inner = Arc::new(ClientInner {
            pending: StdMutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            out_tx,
            shutdown_tx,
            state: StdRwLock::new(ChannelState::Open),
            events_tx,
            config,
        });

        tokio::spawn(run_loop(
            inner.clone(),
            Box::new(transport) as Box<dyn Transport>,
            secure,
            out_rx,
            shutdown_rx,
        ));

        Ok(Client { inner })
    }

    /// Current channel state
    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Subscribe to unsolicited gateway events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Close the channel; every pending call is rejected
    pub async fn close(&self) {
        self.inner.set_state(ChannelState::Closed);
        let _ = self.inner.shutdown_tx.send(()).await;
        self.inner.drain_pending();
    }

    /// Send one action and await its correlated result
    pub async fn send(&self, action: &str, payload: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let permitted = match self.inner.state() {
            ChannelState::Authorized => true,
            ChannelState::Open => UNAUTHENTICATED_ACTIONS.contains(&action),
            ChannelState::Closed => false,
        };
        if !permitted {
            return Err(ClientError::NotOpen);
        }

        let action_id = self
            .inner
            .counter
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let (result_tx, result_rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(action_id.clone(), result_tx);

        let envelope = Envelope::Action(ActionEnvelope {
            action: action.to_string(),
            action_id: action_id.clone(),
            payload,
        });

        if self.inner.out_tx.send(envelope).await.is_err() {
            self.inner
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&action_id);
            return Err(ClientError::NotOpen);
        }

        let received = match self.inner.config.request_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, result_rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Local deadline only; nothing is sent on the wire
                    self.inner
                        .pending
                        .lock()
                        .expect("pending lock poisoned")
                        .remove(&action_id);
                    return Err(ClientError::Timeout);
                }
            },
            None => result_rx.await,
        };

        received.map_err(|_| ClientError::Closed)?
    }

    // -----------------------------------------------------------------
    // Typed wrappers
    // -----------------------------------------------------------------

    /// Static gateway and provider info
    pub async fn provider_info(&self) -> Result<ProviderInfoResult, ClientError> {
        let data = self.send(tags::PROVIDER_INFO, Vec::new()).await?;
        Ok(ProviderInfoResult::decode(&data)?)
    }

    /// Provider existence check
    pub async fn get_crypto(&self, provider_id: &str) -> Result<(), ClientError> {
        self.send(
            tags::PROVIDER_GET_CRYPTO,
            provider_request(provider_id),
        )
        .await?;
        Ok(())
    }

    /// Whether the provider is logged in
    pub async fn is_logged_in(&self, provider_id: &str) -> Result<bool, ClientError> {
        let data = self
            .send(tags::IS_LOGGED_IN, provider_request(provider_id))
            .await?;
        Ok(proto::decode_bool(&data)?)
    }

    /// Log the provider in; resolves once the session is authorized
    pub async fn login(&self, provider_id: &str) -> Result<(), ClientError> {
        self.send(tags::LOGIN, provider_request(provider_id)).await?;
        self.inner.set_state(ChannelState::Authorized);
        Ok(())
    }

    /// Hash `data`
    pub async fn digest(
        &self,
        provider_id: &str,
        algorithm: Algorithm,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, ClientError> {
        let request = proto::DigestRequest {
            provider_id: provider_id.to_string(),
            algorithm,
            data,
        };
        self.send(tags::DIGEST, request.encode()).await
    }

    /// Generate a key or pair
    pub async fn generate_key(
        &self,
        provider_id: &str,
        algorithm: Algorithm,
        extractable: bool,
        usages: Vec<KeyUsage>,
    ) -> Result<GeneratedKey, ClientError> {
        let request = proto::GenerateKeyRequest {
            provider_id: provider_id.to_string(),
            algorithm,
            extractable,
            usages,
        };
        let data = self.send(tags::GENERATE_KEY, request.encode()).await?;
        Ok(GeneratedKey::decode(&data)?)
    }

    /// Sign `data` with a held key
    pub async fn sign(
        &self,
        provider_id: &str,
        algorithm: Algorithm,
        key: CryptoHandle,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, ClientError> {
        let request = proto::SignRequest {
            provider_id: provider_id.to_string(),
            algorithm,
            key,
            data,
        };
        self.send(tags::SIGN, request.encode()).await
    }

    /// Verify a signature with a held key
    pub async fn verify(
        &self,
        provider_id: &str,
        algorithm: Algorithm,
        key: CryptoHandle,
        signature: Vec<u8>,
        data: Vec<u8>,
    ) -> Result<bool, ClientError> {
        let request = proto::VerifyRequest {
            provider_id: provider_id.to_string(),
            algorithm,
            key,
            signature,
            data,
        };
        let data = self.send(tags::VERIFY, request.encode()).await?;
        Ok(proto::decode_bool(&data)?)
    }

    /// Encrypt `data` with a held key
    pub async fn encrypt(
        &self,
        provider_id: &str,
        algorithm: Algorithm,
        key: CryptoHandle,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, ClientError> {
        let request = proto::CipherRequest {
            provider_id: provider_id.to_string(),
            algorithm,
            key,
            data,
        };
        self.send(tags::ENCRYPT, request.encode()).await
    }

    /// Decrypt `data` with a held key
    pub async fn decrypt(
        &self,
        provider_id: &str,
        algorithm: Algorithm,
        key: CryptoHandle,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, ClientError> {
        let request = proto::CipherRequest {
            provider_id: provider_id.to_string(),
            algorithm,
            key,
            data,
        };
        self.send(tags::DECRYPT, request.encode()).await
    }

    /// Derive raw bits; the peer public rides in `algorithm.public`
    pub async fn derive_bits(
        &self,
        provider_id: &str,
        algorithm: Algorithm,
        key: CryptoHandle,
        length: u32,
    ) -> Result<Vec<u8>, ClientError> {
        let request = proto::DeriveBitsRequest {
            provider_id: provider_id.to_string(),
            algorithm,
            key,
            length,
        };
        self.send(tags::DERIVE_BITS, request.encode()).await
    }

    /// Derive a new held key
    pub async fn derive_key(
        &self,
        provider_id: &str,
        algorithm: Algorithm,
        key: CryptoHandle,
        derived_algorithm: Algorithm,
        extractable: bool,
        usages: Vec<KeyUsage>,
    ) -> Result<KeyDescriptor, ClientError> {
        let request = proto::DeriveKeyRequest {
            provider_id: provider_id.to_string(),
            algorithm,
            key,
            derived_algorithm,
            extractable,
            usages,
        };
        let data = self.send(tags::DERIVE_KEY, request.encode()).await?;
        Ok(KeyDescriptor::from_bytes(&data)?)
    }

    /// Import key material
    pub async fn import_key(
        &self,
        provider_id: &str,
        format: KeyFormat,
        data: Vec<u8>,
        algorithm: Algorithm,
        extractable: bool,
        usages: Vec<KeyUsage>,
    ) -> Result<KeyDescriptor, ClientError> {
        let request = proto::ImportKeyRequest {
            provider_id: provider_id.to_string(),
            format,
            data,
            algorithm,
            extractable,
            usages,
        };
        let data = self.send(tags::IMPORT_KEY, request.encode()).await?;
        Ok(KeyDescriptor::from_bytes(&data)?)
    }

    /// Export a held key
    pub async fn export_key(
        &self,
        provider_id: &str,
        format: KeyFormat,
        key: CryptoHandle,
    ) -> Result<Vec<u8>, ClientError> {
        let request = proto::ExportKeyRequest {
            provider_id: provider_id.to_string(),
            format,
            key,
        };
        self.send(tags::EXPORT_KEY, request.encode()).await
    }

    /// Wrap a held key under another
    pub async fn wrap_key(
        &self,
        provider_id: &str,
        format: KeyFormat,
        key: CryptoHandle,
        wrapping_key: CryptoHandle,
        algorithm: Algorithm,
    ) -> Result<Vec<u8>, ClientError> {
        let request = proto::WrapKeyRequest {
            provider_id: provider_id.to_string(),
            format,
            key,
            wrapping_key,
            algorithm,
        };
        self.send(tags::WRAP_KEY, request.encode()).await
    }

    /// Unwrap bytes into a new held key
    #[allow(clippy::too_many_arguments)]
    pub async fn unwrap_key(
        &self,
        provider_id: &str,
        format: KeyFormat,
        data: Vec<u8>,
        unwrapping_key: CryptoHandle,
        unwrap_algorithm: Algorithm,
        unwrapped_algorithm: Algorithm,
        extractable: bool,
        usages: Vec<KeyUsage>,
    ) -> Result<KeyDescriptor, ClientError> {
        let request = proto::UnwrapKeyRequest {
            provider_id: provider_id.to_string(),
            format,
            data,
            unwrapping_key,
            unwrap_algorithm,
            unwrapped_algorithm,
            extractable,
            usages,
        };
        let data = self.send(tags::UNWRAP_KEY, request.encode()).await?;
        Ok(KeyDescriptor::from_bytes(&data)?)
    }

    /// Fetch a stored key by index
    pub async fn key_storage_get(
        &self,
        provider_id: &str,
        index: &str,
        algorithm: Option<Algorithm>,
        usages: Option<Vec<KeyUsage>>,
    ) -> Result<KeyDescriptor, ClientError> {
        let request = proto::StorageGetItemRequest {
            provider_id: provider_id.to_string(),
            index: index.to_string(),
            algorithm,
            usages,
        };
        let data = self
            .send(tags::KEY_STORAGE_GET_ITEM, request.encode())
            .await?;
        Ok(KeyDescriptor::from_bytes(&data)?)
    }

    /// Store a held key; returns its index
    pub async fn key_storage_set(
        &self,
        provider_id: &str,
        item: CryptoHandle,
    ) -> Result<String, ClientError> {
        let request = proto::StorageSetItemRequest {
            provider_id: provider_id.to_string(),
            item,
        };
        let data = self
            .send(tags::KEY_STORAGE_SET_ITEM, request.encode())
            .await?;
        String::from_utf8(data)
            .map_err(|_| ProtoError::InvalidValue("index is not UTF-8".to_string()).into())
    }

    /// Remove a stored key
    pub async fn key_storage_remove(
        &self,
        provider_id: &str,
        index: &str,
    ) -> Result<(), ClientError> {
        let request = proto::StorageRemoveItemRequest {
            provider_id: provider_id.to_string(),
            index: index.to_string(),
        };
        self.send(tags::KEY_STORAGE_REMOVE_ITEM, request.encode())
            .await?;
        Ok(())
    }

    /// List stored key indexes
    pub async fn key_storage_keys(&self, provider_id: &str) -> Result<Vec<String>, ClientError> {
        let data = self
            .send(tags::KEY_STORAGE_KEYS, provider_request(provider_id))
            .await?;
        Ok(proto::decode_string_list(&data)?)
    }

    /// Clear key storage
    pub async fn key_storage_clear(&self, provider_id: &str) -> Result<(), ClientError> {
        self.send(tags::KEY_STORAGE_CLEAR, provider_request(provider_id))
            .await?;
        Ok(())
    }

    /// Import a certificate; returns its descriptor
    pub async fn cert_storage_import(
        &self,
        provider_id: &str,
        kind: HandleKind,
        data: Vec<u8>,
        algorithm: Algorithm,
        usages: Vec<KeyUsage>,
    ) -> Result<proto::CertificateDescriptor, ClientError> {
        let request = proto::ImportCertRequest {
            provider_id: provider_id.to_string(),
            kind,
            data,
            algorithm,
            usages,
        };
        let data = self
            .send(tags::CERT_STORAGE_IMPORT, request.encode())
            .await?;
        Ok(proto::CertificateDescriptor::decode(&data)?)
    }

    /// Fetch a stored certificate by index
    pub async fn cert_storage_get(
        &self,
        provider_id: &str,
        index: &str,
    ) -> Result<proto::CertificateDescriptor, ClientError> {
        let request = proto::StorageGetItemRequest {
            provider_id: provider_id.to_string(),
            index: index.to_string(),
            algorithm: None,
            usages: None,
        };
        let data = self
            .send(tags::CERT_STORAGE_GET_ITEM, request.encode())
            .await?;
        Ok(proto::CertificateDescriptor::decode(&data)?)
    }

    /// Store a held certificate; returns its index
    pub async fn cert_storage_set(
        &self,
        provider_id: &str,
        item: CryptoHandle,
    ) -> Result<String, ClientError> {
        let request = proto::StorageSetItemRequest {
            provider_id: provider_id.to_string(),
            item,
        };
        let data = self
            .send(tags::CERT_STORAGE_SET_ITEM, request.encode())
            .await?;
        String::from_utf8(data)
            .map_err(|_| ProtoError::InvalidValue("index is not UTF-8".to_string()).into())
    }

    /// Remove a stored certificate
    pub async fn cert_storage_remove(
        &self,
        provider_id: &str,
        index: &str,
    ) -> Result<(), ClientError> {
        let request = proto::StorageRemoveItemRequest {
            provider_id: provider_id.to_string(),
            index: index.to_string(),
        };
        self.send(tags::CERT_STORAGE_REMOVE_ITEM, request.encode())
            .await?;
        Ok(())
    }

    /// List stored certificate indexes
    pub async fn cert_storage_keys(&self, provider_id: &str) -> Result<Vec<String>, ClientError> {
        let data = self
            .send(tags::CERT_STORAGE_KEYS, provider_request(provider_id))
            .await?;
        Ok(proto::decode_string_list(&data)?)
    }

    /// Clear certificate storage
    pub async fn cert_storage_clear(&self, provider_id: &str) -> Result<(), ClientError> {
        self.send(tags::CERT_STORAGE_CLEAR, provider_request(provider_id))
            .await?;
        Ok(())
    }

    /// Export a held certificate
    pub async fn cert_storage_export(
        &self,
        provider_id: &str,
        format: CertFormat,
        item: CryptoHandle,
    ) -> Result<Vec<u8>, ClientError> {
        let request = proto::ExportCertRequest {
            provider_id: provider_id.to_string(),
            format,
            item,
        };
        self.send(tags::CERT_STORAGE_EXPORT, request.encode()).await
    }
}

fn provider_request(provider_id: &str) -> Vec<u8> {
    proto::ProviderRequest {
        provider_id: provider_id.to_string(),
    }
    .encode()
}

/// The connection task: seals outbound envelopes, opens inbound frames,
/// correlates results, fans out events
async fn run_loop(
    inner: Arc<ClientInner>,
    mut transport: Box<dyn Transport>,
    mut secure: SecureChannel,
    mut out_rx: mpsc::Receiver<Envelope>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    enum Step {
        Outbound(Option<Envelope>),
        Inbound(Result<Vec<u8>, TransportError>),
        Shutdown,
    }

    loop {
        let step = tokio::select! {
            envelope = out_rx.recv() => Step::Outbound(envelope),
            frame = transport.receive() => Step::Inbound(frame),
            _ = shutdown_rx.recv() => Step::Shutdown,
        };

        match step {
            Step::Shutdown | Step::Outbound(None) => break,
            Step::Outbound(Some(envelope)) => {
                let frame = match secure.seal(&envelope.to_bytes()).await {
                    Ok(frame) => frame,
                    Err(error) => {
                        warn!(%error, "seal failed; closing channel");
                        break;
                    }
                };
                if let Err(error) = transport.send(&frame).await {
                    warn!(%error, "send failed; closing channel");
                    break;
                }
            }
            Step::Inbound(Err(TransportError::Disconnected)) => break,
            Step::Inbound(Err(error)) => {
                warn!(%error, "receive failed; closing channel");
                break;
            }
            Step::Inbound(Ok(frame)) => {
                let plaintext = match secure.open(&frame).await {
                    Ok(plaintext) => plaintext,
                    Err(error) => {
                        // Ratchet failure is unrecoverable; close to force
                        // a re-handshake
                        warn!(%error, "ratchet failure; closing channel");
                        break;
                    }
                };

                match Envelope::from_bytes(&plaintext) {
                    Ok(Envelope::Result(result)) => {
                        let sender = inner
                            .pending
                            .lock()
                            .expect("pending lock poisoned")
                            .remove(&result.action_id);
                        match sender {
                            Some(sender) => {
                                let outcome = match result.outcome {
                                    Outcome::Data(data) => Ok(data),
                                    Outcome::Error(message) => {
                                        Err(ClientError::Remote(message))
                                    }
                                };
                                let _ = sender.send(outcome);
                            }
                            None => {
                                debug!(action_id = %result.action_id, "reply with no pending call")
                            }
                        }
                    }
                    Ok(Envelope::Event(event)) => handle_event(&inner, event),
                    Ok(Envelope::Action(_)) => {
                        warn!("server sent an action envelope; ignoring")
                    }
                    Err(error) => {
                        warn!(%error, "malformed envelope; closing channel");
                        break;
                    }
                }
            }
        }
    }

    inner.set_state(ChannelState::Closed);
    inner.drain_pending();
    let _ = transport.close().await;
}

fn handle_event(inner: &Arc<ClientInner>, event: EventEnvelope) {
    match event.event.as_str() {
        proto::events::AUTHORIZED => {
            inner.set_state(ChannelState::Authorized);
            let _ = inner.events_tx.send(GatewayEvent::Authorized);
        }
        proto::events::TOKEN => match TokenEventPayload::decode(&event.payload) {
            Ok(payload) => {
                let _ = inner.events_tx.send(GatewayEvent::Token(payload));
            }
            Err(error) => warn!(%error, "malformed token event"),
        },
        other => debug!(event = other, "unknown event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Provider, ProviderRegistry, SoftwareSubtle, SOFTWARE_PROVIDER_ID};
    use crate::server::{AutoApprove, Gateway, GatewayConfig, NeverAnswer, SecretPrompt};
    use crate::storage::MemoryStorage;
    use crate::transport::memory;
    use futures_util::future::join_all;
    use sha2::{Digest as _, Sha256};

    const SW: &str = SOFTWARE_PROVIDER_ID;

    async fn start_gateway() -> (Arc<Gateway>, Arc<ProviderRegistry>) {
        start_gateway_with(Arc::new(AutoApprove), GatewayConfig::default()).await
    }

    async fn start_gateway_with(
        prompt: Arc<dyn SecretPrompt>,
        config: GatewayConfig,
    ) -> (Arc<Gateway>, Arc<ProviderRegistry>) {
        let providers = Arc::new(ProviderRegistry::new());
        let gateway = Gateway::start(
            Arc::new(MemoryStorage::new()),
            providers.clone(),
            prompt,
            config,
        )
        .await
        .unwrap();
        (gateway, providers)
    }

    async fn connect_with(gateway: &Arc<Gateway>, storage: Arc<dyn Storage>) -> Client {
        let (ours, theirs) = memory::create_pair();
        gateway.accept(theirs);
        let info = gateway.server_info().await;
        let bundle = PreKeyBundle::from_base64(&info.pre_key).unwrap();
        Client::over_transport(ours, &bundle, storage, ClientConfig::default())
            .await
            .unwrap()
    }

    async fn connect(gateway: &Arc<Gateway>) -> Client {
        connect_with(gateway, Arc::new(MemoryStorage::new())).await
    }

    async fn authorized(gateway: &Arc<Gateway>) -> Client {
        let client = connect(gateway).await;
        client.login(SW).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_provider_info() {
        let (gateway, _) = start_gateway().await;
        let client = connect(&gateway).await;

        let info = client.provider_info().await.unwrap();
        assert_eq!(info.name, "keyport");
        assert!(info.providers.iter().any(|p| p.id == SW));
    }

    #[tokio::test]
    async fn test_unknown_provider_reported_in_band() {
        let (gateway, _) = start_gateway().await;
        let client = authorized(&gateway).await;

        let err = client
            .digest("nope", Algorithm::named("SHA-256"), b"x".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Provider 'nope' not found");
    }

    #[tokio::test]
    async fn test_unauthenticated_subset_enforced() {
        let (gateway, _) = start_gateway().await;
        let client = connect(&gateway).await;

        // Permitted before login
        client.provider_info().await.unwrap();
        client.get_crypto(SW).await.unwrap();
        assert!(client.is_logged_in(SW).await.unwrap());

        // Everything else fails locally until authorized
        let err = client
            .digest(SW, Algorithm::named("SHA-256"), b"x".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Socket connection is not open");

        client.login(SW).await.unwrap();
        assert_eq!(client.state(), ChannelState::Authorized);
        client
            .digest(SW, Algorithm::named("SHA-256"), b"x".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_generate_sign_verify() {
        let (gateway, _) = start_gateway().await;
        let client = authorized(&gateway).await;

        let generated = client
            .generate_key(
                SW,
                Algorithm::named("Ed25519"),
                false,
                vec![KeyUsage::Sign, KeyUsage::Verify],
            )
            .await
            .unwrap();
        let GeneratedKey::Pair { public, private } = generated else {
            panic!("expected a pair");
        };

        // Both halves share the public-key thumbprint
        assert_eq!(public.handle.id, private.handle.id);
        assert_eq!(public.handle.kind, HandleKind::Public);
        assert_eq!(private.handle.kind, HandleKind::Private);

        let data = b"hello".to_vec();
        let signature = client
            .sign(SW, Algorithm::named("Ed25519"), private.handle.clone(), data.clone())
            .await
            .unwrap();
        assert!(client
            .verify(
                SW,
                Algorithm::named("Ed25519"),
                public.handle.clone(),
                signature.clone(),
                data.clone(),
            )
            .await
            .unwrap());

        // Mutating any byte of the signature must flip the verdict
        let mut bad = signature;
        bad[7] ^= 0x01;
        assert!(!client
            .verify(SW, Algorithm::named("Ed25519"), public.handle, bad, data)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fresh_pairs_get_fresh_ids() {
        let (gateway, _) = start_gateway().await;
        let client = authorized(&gateway).await;

        let mut ids = std::collections::HashSet::new();
        for _ in 0..3 {
            let GeneratedKey::Pair { public, .. } = client
                .generate_key(SW, Algorithm::named("Ed25519"), false, vec![KeyUsage::Sign])
                .await
                .unwrap()
            else {
                panic!()
            };
            assert!(ids.insert(public.handle.id));
        }
    }

    #[tokio::test]
    async fn test_wrap_unwrap_derived_hmac_key() {
        let (gateway, _) = start_gateway().await;
        let client = authorized(&gateway).await;

        let GeneratedKey::Single(kek) = client
            .generate_key(
                SW,
                Algorithm::named("AES-GCM").with_length(256),
                false,
                vec![KeyUsage::WrapKey, KeyUsage::UnwrapKey],
            )
            .await
            .unwrap()
        else {
            panic!()
        };
        let GeneratedKey::Single(hmac_key) = client
            .generate_key(
                SW,
                Algorithm::hmac("SHA-256"),
                true,
                vec![KeyUsage::Sign, KeyUsage::Verify],
            )
            .await
            .unwrap()
        else {
            panic!()
        };

        let wrap_algorithm = Algorithm::aes_gcm(vec![0u8; 12]);
        let wrapped = client
            .wrap_key(
                SW,
                KeyFormat::Raw,
                hmac_key.handle.clone(),
                kek.handle.clone(),
                wrap_algorithm.clone(),
            )
            .await
            .unwrap();

        let unwrapped = client
            .unwrap_key(
                SW,
                KeyFormat::Raw,
                wrapped,
                kek.handle,
                wrap_algorithm,
                Algorithm::hmac("SHA-256"),
                true,
                vec![KeyUsage::Sign, KeyUsage::Verify],
            )
            .await
            .unwrap();

        // Signatures under the original and the unwrapped key agree
        let original = client
            .sign(SW, Algorithm::hmac("SHA-256"), hmac_key.handle, b"x".to_vec())
            .await
            .unwrap();
        let recovered = client
            .sign(SW, Algorithm::hmac("SHA-256"), unwrapped.handle, b"x".to_vec())
            .await
            .unwrap();
        assert_eq!(original, recovered);
    }

    #[tokio::test]
    async fn test_sixteen_concurrent_digests() {
        let (gateway, _) = start_gateway().await;
        let client = authorized(&gateway).await;

        let calls = (0..16u8).map(|i| {
            let client = client.clone();
            async move {
                let data = vec![i; 16];
                let digest = client
                    .digest(SW, Algorithm::named("SHA-256"), data.clone())
                    .await
                    .unwrap();
                (data, digest)
            }
        });

        for (data, digest) in join_all(calls).await {
            assert_eq!(digest, Sha256::digest(&data).to_vec());
        }
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let (gateway, _) = start_gateway().await;
        let client = authorized(&gateway).await;

        let err = client.send("Nope", Vec::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown action 'Nope'");

        // The channel stays open and usable
        assert_eq!(client.state(), ChannelState::Authorized);
        client
            .digest(SW, Algorithm::named("SHA-256"), b"still alive".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_login_timeout() {
        let (gateway, providers) = start_gateway_with(
            Arc::new(NeverAnswer),
            GatewayConfig {
                login_timeout: Duration::from_millis(100),
                ..GatewayConfig::default()
            },
        )
        .await;
        providers
            .add(Provider::token("t1", "TEST", Arc::new(SoftwareSubtle::new())))
            .await;

        let client = connect(&gateway).await;
        let err = client.login("t1").await.unwrap_err();
        assert_eq!(err.to_string(), "CryptoLogin timeout");

        // Unauthenticated-only actions still succeed afterwards
        assert!(!client.is_logged_in("t1").await.unwrap());
        assert_eq!(client.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_token_hotplug_reaches_authorized_sessions_only() {
        let (gateway, providers) = start_gateway().await;

        let authorized_client = authorized(&gateway).await;
        let unauthorized_client = connect(&gateway).await;
        let mut auth_events = authorized_client.subscribe();
        let mut unauth_events = unauthorized_client.subscribe();
        assert_eq!(gateway.session_count().await, 2);

        providers
            .add(Provider::token("t1", "TEST", Arc::new(SoftwareSubtle::new())))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(2), auth_events.recv())
            .await
            .expect("authorized session must see the event")
            .unwrap();
        let GatewayEvent::Token(payload) = event else {
            panic!("expected a token event");
        };
        assert_eq!(payload.added.len(), 1);
        assert_eq!(payload.added[0].id, "t1");
        assert!(payload.removed.is_empty());

        // Exactly one event; nothing further queued
        assert!(
            tokio::time::timeout(Duration::from_millis(200), auth_events.recv())
                .await
                .is_err()
        );
        // The unauthorized session sees nothing
        assert!(
            tokio::time::timeout(Duration::from_millis(200), unauth_events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_pending_rejected_on_close() {
        let (gateway, providers) = start_gateway_with(
            Arc::new(NeverAnswer),
            GatewayConfig {
                login_timeout: Duration::from_secs(30),
                ..GatewayConfig::default()
            },
        )
        .await;
        providers
            .add(Provider::token("t1", "TEST", Arc::new(SoftwareSubtle::new())))
            .await;

        let client = connect(&gateway).await;
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.login("t1").await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.close().await;

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Connection closed");

        // Terminal state: nothing more goes out
        let err = client.provider_info().await.unwrap_err();
        assert_eq!(err.to_string(), "Socket connection is not open");
    }

    #[tokio::test]
    async fn test_identity_persisted_and_reused() {
        let (gateway, _) = start_gateway().await;
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        let client = connect_with(&gateway, storage.clone()).await;
        client.login(SW).await.unwrap();
        let first = storage.load_identity().await.unwrap().unwrap();
        client.close().await;

        // Reconnect with the same storage: the identity is byte-stable
        let client = connect_with(&gateway, storage.clone()).await;
        client.login(SW).await.unwrap();
        let second = storage.load_identity().await.unwrap().unwrap();

        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        // The gateway identity is pinned under the logical server key
        assert!(storage.load_remote_identity("0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_key_storage_round_trip() {
        let (gateway, _) = start_gateway().await;
        let client = authorized(&gateway).await;

        let GeneratedKey::Single(key) = client
            .generate_key(
                SW,
                Algorithm::hmac("SHA-256"),
                true,
                vec![KeyUsage::Sign, KeyUsage::Verify],
            )
            .await
            .unwrap()
        else {
            panic!()
        };

        let index = client.key_storage_set(SW, key.handle.clone()).await.unwrap();
        assert_eq!(index, key.handle.id);
        assert_eq!(client.key_storage_keys(SW).await.unwrap(), vec![index.clone()]);

        // The fetched handle operates without re-import
        let fetched = client
            .key_storage_get(SW, &index, None, Some(vec![KeyUsage::Sign]))
            .await
            .unwrap();
        let original = client
            .sign(SW, Algorithm::hmac("SHA-256"), key.handle, b"x".to_vec())
            .await
            .unwrap();
        let from_storage = client
            .sign(SW, Algorithm::hmac("SHA-256"), fetched.handle, b"x".to_vec())
            .await
            .unwrap();
        assert_eq!(original, from_storage);

        client.key_storage_remove(SW, &index).await.unwrap();
        let err = client
            .key_storage_get(SW, &index, None, None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Cannot get key by identity '{}'", index)
        );

        client.key_storage_clear(SW).await.unwrap();
        assert!(client.key_storage_keys(SW).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_provider_handle_misses() {
        let (gateway, providers) = start_gateway().await;
        providers
            .add(Provider::token("t1", "TEST", Arc::new(SoftwareSubtle::new())))
            .await;
        let client = authorized(&gateway).await;

        let GeneratedKey::Single(key) = client
            .generate_key(SW, Algorithm::hmac("SHA-256"), false, vec![KeyUsage::Sign])
            .await
            .unwrap()
        else {
            panic!()
        };

        let foreign = CryptoHandle {
            provider_id: "t1".to_string(),
            ..key.handle
        };
        let err = client
            .sign("t1", Algorithm::hmac("SHA-256"), foreign.clone(), b"x".to_vec())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Cannot get CryptoItem by ID '{}'", foreign.id)
        );
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let (gateway, _) = start_gateway().await;
        let client = authorized(&gateway).await;

        let GeneratedKey::Pair { public, private } = client
            .generate_key(
                SW,
                Algorithm::named("Ed25519"),
                true,
                vec![KeyUsage::Sign, KeyUsage::Verify],
            )
            .await
            .unwrap()
        else {
            panic!()
        };

        // JWK export is UTF-8 JSON
        let jwk = client
            .export_key(SW, KeyFormat::Jwk, private.handle.clone())
            .await
            .unwrap();
        serde_json::from_slice::<serde_json::Value>(&jwk).unwrap();

        let imported = client
            .import_key(
                SW,
                KeyFormat::Jwk,
                jwk,
                Algorithm::named("Ed25519"),
                true,
                vec![KeyUsage::Sign],
            )
            .await
            .unwrap();

        // Signatures under the reimported key verify under the original public
        let signature = client
            .sign(SW, Algorithm::named("Ed25519"), imported.handle, b"round trip".to_vec())
            .await
            .unwrap();
        assert!(client
            .verify(
                SW,
                Algorithm::named("Ed25519"),
                public.handle,
                signature,
                b"round trip".to_vec(),
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_derive_bits_and_key() {
        let (gateway, _) = start_gateway().await;
        let client = authorized(&gateway).await;

        let GeneratedKey::Pair {
            public: alice_public,
            private: alice_private,
        } = client
            .generate_key(
                SW,
                Algorithm::named("X25519"),
                false,
                vec![KeyUsage::DeriveBits, KeyUsage::DeriveKey],
            )
            .await
            .unwrap()
        else {
            panic!()
        };
        let GeneratedKey::Pair {
            public: bob_public,
            private: bob_private,
        } = client
            .generate_key(
                SW,
                Algorithm::named("X25519"),
                false,
                vec![KeyUsage::DeriveBits, KeyUsage::DeriveKey],
            )
            .await
            .unwrap()
        else {
            panic!()
        };

        // Both directions derive the same bits
        let alice_bits = client
            .derive_bits(
                SW,
                Algorithm::named("X25519").with_public(bob_public.handle.clone()),
                alice_private.handle.clone(),
                256,
            )
            .await
            .unwrap();
        let bob_bits = client
            .derive_bits(
                SW,
                Algorithm::named("X25519").with_public(alice_public.handle.clone()),
                bob_private.handle.clone(),
                256,
            )
            .await
            .unwrap();
        assert_eq!(alice_bits, bob_bits);

        // Derived keys are held and usable
        let derived = client
            .derive_key(
                SW,
                Algorithm::named("X25519").with_public(bob_public.handle),
                alice_private.handle,
                Algorithm::hmac("SHA-256").with_length(256),
                false,
                vec![KeyUsage::Sign],
            )
            .await
            .unwrap();
        client
            .sign(SW, Algorithm::hmac("SHA-256"), derived.handle, b"derived".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_certificate_storage() {
        let (gateway, _) = start_gateway().await;
        let client = authorized(&gateway).await;

        // Build a DER blob embedding the SPKI of a fresh signing key
        let GeneratedKey::Pair { public, private } = client
            .generate_key(
                SW,
                Algorithm::named("Ed25519"),
                true,
                vec![KeyUsage::Sign, KeyUsage::Verify],
            )
            .await
            .unwrap()
        else {
            panic!()
        };
        let spki = client
            .export_key(SW, KeyFormat::Spki, public.handle.clone())
            .await
            .unwrap();
        let mut der = vec![0x30, 0x82, 0x02, 0x00, 0xA0, 0x03, 0x02, 0x01, 0x02];
        der.extend_from_slice(&spki);
        der.extend_from_slice(&[0x05, 0x00]);

        let cert = client
            .cert_storage_import(
                SW,
                HandleKind::X509,
                der.clone(),
                Algorithm::named("Ed25519"),
                vec![KeyUsage::Verify],
            )
            .await
            .unwrap();

        // Certificate and its public key share the thumbprint id
        assert_eq!(cert.handle.kind, HandleKind::X509);
        assert_eq!(cert.handle.id, cert.public_key.handle.id);
        assert_eq!(cert.handle.id, public.handle.id);

        // The recovered public key verifies signatures from the pair
        let signature = client
            .sign(SW, Algorithm::named("Ed25519"), private.handle, b"attested".to_vec())
            .await
            .unwrap();
        assert!(client
            .verify(
                SW,
                Algorithm::named("Ed25519"),
                cert.public_key.handle.clone(),
                signature,
                b"attested".to_vec(),
            )
            .await
            .unwrap());

        // Store, list, fetch, export
        let index = client
            .cert_storage_set(SW, cert.handle.clone())
            .await
            .unwrap();
        assert_eq!(client.cert_storage_keys(SW).await.unwrap(), vec![index.clone()]);

        let fetched = client.cert_storage_get(SW, &index).await.unwrap();
        assert_eq!(fetched.handle.id, cert.handle.id);

        let raw = client
            .cert_storage_export(SW, CertFormat::Raw, fetched.handle.clone())
            .await
            .unwrap();
        assert_eq!(raw, der);

        let pem = client
            .cert_storage_export(SW, CertFormat::Pem, fetched.handle)
            .await
            .unwrap();
        let pem = String::from_utf8(pem).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(pem.trim_end().ends_with("-----END CERTIFICATE-----"));

        client.cert_storage_remove(SW, &index).await.unwrap();
        let err = client.cert_storage_get(SW, &index).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Cannot get certificate by identity '{}'", index)
        );

        client.cert_storage_clear(SW).await.unwrap();
        assert!(client.cert_storage_keys(SW).await.unwrap().is_empty());
    }
}
