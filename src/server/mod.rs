//! The gateway server
//!
//! Owns the local identity, the provider registry, and the set of
//! connected sessions. One listener serves both the plaintext discovery
//! document and the WebSocket upgrade; each accepted connection runs
//! its own loop that performs the handshake, opens inbound frames,
//! spawns a task per action, and seals replies and events back out.

mod dispatch;
mod http;
mod session;

pub use dispatch::{ConnCtx, Dispatcher};
pub use http::DISCOVERY_PATH;
pub use session::{AutoApprove, NeverAnswer, PromptOutcome, SecretPrompt, SessionHandle, SessionState};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::crypto::{CryptoError, Identity};
use crate::proto::{
    events, Envelope, EventEnvelope, Outcome, ProtoError, ResultEnvelope,
};
use crate::provider::{ProviderError, ProviderRegistry};
use crate::registry::HandleRegistry;
use crate::session::{self as channel, ChannelError, HandshakeInit, PreKeyBundle, SecureChannel};
use crate::storage::{Storage, StorageError};
use crate::transport::{Transport, TransportError};

/// Server-side errors
///
/// Handler-level variants render to the in-band error strings clients
/// see; the transport-level ones close the session.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Action tag not in the handler table
    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    /// Action not permitted before login
    #[error("Session is not authorized")]
    NotAuthorized,

    /// Login prompt ran into its deadline
    #[error("CryptoLogin timeout")]
    LoginTimeout,

    /// The user dismissed the login prompt
    #[error("Login was cancelled")]
    LoginCancelled,

    /// Provider-level failure, passed through verbatim
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Malformed envelope or payload
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Handshake failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Ratchet or persistence failure on the channel
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Store failure outside the channel
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Frame-level I/O failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Listener I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discovery document served on `/.well-known/webcrypto-local`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Gateway name
    pub name: String,
    /// Gateway version
    pub version: String,
    /// Base64 of the serialized pre-key bundle
    pub pre_key: String,
}

/// Gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Name published in the discovery document and `ProviderInfo`
    pub name: String,
    /// Version published alongside
    pub version: String,
    /// Deadline for login prompts
    pub login_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            name: "keyport".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            login_timeout: Duration::from_secs(30),
        }
    }
}

/// The long-running gateway
pub struct Gateway {
    config: GatewayConfig,
    identity: RwLock<Identity>,
    storage: Arc<dyn Storage>,
    providers: Arc<ProviderRegistry>,
    prompt: Arc<dyn SecretPrompt>,
    dispatcher: Dispatcher,
    sessions: RwLock<Vec<SessionHandle>>,
}

impl Gateway {
    /// Load (or provision) the identity and start the event broadcaster
    pub async fn start(
        storage: Arc<dyn Storage>,
        providers: Arc<ProviderRegistry>,
        prompt: Arc<dyn SecretPrompt>,
        config: GatewayConfig,
    ) -> Result<Arc<Self>, GatewayError> {
        let identity = match storage.load_identity().await? {
            Some(identity) => identity,
            None => {
                let identity = Identity::generate();
                storage.save_identity(&identity).await?;
                info!(key = %identity.public_key(), "provisioned new gateway identity");
                identity
            }
        };

        let gateway = Arc::new(Gateway {
            config,
            identity: RwLock::new(identity),
            storage,
            providers,
            prompt,
            dispatcher: Dispatcher::new(),
            sessions: RwLock::new(Vec::new()),
        });

        gateway.clone().spawn_token_broadcast();
        Ok(gateway)
    }

    /// The current discovery document
    pub async fn server_info(&self) -> ServerInfo {
        let identity = self.identity.read().await;
        ServerInfo {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            pre_key: PreKeyBundle::publish(&identity).to_base64(),
        }
    }

    /// Serve discovery and WebSocket connections on `addr`
    pub async fn serve(self: Arc<Self>, addr: std::net::SocketAddr) -> Result<(), GatewayError> {
        http::serve(self, addr).await
    }

    /// Run a connection over an already-established transport
    ///
    /// Used by the WebSocket front end and directly by tests.
    pub fn accept<T: Transport + 'static>(self: &Arc<Self>, transport: T) {
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.run_connection(Box::new(transport)).await;
        });
    }

    /// Sessions currently connected (diagnostics)
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Push provider hotplug events to every authorized session
    fn spawn_token_broadcast(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut events_rx = self.providers.subscribe();
            while let Ok(payload) = events_rx.recv().await {
                let envelope = Envelope::Event(EventEnvelope {
                    event: events::TOKEN.to_string(),
                    payload: payload.encode(),
                });

                let sessions = self.sessions.read().await.clone();
                for session in sessions {
                    if session.state().await == SessionState::OpenAuth {
                        session.push(envelope.clone()).await;
                    }
                }
            }
        });
    }

    async fn run_connection(self: Arc<Self>, mut transport: Box<dyn Transport>) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let session = SessionHandle::new(out_tx);
        self.sessions.write().await.push(session.clone());

        if let Err(error) = self
            .drive_connection(transport.as_mut(), out_rx, &session)
            .await
        {
            warn!(session = session.id, %error, "session closed on error");
        } else {
            debug!(session = session.id, "session closed");
        }

        session.set_state(SessionState::Closed).await;
        self.sessions.write().await.retain(|s| s.id != session.id);
        let _ = transport.close().await;
    }

    async fn drive_connection(
        self: &Arc<Self>,
        transport: &mut dyn Transport,
        mut out_rx: mpsc::Receiver<Envelope>,
        session: &SessionHandle,
    ) -> Result<(), GatewayError> {
        // First frame is the plaintext handshake
        let first = transport.receive().await?;
        let init = HandshakeInit::from_bytes(&first)?;

        let ratchet = {
            let mut identity = self.identity.write().await;
            let ratchet = channel::respond(&mut identity, &init)?;
            // The consumed one-time pre-key must not be served again
            identity.replenish_one_time();
            self.storage.save_identity(&identity).await?;
            ratchet
        };

        self.storage
            .save_remote_identity(&init.identity_signing.to_hex(), &channel::pin_from_handshake(&init))
            .await?;

        let peer_key = format!("peer-{}", init.identity_signing.to_hex());
        let mut secure = SecureChannel::new(peer_key, ratchet, self.storage.clone());
        session.set_state(SessionState::OpenUnauth).await;
        info!(session = session.id, peer = %init.identity_signing, "secure channel established");

        let ctx = Arc::new(ConnCtx {
            providers: self.providers.clone(),
            handles: Arc::new(HandleRegistry::new()),
            session: session.clone(),
            prompt: self.prompt.clone(),
            login_timeout: self.config.login_timeout,
            gateway_name: self.config.name.clone(),
            gateway_version: self.config.version.clone(),
        });

        enum Step {
            Outbound(Option<Envelope>),
            Inbound(Result<Vec<u8>, TransportError>),
        }

        loop {
            let step = tokio::select! {
                envelope = out_rx.recv() => Step::Outbound(envelope),
                frame = transport.receive() => Step::Inbound(frame),
            };

            match step {
                Step::Outbound(None) => break,
                Step::Outbound(Some(envelope)) => {
                    // State is persisted inside seal, before the frame leaves
                    let frame = secure.seal(&envelope.to_bytes()).await?;
                    transport.send(&frame).await?;
                }
                Step::Inbound(Err(TransportError::Disconnected)) => break,
                Step::Inbound(Err(error)) => return Err(error.into()),
                Step::Inbound(Ok(frame)) => {
                    // A ratchet or parse failure here is unrecoverable for
                    // the session; error out and force a re-handshake
                    let plaintext = secure.open(&frame).await?;
                    let envelope = Envelope::from_bytes(&plaintext)?;
                    let Envelope::Action(action) = envelope else {
                        return Err(ProtoError::InvalidValue(
                            "client sent a non-action envelope".to_string(),
                        )
                        .into());
                    };

                    if !session.permits(&action.action).await {
                        session
                            .push(Envelope::Result(ResultEnvelope {
                                action_id: action.action_id,
                                action: action.action,
                                outcome: Outcome::Error(GatewayError::NotAuthorized.to_string()),
                            }))
                            .await;
                        continue;
                    }

                    // Each action runs as its own task; replies are
                    // correlated by id, not order
                    let gateway = self.clone();
                    let ctx = ctx.clone();
                    let session = session.clone();
                    tokio::spawn(async move {
                        let result = gateway.dispatcher.dispatch(ctx, action).await;
                        session.push(Envelope::Result(result)).await;
                    });
                }
            }
        }

        Ok(())
    }
}
