//! Crypto providers
//!
//! A provider bundles a subtle implementation with its key and
//! certificate storage and its login state. The registry tracks the
//! live set and broadcasts hotplug events when token-backed providers
//! come and go.

pub mod key;
mod software;
mod store;
mod subtle;

pub use key::{KeyMaterial, KeyObject};
pub use software::{SoftwareSubtle, SOFTWARE_PROVIDER_ID};
pub use store::{CertObject, CertStore, KeyStore};
pub use subtle::{GeneratedKeyObjects, Subtle};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::proto::{KeyUsage, ProviderCryptoInfo, TokenEventPayload};

/// Errors surfaced by providers; messages travel to clients verbatim
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The algorithm name is not implemented by this provider
    #[error("Unsupported algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    /// The algorithm parameters are malformed
    #[error("Invalid algorithm parameters: {0}")]
    InvalidAlgorithm(String),

    /// The key cannot be expressed in the requested format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Imported material could not be parsed
    #[error("Invalid key data: {0}")]
    InvalidKeyData(String),

    /// The key's type does not fit the requested operation
    #[error("Key type does not match the algorithm")]
    WrongKeyType,

    /// The key's usages forbid the requested operation
    #[error("Key usages do not permit '{}'", .0.as_str())]
    UsageDenied(KeyUsage),

    /// Export of non-extractable material was requested
    #[error("Key is not extractable")]
    NotExtractable,

    /// The underlying primitive failed
    #[error("{0}")]
    Operation(String),

    /// No provider with the given id
    #[error("Provider '{0}' not found")]
    UnknownProvider(String),

    /// Key storage lookup miss
    #[error("Cannot get key by identity '{0}'")]
    KeyStorageMiss(String),

    /// Certificate storage lookup miss
    #[error("Cannot get certificate by identity '{0}'")]
    CertStorageMiss(String),
}

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// One live provider: subtle surface, storage, login state
pub struct Provider {
    /// Static info, as sent to clients
    pub info: ProviderCryptoInfo,
    /// Algorithmic operations
    pub subtle: Arc<dyn Subtle>,
    /// Named key storage
    pub keys: KeyStore,
    /// Named certificate storage
    pub certs: CertStore,
    requires_pin: bool,
    logged_in: AtomicBool,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("info", &self.info)
            .field("requires_pin", &self.requires_pin)
            .field("logged_in", &self.logged_in.load(Ordering::Relaxed))
            .finish()
    }
}

impl Provider {
    /// The built-in software provider: always present, never locked
    pub fn software() -> Self {
        Provider {
            info: ProviderCryptoInfo {
                id: SOFTWARE_PROVIDER_ID.to_string(),
                name: "Software provider".to_string(),
                removable: false,
            },
            subtle: Arc::new(SoftwareSubtle::new()),
            keys: KeyStore::new(),
            certs: CertStore::new(),
            requires_pin: false,
            logged_in: AtomicBool::new(true),
        }
    }

    /// A removable token-backed provider
    ///
    /// The subtle surface is injected; hardware modules implement
    /// [`Subtle`] against their PKCS#11 session.
    pub fn token(id: impl Into<String>, name: impl Into<String>, subtle: Arc<dyn Subtle>) -> Self {
        Provider {
            info: ProviderCryptoInfo {
                id: id.into(),
                name: name.into(),
                removable: true,
            },
            subtle,
            keys: KeyStore::new(),
            certs: CertStore::new(),
            requires_pin: true,
            logged_in: AtomicBool::new(false),
        }
    }

    /// Whether login needs a user-supplied secret
    pub fn requires_pin(&self) -> bool {
        self.requires_pin
    }

    /// Current login state
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    /// Mark the provider logged in after a successful PIN exchange
    pub fn set_logged_in(&self) {
        self.logged_in.store(true, Ordering::Release);
    }
}

/// The live set of providers, with hotplug events
pub struct ProviderRegistry {
    providers: RwLock<Vec<Arc<Provider>>>,
    token_tx: broadcast::Sender<TokenEventPayload>,
}

impl ProviderRegistry {
    /// Registry holding only the software provider
    pub fn new() -> Self {
        let (token_tx, _) = broadcast::channel(16);
        ProviderRegistry {
            providers: RwLock::new(vec![Arc::new(Provider::software())]),
            token_tx,
        }
    }

    /// Look a provider up by id
    pub async fn get(&self, id: &str) -> ProviderResult<Arc<Provider>> {
        self.providers
            .read()
            .await
            .iter()
            .find(|p| p.info.id == id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(id.to_string()))
    }

    /// Static info for every live provider
    pub async fn infos(&self) -> Vec<ProviderCryptoInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info.clone())
            .collect()
    }

    /// Insert a provider and broadcast the hotplug event
    pub async fn add(&self, provider: Provider) {
        let info = provider.info.clone();
        self.providers.write().await.push(Arc::new(provider));
        info!(id = %info.id, "provider added");
        let _ = self.token_tx.send(TokenEventPayload {
            added: vec![info],
            removed: Vec::new(),
        });
    }

    /// Remove a provider by id and broadcast the hotplug event
    pub async fn remove(&self, id: &str) {
        let mut providers = self.providers.write().await;
        if let Some(position) = providers.iter().position(|p| p.info.id == id) {
            let removed = providers.remove(position);
            info!(id = %id, "provider removed");
            let _ = self.token_tx.send(TokenEventPayload {
                added: Vec::new(),
                removed: vec![removed.info.clone()],
            });
        }
    }

    /// Subscribe to hotplug events
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEventPayload> {
        self.token_tx.subscribe()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_has_software_provider() {
        let registry = ProviderRegistry::new();
        let provider = registry.get(SOFTWARE_PROVIDER_ID).await.unwrap();

        assert!(!provider.requires_pin());
        assert!(provider.is_logged_in());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let registry = ProviderRegistry::new();
        let err = registry.get("missing").await.unwrap_err();
        assert_eq!(err.to_string(), "Provider 'missing' not found");
    }

    #[tokio::test]
    async fn test_hotplug_events() {
        let registry = ProviderRegistry::new();
        let mut events = registry.subscribe();

        registry
            .add(Provider::token("t1", "TEST", Arc::new(SoftwareSubtle::new())))
            .await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.added.len(), 1);
        assert_eq!(event.added[0].id, "t1");
        assert!(event.removed.is_empty());

        registry.remove("t1").await;
        let event = events.recv().await.unwrap();
        assert!(event.added.is_empty());
        assert_eq!(event.removed[0].id, "t1");
    }

    #[tokio::test]
    async fn test_token_provider_starts_locked() {
        let provider = Provider::token("t1", "TEST", Arc::new(SoftwareSubtle::new()));
        assert!(provider.requires_pin());
        assert!(!provider.is_logged_in());

        provider.set_logged_in();
        assert!(provider.is_logged_in());
    }
}
