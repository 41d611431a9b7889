//! Provider-scoped key and certificate storage
//!
//! Named, durable-for-the-provider's-lifetime storage of live objects.
//! Indexes are the object thumbprints, handed back to clients as UTF-8
//! strings.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::proto::HandleKind;

use super::key::KeyObject;

/// A certificate resident in a provider
#[derive(Clone, Debug)]
pub struct CertObject {
    /// x509 or request
    pub kind: HandleKind,
    /// DER bytes as imported
    pub der: Vec<u8>,
    /// Public key recovered from the embedded SPKI
    pub public_key: Arc<KeyObject>,
}

/// Named key storage for one provider
#[derive(Default)]
pub struct KeyStore {
    items: RwLock<HashMap<String, Arc<KeyObject>>>,
}

impl KeyStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a key by index
    pub async fn get_item(&self, index: &str) -> Option<Arc<KeyObject>> {
        self.items.read().await.get(index).cloned()
    }

    /// Store a key; returns the index it was stored under
    pub async fn set_item(&self, index: &str, key: Arc<KeyObject>) -> String {
        self.items.write().await.insert(index.to_string(), key);
        index.to_string()
    }

    /// Remove a key; missing indexes are ignored
    pub async fn remove_item(&self, index: &str) {
        self.items.write().await.remove(index);
    }

    /// All indexes, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.items.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop every stored key
    pub async fn clear(&self) {
        self.items.write().await.clear();
    }
}

/// Named certificate storage for one provider
#[derive(Default)]
pub struct CertStore {
    items: RwLock<HashMap<String, Arc<CertObject>>>,
}

impl CertStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a certificate by index
    pub async fn get_item(&self, index: &str) -> Option<Arc<CertObject>> {
        self.items.read().await.get(index).cloned()
    }

    /// Store a certificate; returns the index it was stored under
    pub async fn set_item(&self, index: &str, cert: Arc<CertObject>) -> String {
        self.items.write().await.insert(index.to_string(), cert);
        index.to_string()
    }

    /// Remove a certificate; missing indexes are ignored
    pub async fn remove_item(&self, index: &str) {
        self.items.write().await.remove(index);
    }

    /// All indexes, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.items.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop every stored certificate
    pub async fn clear(&self) {
        self.items.write().await.clear();
    }
}
