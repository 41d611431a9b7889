//! Crypto handle registry
//!
//! Maps the opaque handles clients hold to live key and certificate
//! objects. Keys must remain resident (token-backed material is
//! non-extractable), so every operation that produces an object inserts
//! a row here and replies with the handle only.
//!
//! The table is append-only and scoped to one connection; it drops with
//! the session.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::proto::{CryptoHandle, HandleKind};
use crate::provider::{CertObject, KeyObject, ProviderError, ProviderResult};

/// A live object a handle can point at
#[derive(Clone, Debug)]
pub enum CryptoObject {
    /// A key resident in a provider
    Key(Arc<KeyObject>),
    /// A certificate with its recovered public key
    Certificate(Arc<CertObject>),
}

impl CryptoObject {
    /// The key inside, when the object is one
    pub fn as_key(&self) -> ProviderResult<Arc<KeyObject>> {
        match self {
            CryptoObject::Key(key) => Ok(key.clone()),
            CryptoObject::Certificate(_) => Err(ProviderError::WrongKeyType),
        }
    }

    /// The certificate inside, when the object is one
    pub fn as_certificate(&self) -> ProviderResult<Arc<CertObject>> {
        match self {
            CryptoObject::Certificate(cert) => Ok(cert.clone()),
            CryptoObject::Key(_) => Err(ProviderError::WrongKeyType),
        }
    }
}

/// One registry row
#[derive(Clone, Debug)]
pub struct HandleEntry {
    /// The handle as the client sees it
    pub handle: CryptoHandle,
    /// The resident object
    pub object: CryptoObject,
    /// When the row was inserted
    pub created_at: SystemTime,
}

/// Append-only handle table for one connection
#[derive(Default)]
pub struct HandleRegistry {
    entries: Mutex<Vec<HandleEntry>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row; duplicates are allowed, first-inserted wins lookups
    pub fn insert(&self, handle: CryptoHandle, object: CryptoObject) -> HandleEntry {
        let entry = HandleEntry {
            handle,
            object,
            created_at: SystemTime::now(),
        };
        self.entries
            .lock()
            .expect("handle registry poisoned")
            .push(entry.clone());
        entry
    }

    /// First entry whose (id, provider, kind) triple equals the query
    pub fn lookup(&self, handle: &CryptoHandle) -> ProviderResult<HandleEntry> {
        self.entries
            .lock()
            .expect("handle registry poisoned")
            .iter()
            .find(|entry| {
                entry.handle.id == handle.id
                    && entry.handle.provider_id == handle.provider_id
                    && entry.handle.kind == handle.kind
            })
            .cloned()
            .ok_or_else(|| ProviderError::Operation(format!(
                "Cannot get CryptoItem by ID '{}'",
                handle.id
            )))
    }

    /// Resolve a handle that must be a key
    pub fn lookup_key(&self, handle: &CryptoHandle) -> ProviderResult<Arc<KeyObject>> {
        self.lookup(handle)?.object.as_key()
    }

    /// Rows currently held (diagnostics)
    pub fn len(&self) -> usize {
        self.entries.lock().expect("handle registry poisoned").len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identity for a public key: hex SHA-256 over canonical SPKI
///
/// The key is canonicalized through JWK and reimported before the SPKI
/// is built, so providers that cannot export SPKI natively still agree
/// on the thumbprint.
pub fn public_key_thumbprint(key: &KeyObject) -> ProviderResult<String> {
    let jwk = key.to_jwk()?;
    let material = KeyObject::material_from_jwk(&jwk)?;
    let canonical = KeyObject::new(
        key.algorithm.clone(),
        HandleKind::Public,
        true,
        Vec::new(),
        material,
    );
    let spki = canonical.spki_der()?;
    Ok(hex::encode(Sha256::digest(&spki)))
}

/// Identity for private and secret keys: 32 random bytes, hex-encoded
///
/// Sibling private keys share an id with their public half only because
/// the dispatcher assigns the public thumbprint to both at generation
/// time.
pub fn random_object_id() -> String {
    hex::encode(crate::crypto::random_bytes::<32>())
}

/// Identity for any key object, chosen by kind
pub fn key_object_id(key: &KeyObject) -> ProviderResult<String> {
    match key.kind {
        HandleKind::Public => public_key_thumbprint(key),
        _ => Ok(random_object_id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Algorithm, KeyUsage};
    use crate::provider::KeyMaterial;

    fn public_key() -> KeyObject {
        let seed = crate::crypto::random_bytes::<32>();
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        KeyObject::new(
            Algorithm::named("Ed25519"),
            HandleKind::Public,
            true,
            vec![KeyUsage::Verify],
            KeyMaterial::Ed25519Public(signing.verifying_key().to_bytes()),
        )
    }

    fn handle(id: &str, kind: HandleKind) -> CryptoHandle {
        CryptoHandle {
            id: id.to_string(),
            provider_id: "software".to_string(),
            kind,
        }
    }

    #[test]
    fn test_insert_lookup() {
        let registry = HandleRegistry::new();
        let key = Arc::new(public_key());

        registry.insert(
            handle("a", HandleKind::Public),
            CryptoObject::Key(key.clone()),
        );

        let entry = registry.lookup(&handle("a", HandleKind::Public)).unwrap();
        assert_eq!(entry.handle.id, "a");
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_miss_message() {
        let registry = HandleRegistry::new();
        let err = registry
            .lookup(&handle("nope", HandleKind::Public))
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot get CryptoItem by ID 'nope'");
    }

    #[test]
    fn test_kind_distinguishes_pair_halves() {
        let registry = HandleRegistry::new();
        let key = Arc::new(public_key());

        registry.insert(
            handle("same", HandleKind::Public),
            CryptoObject::Key(key.clone()),
        );
        registry.insert(handle("same", HandleKind::Private), CryptoObject::Key(key));

        let public = registry.lookup(&handle("same", HandleKind::Public)).unwrap();
        let private = registry
            .lookup(&handle("same", HandleKind::Private))
            .unwrap();
        assert_eq!(public.handle.kind, HandleKind::Public);
        assert_eq!(private.handle.kind, HandleKind::Private);
    }

    #[test]
    fn test_foreign_provider_misses() {
        let registry = HandleRegistry::new();
        registry.insert(
            handle("a", HandleKind::Public),
            CryptoObject::Key(Arc::new(public_key())),
        );

        let foreign = CryptoHandle {
            provider_id: "token".to_string(),
            ..handle("a", HandleKind::Public)
        };
        assert!(registry.lookup(&foreign).is_err());
    }

    #[test]
    fn test_first_inserted_wins_duplicates() {
        let registry = HandleRegistry::new();
        let first = Arc::new(public_key());
        let second = Arc::new(public_key());

        registry.insert(
            handle("dup", HandleKind::Public),
            CryptoObject::Key(first.clone()),
        );
        registry.insert(handle("dup", HandleKind::Public), CryptoObject::Key(second));

        let entry = registry.lookup(&handle("dup", HandleKind::Public)).unwrap();
        let key = entry.object.as_key().unwrap();
        assert_eq!(key.raw_bytes().unwrap(), first.raw_bytes().unwrap());
    }

    #[test]
    fn test_thumbprint_stable_and_distinct() {
        let key = public_key();
        let other = public_key();

        let a = public_key_thumbprint(&key).unwrap();
        let b = public_key_thumbprint(&key).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, public_key_thumbprint(&other).unwrap());
    }

    #[test]
    fn test_random_ids_distinct() {
        assert_ne!(random_object_id(), random_object_id());
    }
}
