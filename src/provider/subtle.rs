//! The subtle operation surface
//!
//! Mirrors the WebCrypto `SubtleCrypto` contract over live key objects.
//! Compound operations (derive-key, wrap, unwrap) have default
//! implementations composed from the primitive ones, matching how the
//! platform defines them.

use async_trait::async_trait;

use crate::proto::{Algorithm, KeyFormat, KeyUsage};

use super::key::KeyObject;
use super::{ProviderError, ProviderResult};

/// Result of key generation
#[derive(Clone, Debug)]
pub enum GeneratedKeyObjects {
    /// A symmetric key
    Single(KeyObject),
    /// An asymmetric pair
    Pair {
        public: KeyObject,
        private: KeyObject,
    },
}

/// Algorithmic primitives of one provider
#[async_trait]
pub trait Subtle: Send + Sync {
    /// Hash `data`
    async fn digest(&self, algorithm: &Algorithm, data: &[u8]) -> ProviderResult<Vec<u8>>;

    /// Generate a key or key pair
    async fn generate_key(
        &self,
        algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> ProviderResult<GeneratedKeyObjects>;

    /// Produce a signature
    async fn sign(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        data: &[u8],
    ) -> ProviderResult<Vec<u8>>;

    /// Check a signature
    async fn verify(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        signature: &[u8],
        data: &[u8],
    ) -> ProviderResult<bool>;

    /// Encrypt `data`
    async fn encrypt(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        data: &[u8],
    ) -> ProviderResult<Vec<u8>>;

    /// Decrypt `data`
    async fn decrypt(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        data: &[u8],
    ) -> ProviderResult<Vec<u8>>;

    /// Derive `length` bits from `key` and the resolved peer public key
    async fn derive_bits(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        peer: &KeyObject,
        length: u32,
    ) -> ProviderResult<Vec<u8>>;

    /// Import key material
    async fn import_key(
        &self,
        format: KeyFormat,
        data: &[u8],
        algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> ProviderResult<KeyObject>;

    /// Export key material
    async fn export_key(&self, format: KeyFormat, key: &KeyObject) -> ProviderResult<Vec<u8>>;

    /// Derive a key: derive-bits followed by an import of the result
    async fn derive_key(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        peer: &KeyObject,
        derived_algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> ProviderResult<KeyObject> {
        key.require_usage(KeyUsage::DeriveKey)?;
        let bits = derived_algorithm
            .length
            .map(Ok)
            .unwrap_or_else(|| default_key_bits(derived_algorithm))?;
        let material = self.derive_bits(algorithm, key, peer, bits).await?;
        self.import_key(KeyFormat::Raw, &material, derived_algorithm, extractable, usages)
            .await
    }

    /// Wrap: export `key`, then encrypt it under `wrapping_key`
    async fn wrap_key(
        &self,
        format: KeyFormat,
        key: &KeyObject,
        wrapping_key: &KeyObject,
        algorithm: &Algorithm,
    ) -> ProviderResult<Vec<u8>> {
        wrapping_key.require_usage(KeyUsage::WrapKey)?;
        let exported = self.export_key(format, key).await?;
        self.encrypt(algorithm, wrapping_key, &exported).await
    }

    /// Unwrap: decrypt under `unwrapping_key`, then import the plaintext
    #[allow(clippy::too_many_arguments)]
    async fn unwrap_key(
        &self,
        format: KeyFormat,
        data: &[u8],
        unwrapping_key: &KeyObject,
        unwrap_algorithm: &Algorithm,
        unwrapped_algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> ProviderResult<KeyObject> {
        unwrapping_key.require_usage(KeyUsage::UnwrapKey)?;
        let material = self.decrypt(unwrap_algorithm, unwrapping_key, data).await?;
        self.import_key(format, &material, unwrapped_algorithm, extractable, usages)
            .await
    }
}

/// Default key sizes, in bits, for derived keys without an explicit length
pub(crate) fn default_key_bits(algorithm: &Algorithm) -> ProviderResult<u32> {
    match algorithm.name.as_str() {
        "AES-GCM" => Ok(256),
        "HMAC" => match algorithm.hash.as_deref() {
            Some("SHA-384") | Some("SHA-512") => Ok(1024),
            _ => Ok(512),
        },
        other => Err(ProviderError::UnsupportedAlgorithm(other.to_string())),
    }
}
