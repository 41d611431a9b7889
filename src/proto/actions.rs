//! Action payload schemas
//!
//! Every action tag has a fixed payload schema on the request side and a
//! fixed result encoding on the reply side. Payloads are encoded with the
//! same length-delimited primitives as the envelopes.

#![allow(missing_docs)] // field names mirror the wire schema

use super::codec::{Reader, Writer};
use super::types::{read_usages, write_usages};
use super::{
    Algorithm, CryptoHandle, HandleKind, KeyDescriptor, KeyFormat, KeyUsage, ProtoError,
    ProtoResult, ProviderCryptoInfo,
};

/// Stable action tags
pub mod tags {
    // Provider family
    pub const PROVIDER_INFO: &str = "ProviderInfo";
    pub const PROVIDER_GET_CRYPTO: &str = "ProviderGetCrypto";
    pub const IS_LOGGED_IN: &str = "IsLoggedIn";
    pub const LOGIN: &str = "Login";

    // Subtle family
    pub const DIGEST: &str = "Digest";
    pub const GENERATE_KEY: &str = "GenerateKey";
    pub const SIGN: &str = "Sign";
    pub const VERIFY: &str = "Verify";
    pub const ENCRYPT: &str = "Encrypt";
    pub const DECRYPT: &str = "Decrypt";
    pub const DERIVE_BITS: &str = "DeriveBits";
    pub const DERIVE_KEY: &str = "DeriveKey";
    pub const IMPORT_KEY: &str = "ImportKey";
    pub const EXPORT_KEY: &str = "ExportKey";
    pub const WRAP_KEY: &str = "WrapKey";
    pub const UNWRAP_KEY: &str = "UnwrapKey";

    // Key storage family
    pub const KEY_STORAGE_GET_ITEM: &str = "KeyStorageGetItem";
    pub const KEY_STORAGE_SET_ITEM: &str = "KeyStorageSetItem";
    pub const KEY_STORAGE_REMOVE_ITEM: &str = "KeyStorageRemoveItem";
    pub const KEY_STORAGE_KEYS: &str = "KeyStorageKeys";
    pub const KEY_STORAGE_CLEAR: &str = "KeyStorageClear";

    // Certificate storage family
    pub const CERT_STORAGE_GET_ITEM: &str = "CertStorageGetItem";
    pub const CERT_STORAGE_SET_ITEM: &str = "CertStorageSetItem";
    pub const CERT_STORAGE_REMOVE_ITEM: &str = "CertStorageRemoveItem";
    pub const CERT_STORAGE_KEYS: &str = "CertStorageKeys";
    pub const CERT_STORAGE_CLEAR: &str = "CertStorageClear";
    pub const CERT_STORAGE_IMPORT: &str = "CertStorageImport";
    pub const CERT_STORAGE_EXPORT: &str = "CertStorageExport";
}

/// Actions a session may issue before it is authorized
pub const UNAUTHENTICATED_ACTIONS: &[&str] = &[
    tags::PROVIDER_INFO,
    tags::PROVIDER_GET_CRYPTO,
    tags::IS_LOGGED_IN,
    tags::LOGIN,
];

/// Payload carrying only the target provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderRequest {
    pub provider_id: String,
}

impl ProviderRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = ProviderRequest {
            provider_id: r.take_str()?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `Digest(alg, data)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestRequest {
    pub provider_id: String,
    pub algorithm: Algorithm,
    pub data: Vec<u8>,
}

impl DigestRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        self.algorithm.write(&mut w);
        w.put_bytes(&self.data);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = DigestRequest {
            provider_id: r.take_str()?,
            algorithm: Algorithm::read(&mut r)?,
            data: r.take_bytes()?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `GenerateKey(alg, extractable, usages)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateKeyRequest {
    pub provider_id: String,
    pub algorithm: Algorithm,
    pub extractable: bool,
    pub usages: Vec<KeyUsage>,
}

impl GenerateKeyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        self.algorithm.write(&mut w);
        w.put_bool(self.extractable);
        write_usages(&mut w, &self.usages);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = GenerateKeyRequest {
            provider_id: r.take_str()?,
            algorithm: Algorithm::read(&mut r)?,
            extractable: r.take_bool()?,
            usages: read_usages(&mut r)?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `Sign(alg, key, data)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignRequest {
    pub provider_id: String,
    pub algorithm: Algorithm,
    pub key: CryptoHandle,
    pub data: Vec<u8>,
}

impl SignRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        self.algorithm.write(&mut w);
        self.key.write(&mut w);
        w.put_bytes(&self.data);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = SignRequest {
            provider_id: r.take_str()?,
            algorithm: Algorithm::read(&mut r)?,
            key: CryptoHandle::read(&mut r)?,
            data: r.take_bytes()?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `Verify(alg, key, signature, data)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyRequest {
    pub provider_id: String,
    pub algorithm: Algorithm,
    pub key: CryptoHandle,
    pub signature: Vec<u8>,
    pub data: Vec<u8>,
}

impl VerifyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        self.algorithm.write(&mut w);
        self.key.write(&mut w);
        w.put_bytes(&self.signature);
        w.put_bytes(&self.data);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = VerifyRequest {
            provider_id: r.take_str()?,
            algorithm: Algorithm::read(&mut r)?,
            key: CryptoHandle::read(&mut r)?,
            signature: r.take_bytes()?,
            data: r.take_bytes()?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `Encrypt`/`Decrypt(alg, key, data)` share one schema
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CipherRequest {
    pub provider_id: String,
    pub algorithm: Algorithm,
    pub key: CryptoHandle,
    pub data: Vec<u8>,
}

impl CipherRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        self.algorithm.write(&mut w);
        self.key.write(&mut w);
        w.put_bytes(&self.data);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = CipherRequest {
            provider_id: r.take_str()?,
            algorithm: Algorithm::read(&mut r)?,
            key: CryptoHandle::read(&mut r)?,
            data: r.take_bytes()?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `DeriveBits(alg, key, length)`; `alg.public` carries the peer handle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeriveBitsRequest {
    pub provider_id: String,
    pub algorithm: Algorithm,
    pub key: CryptoHandle,
    pub length: u32,
}

impl DeriveBitsRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        self.algorithm.write(&mut w);
        self.key.write(&mut w);
        w.put_u32(self.length);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = DeriveBitsRequest {
            provider_id: r.take_str()?,
            algorithm: Algorithm::read(&mut r)?,
            key: CryptoHandle::read(&mut r)?,
            length: r.take_u32()?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `DeriveKey(alg, key, derived_alg, extractable, usages)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeriveKeyRequest {
    pub provider_id: String,
    pub algorithm: Algorithm,
    pub key: CryptoHandle,
    pub derived_algorithm: Algorithm,
    pub extractable: bool,
    pub usages: Vec<KeyUsage>,
}

impl DeriveKeyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        self.algorithm.write(&mut w);
        self.key.write(&mut w);
        self.derived_algorithm.write(&mut w);
        w.put_bool(self.extractable);
        write_usages(&mut w, &self.usages);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = DeriveKeyRequest {
            provider_id: r.take_str()?,
            algorithm: Algorithm::read(&mut r)?,
            key: CryptoHandle::read(&mut r)?,
            derived_algorithm: Algorithm::read(&mut r)?,
            extractable: r.take_bool()?,
            usages: read_usages(&mut r)?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `ImportKey(format, data, alg, extractable, usages)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportKeyRequest {
    pub provider_id: String,
    pub format: KeyFormat,
    pub data: Vec<u8>,
    pub algorithm: Algorithm,
    pub extractable: bool,
    pub usages: Vec<KeyUsage>,
}

impl ImportKeyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        w.put_u8(self.format.to_wire());
        w.put_bytes(&self.data);
        self.algorithm.write(&mut w);
        w.put_bool(self.extractable);
        write_usages(&mut w, &self.usages);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = ImportKeyRequest {
            provider_id: r.take_str()?,
            format: KeyFormat::from_wire(r.take_u8()?)?,
            data: r.take_bytes()?,
            algorithm: Algorithm::read(&mut r)?,
            extractable: r.take_bool()?,
            usages: read_usages(&mut r)?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `ExportKey(format, key)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportKeyRequest {
    pub provider_id: String,
    pub format: KeyFormat,
    pub key: CryptoHandle,
}

impl ExportKeyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        w.put_u8(self.format.to_wire());
        self.key.write(&mut w);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = ExportKeyRequest {
            provider_id: r.take_str()?,
            format: KeyFormat::from_wire(r.take_u8()?)?,
            key: CryptoHandle::read(&mut r)?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `WrapKey(format, key, wrapping_key, wrap_alg)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrapKeyRequest {
    pub provider_id: String,
    pub format: KeyFormat,
    pub key: CryptoHandle,
    pub wrapping_key: CryptoHandle,
    pub algorithm: Algorithm,
}

impl WrapKeyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        w.put_u8(self.format.to_wire());
        self.key.write(&mut w);
        self.wrapping_key.write(&mut w);
        self.algorithm.write(&mut w);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = WrapKeyRequest {
            provider_id: r.take_str()?,
            format: KeyFormat::from_wire(r.take_u8()?)?,
            key: CryptoHandle::read(&mut r)?,
            wrapping_key: CryptoHandle::read(&mut r)?,
            algorithm: Algorithm::read(&mut r)?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `UnwrapKey(format, data, unwrapping_key, unwrap_alg, unwrapped_alg, extractable, usages)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnwrapKeyRequest {
    pub provider_id: String,
    pub format: KeyFormat,
    pub data: Vec<u8>,
    pub unwrapping_key: CryptoHandle,
    pub unwrap_algorithm: Algorithm,
    pub unwrapped_algorithm: Algorithm,
    pub extractable: bool,
    pub usages: Vec<KeyUsage>,
}

impl UnwrapKeyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        w.put_u8(self.format.to_wire());
        w.put_bytes(&self.data);
        self.unwrapping_key.write(&mut w);
        self.unwrap_algorithm.write(&mut w);
        self.unwrapped_algorithm.write(&mut w);
        w.put_bool(self.extractable);
        write_usages(&mut w, &self.usages);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = UnwrapKeyRequest {
            provider_id: r.take_str()?,
            format: KeyFormat::from_wire(r.take_u8()?)?,
            data: r.take_bytes()?,
            unwrapping_key: CryptoHandle::read(&mut r)?,
            unwrap_algorithm: Algorithm::read(&mut r)?,
            unwrapped_algorithm: Algorithm::read(&mut r)?,
            extractable: r.take_bool()?,
            usages: read_usages(&mut r)?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `KeyStorage.GetItem` / `CertStorage.GetItem`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageGetItemRequest {
    pub provider_id: String,
    pub index: String,
    pub algorithm: Option<Algorithm>,
    pub usages: Option<Vec<KeyUsage>>,
}

impl StorageGetItemRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        w.put_str(&self.index);
        w.put_opt(self.algorithm.as_ref(), |w, v| v.write(w));
        w.put_opt(self.usages.as_deref(), write_usages);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = StorageGetItemRequest {
            provider_id: r.take_str()?,
            index: r.take_str()?,
            algorithm: r.take_opt(Algorithm::read)?,
            usages: r.take_opt(read_usages)?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `KeyStorage.SetItem` / `CertStorage.SetItem`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageSetItemRequest {
    pub provider_id: String,
    pub item: CryptoHandle,
}

impl StorageSetItemRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        self.item.write(&mut w);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = StorageSetItemRequest {
            provider_id: r.take_str()?,
            item: CryptoHandle::read(&mut r)?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `KeyStorage.RemoveItem` / `CertStorage.RemoveItem`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRemoveItemRequest {
    pub provider_id: String,
    pub index: String,
}

impl StorageRemoveItemRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        w.put_str(&self.index);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = StorageRemoveItemRequest {
            provider_id: r.take_str()?,
            index: r.take_str()?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `CertStorage.ImportCert(type, data, alg, usages)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportCertRequest {
    pub provider_id: String,
    pub kind: HandleKind,
    pub data: Vec<u8>,
    pub algorithm: Algorithm,
    pub usages: Vec<KeyUsage>,
}

impl ImportCertRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        w.put_u8(self.kind.to_wire());
        w.put_bytes(&self.data);
        self.algorithm.write(&mut w);
        write_usages(&mut w, &self.usages);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = ImportCertRequest {
            provider_id: r.take_str()?,
            kind: HandleKind::from_wire(r.take_u8()?)?,
            data: r.take_bytes()?,
            algorithm: Algorithm::read(&mut r)?,
            usages: read_usages(&mut r)?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// `CertStorage.ExportCert(format, cert)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportCertRequest {
    pub provider_id: String,
    pub format: CertFormat,
    pub item: CryptoHandle,
}

impl ExportCertRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.provider_id);
        w.put_u8(self.format.to_wire());
        self.item.write(&mut w);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let request = ExportCertRequest {
            provider_id: r.take_str()?,
            format: CertFormat::from_wire(r.take_u8()?)?,
            item: CryptoHandle::read(&mut r)?,
        };
        r.finish()?;
        Ok(request)
    }
}

/// Certificate export formats
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertFormat {
    /// DER bytes
    Raw,
    /// PEM text
    Pem,
}

impl CertFormat {
    fn to_wire(self) -> u8 {
        match self {
            CertFormat::Raw => 0,
            CertFormat::Pem => 1,
        }
    }

    fn from_wire(value: u8) -> ProtoResult<Self> {
        match value {
            0 => Ok(CertFormat::Raw),
            1 => Ok(CertFormat::Pem),
            other => Err(ProtoError::InvalidValue(format!(
                "certificate format {:#x}",
                other
            ))),
        }
    }
}

/// `GenerateKey` result: a single key or a pair sharing one thumbprint
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GeneratedKey {
    Single(KeyDescriptor),
    Pair {
        public: KeyDescriptor,
        private: KeyDescriptor,
    },
}

impl GeneratedKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        match self {
            GeneratedKey::Single(key) => {
                w.put_u8(1);
                key.write(&mut w);
            }
            GeneratedKey::Pair { public, private } => {
                w.put_u8(2);
                public.write(&mut w);
                private.write(&mut w);
            }
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let result = match r.take_u8()? {
            1 => GeneratedKey::Single(KeyDescriptor::read(&mut r)?),
            2 => GeneratedKey::Pair {
                public: KeyDescriptor::read(&mut r)?,
                private: KeyDescriptor::read(&mut r)?,
            },
            other => {
                return Err(ProtoError::InvalidValue(format!(
                    "generated key arity {:#x}",
                    other
                )))
            }
        };
        r.finish()?;
        Ok(result)
    }
}

/// Certificate descriptor: the certificate handle plus its public key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateDescriptor {
    pub handle: CryptoHandle,
    pub public_key: KeyDescriptor,
}

impl CertificateDescriptor {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        self.handle.write(&mut w);
        self.public_key.write(&mut w);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let descriptor = CertificateDescriptor {
            handle: CryptoHandle::read(&mut r)?,
            public_key: KeyDescriptor::read(&mut r)?,
        };
        r.finish()?;
        Ok(descriptor)
    }
}

/// `ProviderInfo` result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderInfoResult {
    pub name: String,
    pub version: String,
    pub providers: Vec<ProviderCryptoInfo>,
}

impl ProviderInfoResult {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_str(&self.name);
        w.put_str(&self.version);
        w.put_u32(self.providers.len() as u32);
        for provider in &self.providers {
            provider.write(&mut w);
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let name = r.take_str()?;
        let version = r.take_str()?;
        let count = r.take_u32()? as usize;
        let mut providers = Vec::with_capacity(count);
        for _ in 0..count {
            providers.push(ProviderCryptoInfo::read(&mut r)?);
        }
        r.finish()?;
        Ok(ProviderInfoResult {
            name,
            version,
            providers,
        })
    }
}

/// `token` event payload: providers that appeared and disappeared
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TokenEventPayload {
    pub added: Vec<ProviderCryptoInfo>,
    pub removed: Vec<ProviderCryptoInfo>,
}

impl TokenEventPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        w.put_u32(self.added.len() as u32);
        for provider in &self.added {
            provider.write(&mut w);
        }
        w.put_u32(self.removed.len() as u32);
        for provider in &self.removed {
            provider.write(&mut w);
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let added_count = r.take_u32()? as usize;
        let mut added = Vec::with_capacity(added_count);
        for _ in 0..added_count {
            added.push(ProviderCryptoInfo::read(&mut r)?);
        }
        let removed_count = r.take_u32()? as usize;
        let mut removed = Vec::with_capacity(removed_count);
        for _ in 0..removed_count {
            removed.push(ProviderCryptoInfo::read(&mut r)?);
        }
        r.finish()?;
        Ok(TokenEventPayload { added, removed })
    }
}

/// Encode a boolean result as a single byte
pub fn encode_bool(value: bool) -> Vec<u8> {
    vec![if value { 1 } else { 0 }]
}

/// Decode a single-byte boolean result
pub fn decode_bool(bytes: &[u8]) -> ProtoResult<bool> {
    match bytes {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(ProtoError::InvalidValue("boolean result".to_string())),
    }
}

/// Encode a list of storage indexes
pub fn encode_string_list(items: &[String]) -> Vec<u8> {
    let mut w = Writer::bare();
    w.put_u32(items.len() as u32);
    for item in items {
        w.put_str(item);
    }
    w.into_bytes()
}

/// Decode a list of storage indexes
pub fn decode_string_list(bytes: &[u8]) -> ProtoResult<Vec<String>> {
    let mut r = Reader::new(bytes);
    let count = r.take_u32()? as usize;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(r.take_str()?);
    }
    r.finish()?;
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(kind: HandleKind) -> CryptoHandle {
        CryptoHandle {
            id: "f00d".to_string(),
            provider_id: "software".to_string(),
            kind,
        }
    }

    #[test]
    fn test_digest_request_round_trip() {
        let request = DigestRequest {
            provider_id: "software".to_string(),
            algorithm: Algorithm::named("SHA-256"),
            data: b"hello".to_vec(),
        };
        assert_eq!(DigestRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn test_generate_key_request_round_trip() {
        let request = GenerateKeyRequest {
            provider_id: "software".to_string(),
            algorithm: Algorithm::named("Ed25519"),
            extractable: false,
            usages: vec![KeyUsage::Sign, KeyUsage::Verify],
        };
        assert_eq!(
            GenerateKeyRequest::decode(&request.encode()).unwrap(),
            request
        );
    }

    #[test]
    fn test_verify_request_round_trip() {
        let request = VerifyRequest {
            provider_id: "software".to_string(),
            algorithm: Algorithm::named("Ed25519"),
            key: handle(HandleKind::Public),
            signature: vec![7; 64],
            data: b"payload".to_vec(),
        };
        assert_eq!(VerifyRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn test_unwrap_request_round_trip() {
        let request = UnwrapKeyRequest {
            provider_id: "software".to_string(),
            format: KeyFormat::Raw,
            data: vec![1; 48],
            unwrapping_key: handle(HandleKind::Secret),
            unwrap_algorithm: Algorithm::aes_gcm(vec![0; 12]),
            unwrapped_algorithm: Algorithm::hmac("SHA-256"),
            extractable: true,
            usages: vec![KeyUsage::Sign],
        };
        assert_eq!(
            UnwrapKeyRequest::decode(&request.encode()).unwrap(),
            request
        );
    }

    #[test]
    fn test_get_item_request_optional_fields() {
        let with = StorageGetItemRequest {
            provider_id: "software".to_string(),
            index: "abc123".to_string(),
            algorithm: Some(Algorithm::hmac("SHA-256")),
            usages: Some(vec![KeyUsage::Sign]),
        };
        assert_eq!(
            StorageGetItemRequest::decode(&with.encode()).unwrap(),
            with
        );

        let without = StorageGetItemRequest {
            provider_id: "software".to_string(),
            index: "abc123".to_string(),
            algorithm: None,
            usages: None,
        };
        assert_eq!(
            StorageGetItemRequest::decode(&without.encode()).unwrap(),
            without
        );
    }

    #[test]
    fn test_generated_key_pair_round_trip() {
        let descriptor = KeyDescriptor {
            handle: handle(HandleKind::Public),
            algorithm: Algorithm::named("Ed25519"),
            extractable: true,
            usages: vec![KeyUsage::Verify],
        };
        let result = GeneratedKey::Pair {
            public: descriptor.clone(),
            private: KeyDescriptor {
                handle: handle(HandleKind::Private),
                usages: vec![KeyUsage::Sign],
                ..descriptor
            },
        };
        assert_eq!(GeneratedKey::decode(&result.encode()).unwrap(), result);
    }

    #[test]
    fn test_provider_info_round_trip() {
        let result = ProviderInfoResult {
            name: "keyport".to_string(),
            version: "0.3.0".to_string(),
            providers: vec![ProviderCryptoInfo {
                id: "software".to_string(),
                name: "Software provider".to_string(),
                removable: false,
            }],
        };
        assert_eq!(
            ProviderInfoResult::decode(&result.encode()).unwrap(),
            result
        );
    }

    #[test]
    fn test_token_event_round_trip() {
        let payload = TokenEventPayload {
            added: vec![ProviderCryptoInfo {
                id: "t1".to_string(),
                name: "TEST".to_string(),
                removable: true,
            }],
            removed: vec![],
        };
        assert_eq!(
            TokenEventPayload::decode(&payload.encode()).unwrap(),
            payload
        );
    }

    #[test]
    fn test_bool_and_string_list() {
        assert!(decode_bool(&encode_bool(true)).unwrap());
        assert!(!decode_bool(&encode_bool(false)).unwrap());
        assert!(decode_bool(&[2]).is_err());

        let items = vec!["a".to_string(), "b".to_string()];
        assert_eq!(decode_string_list(&encode_string_list(&items)).unwrap(), items);
    }
}
