//! Shared wire types: handles, algorithms, usages, formats

use serde::{Deserialize, Serialize};

use super::codec::{Reader, Writer};
use super::{ProtoError, ProtoResult};

/// What a handle points at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    /// Public half of an asymmetric pair
    Public,
    /// Private half of an asymmetric pair
    Private,
    /// Symmetric key
    Secret,
    /// X.509 certificate
    X509,
    /// Certificate request
    Request,
}

impl HandleKind {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            HandleKind::Public => 0,
            HandleKind::Private => 1,
            HandleKind::Secret => 2,
            HandleKind::X509 => 3,
            HandleKind::Request => 4,
        }
    }

    pub(crate) fn from_wire(value: u8) -> ProtoResult<Self> {
        match value {
            0 => Ok(HandleKind::Public),
            1 => Ok(HandleKind::Private),
            2 => Ok(HandleKind::Secret),
            3 => Ok(HandleKind::X509),
            4 => Ok(HandleKind::Request),
            other => Err(ProtoError::InvalidValue(format!(
                "handle kind {:#x}",
                other
            ))),
        }
    }

    /// Wire-compatible name
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleKind::Public => "public",
            HandleKind::Private => "private",
            HandleKind::Secret => "secret",
            HandleKind::X509 => "x509",
            HandleKind::Request => "request",
        }
    }
}

/// Opaque reference to a server-resident crypto object
///
/// Never contains key material. Valid only for operations on the same
/// connected session that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CryptoHandle {
    /// Stable object identity (public-key thumbprint or random)
    pub id: String,
    /// Provider the object lives in
    pub provider_id: String,
    /// Object kind
    pub kind: HandleKind,
}

impl CryptoHandle {
    pub(crate) fn write(&self, w: &mut Writer) {
        w.put_str(&self.id);
        w.put_str(&self.provider_id);
        w.put_u8(self.kind.to_wire());
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> ProtoResult<Self> {
        Ok(CryptoHandle {
            id: r.take_str()?,
            provider_id: r.take_str()?,
            kind: HandleKind::from_wire(r.take_u8()?)?,
        })
    }

    /// Serialize standalone (used when a handle rides inside an algorithm)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        self.write(&mut w);
        w.into_bytes()
    }

    /// Deserialize standalone
    pub fn from_bytes(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let handle = Self::read(&mut r)?;
        r.finish()?;
        Ok(handle)
    }
}

/// WebCrypto algorithm descriptor
///
/// A name plus the optional parameters the gateway's operations need.
/// Unknown names travel untouched; the provider decides support.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Algorithm {
    /// Algorithm name, e.g. "SHA-256", "Ed25519", "HMAC", "AES-GCM", "X25519"
    pub name: String,
    /// Hash name for algorithms parameterized by one (HMAC)
    pub hash: Option<String>,
    /// Key length in bits (AES, derived keys)
    pub length: Option<u32>,
    /// Initialization vector (AES-GCM)
    pub iv: Option<Vec<u8>>,
    /// Peer public key as a serialized handle (X25519 derive)
    pub public: Option<CryptoHandle>,
}

impl Algorithm {
    /// Descriptor with just a name
    pub fn named(name: impl Into<String>) -> Self {
        Algorithm {
            name: name.into(),
            ..Default::default()
        }
    }

    /// HMAC with the given hash
    pub fn hmac(hash: impl Into<String>) -> Self {
        Algorithm {
            name: "HMAC".to_string(),
            hash: Some(hash.into()),
            ..Default::default()
        }
    }

    /// AES-GCM with the given IV
    pub fn aes_gcm(iv: Vec<u8>) -> Self {
        Algorithm {
            name: "AES-GCM".to_string(),
            iv: Some(iv),
            ..Default::default()
        }
    }

    /// Set the key length in bits
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    /// Set the peer public handle (key agreement)
    pub fn with_public(mut self, public: CryptoHandle) -> Self {
        self.public = Some(public);
        self
    }

    pub(crate) fn write(&self, w: &mut Writer) {
        w.put_str(&self.name);
        w.put_opt(self.hash.as_deref(), |w, v| w.put_str(v));
        w.put_opt(self.length, |w, v| w.put_u32(v));
        w.put_opt(self.iv.as_deref(), |w, v| w.put_bytes(v));
        w.put_opt(self.public.as_ref(), |w, v| v.write(w));
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> ProtoResult<Self> {
        Ok(Algorithm {
            name: r.take_str()?,
            hash: r.take_opt(|r| r.take_str())?,
            length: r.take_opt(|r| r.take_u32())?,
            iv: r.take_opt(|r| r.take_bytes())?,
            public: r.take_opt(CryptoHandle::read)?,
        })
    }
}

/// Permitted key operations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum KeyUsage {
    Sign,
    Verify,
    Encrypt,
    Decrypt,
    DeriveBits,
    DeriveKey,
    WrapKey,
    UnwrapKey,
}

impl KeyUsage {
    /// Wire-compatible name
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyUsage::Sign => "sign",
            KeyUsage::Verify => "verify",
            KeyUsage::Encrypt => "encrypt",
            KeyUsage::Decrypt => "decrypt",
            KeyUsage::DeriveBits => "deriveBits",
            KeyUsage::DeriveKey => "deriveKey",
            KeyUsage::WrapKey => "wrapKey",
            KeyUsage::UnwrapKey => "unwrapKey",
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            KeyUsage::Sign => 0,
            KeyUsage::Verify => 1,
            KeyUsage::Encrypt => 2,
            KeyUsage::Decrypt => 3,
            KeyUsage::DeriveBits => 4,
            KeyUsage::DeriveKey => 5,
            KeyUsage::WrapKey => 6,
            KeyUsage::UnwrapKey => 7,
        }
    }

    fn from_wire(value: u8) -> ProtoResult<Self> {
        match value {
            0 => Ok(KeyUsage::Sign),
            1 => Ok(KeyUsage::Verify),
            2 => Ok(KeyUsage::Encrypt),
            3 => Ok(KeyUsage::Decrypt),
            4 => Ok(KeyUsage::DeriveBits),
            5 => Ok(KeyUsage::DeriveKey),
            6 => Ok(KeyUsage::WrapKey),
            7 => Ok(KeyUsage::UnwrapKey),
            other => Err(ProtoError::InvalidValue(format!("key usage {:#x}", other))),
        }
    }
}

pub(crate) fn write_usages(w: &mut Writer, usages: &[KeyUsage]) {
    w.put_u8(usages.len() as u8);
    for usage in usages {
        w.put_u8(usage.to_wire());
    }
}

pub(crate) fn read_usages(r: &mut Reader<'_>) -> ProtoResult<Vec<KeyUsage>> {
    let count = r.take_u8()? as usize;
    let mut usages = Vec::with_capacity(count);
    for _ in 0..count {
        usages.push(KeyUsage::from_wire(r.take_u8()?)?);
    }
    Ok(usages)
}

/// Key import/export formats
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyFormat {
    /// Raw key bytes
    Raw,
    /// JSON Web Key, UTF-8 JSON
    Jwk,
    /// SubjectPublicKeyInfo DER
    Spki,
    /// PKCS#8 DER
    Pkcs8,
}

impl KeyFormat {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            KeyFormat::Raw => 0,
            KeyFormat::Jwk => 1,
            KeyFormat::Spki => 2,
            KeyFormat::Pkcs8 => 3,
        }
    }

    pub(crate) fn from_wire(value: u8) -> ProtoResult<Self> {
        match value {
            0 => Ok(KeyFormat::Raw),
            1 => Ok(KeyFormat::Jwk),
            2 => Ok(KeyFormat::Spki),
            3 => Ok(KeyFormat::Pkcs8),
            other => Err(ProtoError::InvalidValue(format!("key format {:#x}", other))),
        }
    }

    /// Wire-compatible name
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFormat::Raw => "raw",
            KeyFormat::Jwk => "jwk",
            KeyFormat::Spki => "spki",
            KeyFormat::Pkcs8 => "pkcs8",
        }
    }
}

/// Full description of a key as returned to clients
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDescriptor {
    /// Opaque reference for subsequent operations
    pub handle: CryptoHandle,
    /// Algorithm the key was created under
    pub algorithm: Algorithm,
    /// Whether the material may leave the provider
    pub extractable: bool,
    /// Permitted operations
    pub usages: Vec<KeyUsage>,
}

impl KeyDescriptor {
    pub(crate) fn write(&self, w: &mut Writer) {
        self.handle.write(w);
        self.algorithm.write(w);
        w.put_bool(self.extractable);
        write_usages(w, &self.usages);
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> ProtoResult<Self> {
        Ok(KeyDescriptor {
            handle: CryptoHandle::read(r)?,
            algorithm: Algorithm::read(r)?,
            extractable: r.take_bool()?,
            usages: read_usages(r)?,
        })
    }

    /// Serialize standalone
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::bare();
        self.write(&mut w);
        w.into_bytes()
    }

    /// Deserialize standalone
    pub fn from_bytes(bytes: &[u8]) -> ProtoResult<Self> {
        let mut r = Reader::new(bytes);
        let descriptor = Self::read(&mut r)?;
        r.finish()?;
        Ok(descriptor)
    }
}

/// Static information about one provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCryptoInfo {
    /// Stable provider id
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Whether the provider is backed by removable hardware
    pub removable: bool,
}

impl ProviderCryptoInfo {
    pub(crate) fn write(&self, w: &mut Writer) {
        w.put_str(&self.id);
        w.put_str(&self.name);
        w.put_bool(self.removable);
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> ProtoResult<Self> {
        Ok(ProviderCryptoInfo {
            id: r.take_str()?,
            name: r.take_str()?,
            removable: r.take_bool()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_round_trip() {
        let handle = CryptoHandle {
            id: "a5f3".to_string(),
            provider_id: "software".to_string(),
            kind: HandleKind::Private,
        };

        let restored = CryptoHandle::from_bytes(&handle.to_bytes()).unwrap();
        assert_eq!(restored, handle);
    }

    #[test]
    fn test_algorithm_round_trip() {
        let algorithms = vec![
            Algorithm::named("SHA-256"),
            Algorithm::hmac("SHA-512").with_length(512),
            Algorithm::aes_gcm(vec![0u8; 12]),
            Algorithm::named("X25519").with_public(CryptoHandle {
                id: "beef".to_string(),
                provider_id: "software".to_string(),
                kind: HandleKind::Public,
            }),
        ];

        for algorithm in algorithms {
            let mut w = Writer::bare();
            algorithm.write(&mut w);
            let bytes = w.into_bytes();

            let mut r = Reader::new(&bytes);
            let restored = Algorithm::read(&mut r).unwrap();
            r.finish().unwrap();
            assert_eq!(restored, algorithm);
        }
    }

    #[test]
    fn test_descriptor_round_trip() {
        let descriptor = KeyDescriptor {
            handle: CryptoHandle {
                id: "cafe".to_string(),
                provider_id: "software".to_string(),
                kind: HandleKind::Secret,
            },
            algorithm: Algorithm::hmac("SHA-256"),
            extractable: true,
            usages: vec![KeyUsage::Sign, KeyUsage::Verify],
        };

        let restored = KeyDescriptor::from_bytes(&descriptor.to_bytes()).unwrap();
        assert_eq!(restored, descriptor);
    }

    #[test]
    fn test_unknown_kind_fails() {
        assert!(HandleKind::from_wire(9).is_err());
    }

    #[test]
    fn test_unknown_usage_fails() {
        let mut w = Writer::bare();
        w.put_u8(1);
        w.put_u8(99);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert!(read_usages(&mut r).is_err());
    }
}
