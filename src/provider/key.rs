//! Live key objects
//!
//! Keys stay resident inside the process; what crosses the wire is only
//! the opaque handle. Conversion helpers cover the formats the gateway
//! speaks: raw bytes, JWK, SPKI and PKCS#8 DER for the OKP curves.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::json;

use crate::proto::{Algorithm, HandleKind, KeyUsage};

use super::{ProviderError, ProviderResult};

/// SPKI prefix for Ed25519 (OID 1.3.101.112), followed by 32 key bytes
pub const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// SPKI prefix for X25519 (OID 1.3.101.110), followed by 32 key bytes
pub const X25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

/// PKCS#8 prefix for Ed25519, followed by the 32 seed bytes
pub const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];

/// PKCS#8 prefix for X25519, followed by the 32 secret bytes
pub const X25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x04, 0x22, 0x04,
    0x20,
];

/// Raw key material held by a provider
#[derive(Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum KeyMaterial {
    Ed25519Private([u8; 32]),
    Ed25519Public([u8; 32]),
    X25519Private([u8; 32]),
    X25519Public([u8; 32]),
    Secret(Vec<u8>),
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print material
        let name = match self {
            KeyMaterial::Ed25519Private(_) => "Ed25519Private",
            KeyMaterial::Ed25519Public(_) => "Ed25519Public",
            KeyMaterial::X25519Private(_) => "X25519Private",
            KeyMaterial::X25519Public(_) => "X25519Public",
            KeyMaterial::Secret(_) => "Secret",
        };
        write!(f, "KeyMaterial::{}(..)", name)
    }
}

/// A live key resident in a provider
#[derive(Clone, Debug)]
pub struct KeyObject {
    /// Algorithm the key was created under
    pub algorithm: Algorithm,
    /// public / private / secret
    pub kind: HandleKind,
    /// Whether export of the material is allowed
    pub extractable: bool,
    /// Permitted operations
    pub usages: Vec<KeyUsage>,
    pub(crate) material: KeyMaterial,
}

impl KeyObject {
    pub(crate) fn new(
        algorithm: Algorithm,
        kind: HandleKind,
        extractable: bool,
        usages: Vec<KeyUsage>,
        material: KeyMaterial,
    ) -> Self {
        KeyObject {
            algorithm,
            kind,
            extractable,
            usages,
            material,
        }
    }

    /// Fail unless the key permits `usage`
    pub fn require_usage(&self, usage: KeyUsage) -> ProviderResult<()> {
        if self.usages.contains(&usage) {
            Ok(())
        } else {
            Err(ProviderError::UsageDenied(usage))
        }
    }

    /// The public half of an asymmetric private key, if this is one
    pub fn public_half(&self) -> Option<KeyObject> {
        let material = match &self.material {
            KeyMaterial::Ed25519Private(seed) => {
                let signing = ed25519_dalek::SigningKey::from_bytes(seed);
                KeyMaterial::Ed25519Public(signing.verifying_key().to_bytes())
            }
            KeyMaterial::X25519Private(secret) => {
                let secret = x25519_dalek::StaticSecret::from(*secret);
                KeyMaterial::X25519Public(x25519_dalek::PublicKey::from(&secret).to_bytes())
            }
            _ => return None,
        };

        Some(KeyObject {
            algorithm: self.algorithm.clone(),
            kind: HandleKind::Public,
            extractable: true,
            usages: public_usages(&self.algorithm.name),
            material,
        })
    }

    /// SPKI DER for public keys
    pub fn spki_der(&self) -> ProviderResult<Vec<u8>> {
        let (prefix, bytes) = match &self.material {
            KeyMaterial::Ed25519Public(bytes) => (&ED25519_SPKI_PREFIX, bytes),
            KeyMaterial::X25519Public(bytes) => (&X25519_SPKI_PREFIX, bytes),
            _ => {
                return Err(ProviderError::UnsupportedFormat(
                    "spki export requires a public key".to_string(),
                ))
            }
        };
        let mut der = Vec::with_capacity(prefix.len() + 32);
        der.extend_from_slice(prefix);
        der.extend_from_slice(bytes);
        Ok(der)
    }

    /// PKCS#8 DER for private keys
    pub fn pkcs8_der(&self) -> ProviderResult<Vec<u8>> {
        let (prefix, bytes) = match &self.material {
            KeyMaterial::Ed25519Private(bytes) => (&ED25519_PKCS8_PREFIX, bytes),
            KeyMaterial::X25519Private(bytes) => (&X25519_PKCS8_PREFIX, bytes),
            _ => {
                return Err(ProviderError::UnsupportedFormat(
                    "pkcs8 export requires a private key".to_string(),
                ))
            }
        };
        let mut der = Vec::with_capacity(prefix.len() + 32);
        der.extend_from_slice(prefix);
        der.extend_from_slice(bytes);
        Ok(der)
    }

    /// Raw bytes: the key itself for secrets, the curve point for publics
    pub fn raw_bytes(&self) -> ProviderResult<Vec<u8>> {
        match &self.material {
            KeyMaterial::Secret(bytes) => Ok(bytes.clone()),
            KeyMaterial::Ed25519Public(bytes) | KeyMaterial::X25519Public(bytes) => {
                Ok(bytes.to_vec())
            }
            _ => Err(ProviderError::UnsupportedFormat(
                "raw export requires a secret or public key".to_string(),
            )),
        }
    }

    /// JWK document as UTF-8 JSON
    pub fn to_jwk(&self) -> ProviderResult<Vec<u8>> {
        let value = match &self.material {
            KeyMaterial::Ed25519Public(bytes) => json!({
                "kty": "OKP",
                "crv": "Ed25519",
                "x": URL_SAFE_NO_PAD.encode(bytes),
            }),
            KeyMaterial::Ed25519Private(seed) => {
                let signing = ed25519_dalek::SigningKey::from_bytes(seed);
                json!({
                    "kty": "OKP",
                    "crv": "Ed25519",
                    "x": URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes()),
                    "d": URL_SAFE_NO_PAD.encode(seed),
                })
            }
            KeyMaterial::X25519Public(bytes) => json!({
                "kty": "OKP",
                "crv": "X25519",
                "x": URL_SAFE_NO_PAD.encode(bytes),
            }),
            KeyMaterial::X25519Private(secret) => {
                let public = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(
                    *secret,
                ));
                json!({
                    "kty": "OKP",
                    "crv": "X25519",
                    "x": URL_SAFE_NO_PAD.encode(public.to_bytes()),
                    "d": URL_SAFE_NO_PAD.encode(secret),
                })
            }
            KeyMaterial::Secret(bytes) => json!({
                "kty": "oct",
                "k": URL_SAFE_NO_PAD.encode(bytes),
            }),
        };
        Ok(serde_json::to_vec(&value).expect("jwk serialization cannot fail"))
    }

    /// Parse a JWK document into material for `algorithm`
    pub fn material_from_jwk(data: &[u8]) -> ProviderResult<KeyMaterial> {
        let value: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| ProviderError::InvalidKeyData(format!("bad JWK: {}", e)))?;

        let field = |name: &str| -> ProviderResult<Vec<u8>> {
            let text = value
                .get(name)
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProviderError::InvalidKeyData(format!("JWK missing '{}'", name)))?;
            URL_SAFE_NO_PAD
                .decode(text)
                .map_err(|_| ProviderError::InvalidKeyData(format!("JWK field '{}'", name)))
        };

        let kty = value.get("kty").and_then(|v| v.as_str()).unwrap_or("");
        match kty {
            "oct" => Ok(KeyMaterial::Secret(field("k")?)),
            "OKP" => {
                let crv = value.get("crv").and_then(|v| v.as_str()).unwrap_or("");
                let private = value.get("d").is_some();
                match (crv, private) {
                    ("Ed25519", true) => Ok(KeyMaterial::Ed25519Private(key32(&field("d")?)?)),
                    ("Ed25519", false) => Ok(KeyMaterial::Ed25519Public(key32(&field("x")?)?)),
                    ("X25519", true) => Ok(KeyMaterial::X25519Private(key32(&field("d")?)?)),
                    ("X25519", false) => Ok(KeyMaterial::X25519Public(key32(&field("x")?)?)),
                    _ => Err(ProviderError::InvalidKeyData(format!(
                        "unsupported JWK curve '{}'",
                        crv
                    ))),
                }
            }
            other => Err(ProviderError::InvalidKeyData(format!(
                "unsupported JWK key type '{}'",
                other
            ))),
        }
    }

    /// Recover public material from a DER blob by scanning for a known
    /// SubjectPublicKeyInfo pattern (certificates and requests embed one)
    pub fn material_from_der(der: &[u8]) -> Option<KeyMaterial> {
        for window_start in 0..der.len().saturating_sub(44) {
            let window = &der[window_start..];
            if window.starts_with(&ED25519_SPKI_PREFIX) {
                return Some(KeyMaterial::Ed25519Public(
                    window[12..44].try_into().unwrap(),
                ));
            }
            if window.starts_with(&X25519_SPKI_PREFIX) {
                return Some(KeyMaterial::X25519Public(
                    window[12..44].try_into().unwrap(),
                ));
            }
        }
        None
    }
}

/// Usages the public half of a pair inherits
pub(crate) fn public_usages(algorithm: &str) -> Vec<KeyUsage> {
    match algorithm {
        "Ed25519" => vec![KeyUsage::Verify],
        _ => Vec::new(),
    }
}

pub(crate) fn key32(bytes: &[u8]) -> ProviderResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| ProviderError::InvalidKeyData("expected 32 key bytes".to_string()))
}
