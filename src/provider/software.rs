//! Software provider
//!
//! A pure in-process implementation of the subtle surface: SHA-2
//! digests, Ed25519 signatures, HMAC, AES-GCM, and X25519 key
//! agreement. Token-backed providers implement the same trait against
//! hardware; this one is always present and never requires login.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use async_trait::async_trait;
use ed25519_dalek::{Signer, Verifier};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::proto::{Algorithm, HandleKind, KeyFormat, KeyUsage};

use super::key::{key32, KeyMaterial, KeyObject};
use super::subtle::{default_key_bits, GeneratedKeyObjects, Subtle};
use super::{ProviderError, ProviderResult};

/// The always-available software provider id
pub const SOFTWARE_PROVIDER_ID: &str = "software";

/// Software implementation of the subtle surface
#[derive(Default)]
pub struct SoftwareSubtle;

impl SoftwareSubtle {
    pub fn new() -> Self {
        SoftwareSubtle
    }
}

fn require_any(key: &KeyObject, usages: &[KeyUsage]) -> ProviderResult<()> {
    if usages.iter().any(|u| key.usages.contains(u)) {
        Ok(())
    } else {
        Err(ProviderError::UsageDenied(usages[0]))
    }
}

fn filter_usages(requested: &[KeyUsage], allowed: &[KeyUsage]) -> Vec<KeyUsage> {
    requested
        .iter()
        .copied()
        .filter(|u| allowed.contains(u))
        .collect()
}

fn hmac_sign(hash: &str, key: &[u8], data: &[u8]) -> ProviderResult<Vec<u8>> {
    let bad_key = |_| ProviderError::InvalidKeyData("HMAC key".to_string());
    match hash {
        "SHA-256" => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(bad_key)?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        "SHA-384" => {
            let mut mac = <Hmac<Sha384> as Mac>::new_from_slice(key).map_err(bad_key)?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        "SHA-512" => {
            let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key).map_err(bad_key)?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        other => Err(ProviderError::UnsupportedAlgorithm(other.to_string())),
    }
}

fn hmac_hash_name<'a>(algorithm: &'a Algorithm, key: &'a KeyObject) -> &'a str {
    algorithm
        .hash
        .as_deref()
        .or(key.algorithm.hash.as_deref())
        .unwrap_or("SHA-256")
}

fn aes_iv<'a>(algorithm: &'a Algorithm) -> ProviderResult<&'a [u8]> {
    let iv = algorithm
        .iv
        .as_deref()
        .ok_or_else(|| ProviderError::InvalidAlgorithm("AES-GCM requires an iv".to_string()))?;
    if iv.len() != 12 {
        return Err(ProviderError::InvalidAlgorithm(
            "AES-GCM iv must be 12 bytes".to_string(),
        ));
    }
    Ok(iv)
}

fn aes_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> ProviderResult<Vec<u8>> {
    let nonce = aes_gcm::Nonce::from_slice(iv);
    let result = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .expect("key length checked")
            .encrypt(nonce, data),
        32 => Aes256Gcm::new_from_slice(key)
            .expect("key length checked")
            .encrypt(nonce, data),
        other => {
            return Err(ProviderError::InvalidKeyData(format!(
                "AES key of {} bytes",
                other
            )))
        }
    };
    result.map_err(|_| ProviderError::Operation("AES-GCM encrypt failed".to_string()))
}

fn aes_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> ProviderResult<Vec<u8>> {
    let nonce = aes_gcm::Nonce::from_slice(iv);
    let result = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .expect("key length checked")
            .decrypt(nonce, data),
        32 => Aes256Gcm::new_from_slice(key)
            .expect("key length checked")
            .decrypt(nonce, data),
        other => {
            return Err(ProviderError::InvalidKeyData(format!(
                "AES key of {} bytes",
                other
            )))
        }
    };
    result.map_err(|_| ProviderError::Operation("AES-GCM decrypt failed".to_string()))
}

#[async_trait]
impl Subtle for SoftwareSubtle {
    async fn digest(&self, algorithm: &Algorithm, data: &[u8]) -> ProviderResult<Vec<u8>> {
        match algorithm.name.as_str() {
            "SHA-256" => Ok(Sha256::digest(data).to_vec()),
            "SHA-384" => Ok(Sha384::digest(data).to_vec()),
            "SHA-512" => Ok(Sha512::digest(data).to_vec()),
            other => Err(ProviderError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    async fn generate_key(
        &self,
        algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> ProviderResult<GeneratedKeyObjects> {
        match algorithm.name.as_str() {
            "Ed25519" => {
                let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
                let private = KeyObject::new(
                    algorithm.clone(),
                    HandleKind::Private,
                    extractable,
                    filter_usages(usages, &[KeyUsage::Sign]),
                    KeyMaterial::Ed25519Private(signing.to_bytes()),
                );
                let public = KeyObject::new(
                    algorithm.clone(),
                    HandleKind::Public,
                    true,
                    filter_usages(usages, &[KeyUsage::Verify]),
                    KeyMaterial::Ed25519Public(signing.verifying_key().to_bytes()),
                );
                Ok(GeneratedKeyObjects::Pair { public, private })
            }
            "X25519" => {
                let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
                let public_bytes = x25519_dalek::PublicKey::from(&secret).to_bytes();
                let private = KeyObject::new(
                    algorithm.clone(),
                    HandleKind::Private,
                    extractable,
                    filter_usages(usages, &[KeyUsage::DeriveBits, KeyUsage::DeriveKey]),
                    KeyMaterial::X25519Private(secret.to_bytes()),
                );
                let public = KeyObject::new(
                    algorithm.clone(),
                    HandleKind::Public,
                    true,
                    Vec::new(),
                    KeyMaterial::X25519Public(public_bytes),
                );
                Ok(GeneratedKeyObjects::Pair { public, private })
            }
            "HMAC" => {
                let bits = algorithm
                    .length
                    .map(Ok)
                    .unwrap_or_else(|| default_key_bits(algorithm))?;
                if bits == 0 || bits % 8 != 0 {
                    return Err(ProviderError::InvalidAlgorithm(
                        "HMAC length must be a positive multiple of 8".to_string(),
                    ));
                }
                let mut material = vec![0u8; (bits / 8) as usize];
                OsRng.fill_bytes(&mut material);
                Ok(GeneratedKeyObjects::Single(KeyObject::new(
                    algorithm.clone(),
                    HandleKind::Secret,
                    extractable,
                    filter_usages(usages, &[KeyUsage::Sign, KeyUsage::Verify]),
                    KeyMaterial::Secret(material),
                )))
            }
            "AES-GCM" => {
                let bits = algorithm.length.unwrap_or(256);
                if bits != 128 && bits != 256 {
                    return Err(ProviderError::InvalidAlgorithm(format!(
                        "AES-GCM length {}",
                        bits
                    )));
                }
                let mut material = vec![0u8; (bits / 8) as usize];
                OsRng.fill_bytes(&mut material);
                Ok(GeneratedKeyObjects::Single(KeyObject::new(
                    algorithm.clone(),
                    HandleKind::Secret,
                    extractable,
                    filter_usages(
                        usages,
                        &[
                            KeyUsage::Encrypt,
                            KeyUsage::Decrypt,
                            KeyUsage::WrapKey,
                            KeyUsage::UnwrapKey,
                        ],
                    ),
                    KeyMaterial::Secret(material),
                )))
            }
            other => Err(ProviderError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    async fn sign(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        data: &[u8],
    ) -> ProviderResult<Vec<u8>> {
        key.require_usage(KeyUsage::Sign)?;
        match algorithm.name.as_str() {
            "Ed25519" => match &key.material {
                KeyMaterial::Ed25519Private(seed) => {
                    let signing = ed25519_dalek::SigningKey::from_bytes(seed);
                    Ok(signing.sign(data).to_bytes().to_vec())
                }
                _ => Err(ProviderError::WrongKeyType),
            },
            "HMAC" => match &key.material {
                KeyMaterial::Secret(secret) => {
                    hmac_sign(hmac_hash_name(algorithm, key), secret, data)
                }
                _ => Err(ProviderError::WrongKeyType),
            },
            other => Err(ProviderError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    async fn verify(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        signature: &[u8],
        data: &[u8],
    ) -> ProviderResult<bool> {
        key.require_usage(KeyUsage::Verify)?;
        match algorithm.name.as_str() {
            "Ed25519" => match &key.material {
                KeyMaterial::Ed25519Public(bytes) => {
                    let Ok(verifying) = ed25519_dalek::VerifyingKey::from_bytes(bytes) else {
                        return Ok(false);
                    };
                    let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
                        return Ok(false);
                    };
                    Ok(verifying.verify(data, &signature).is_ok())
                }
                _ => Err(ProviderError::WrongKeyType),
            },
            "HMAC" => match &key.material {
                KeyMaterial::Secret(secret) => {
                    let expected = hmac_sign(hmac_hash_name(algorithm, key), secret, data)?;
                    Ok(constant_time_eq(&expected, signature))
                }
                _ => Err(ProviderError::WrongKeyType),
            },
            other => Err(ProviderError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    async fn encrypt(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        data: &[u8],
    ) -> ProviderResult<Vec<u8>> {
        require_any(key, &[KeyUsage::Encrypt, KeyUsage::WrapKey])?;
        match algorithm.name.as_str() {
            "AES-GCM" => match &key.material {
                KeyMaterial::Secret(secret) => aes_encrypt(secret, aes_iv(algorithm)?, data),
                _ => Err(ProviderError::WrongKeyType),
            },
            other => Err(ProviderError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    async fn decrypt(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        data: &[u8],
    ) -> ProviderResult<Vec<u8>> {
        require_any(key, &[KeyUsage::Decrypt, KeyUsage::UnwrapKey])?;
        match algorithm.name.as_str() {
            "AES-GCM" => match &key.material {
                KeyMaterial::Secret(secret) => aes_decrypt(secret, aes_iv(algorithm)?, data),
                _ => Err(ProviderError::WrongKeyType),
            },
            other => Err(ProviderError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    async fn derive_bits(
        &self,
        algorithm: &Algorithm,
        key: &KeyObject,
        peer: &KeyObject,
        length: u32,
    ) -> ProviderResult<Vec<u8>> {
        require_any(key, &[KeyUsage::DeriveBits, KeyUsage::DeriveKey])?;
        match algorithm.name.as_str() {
            "X25519" => {
                let KeyMaterial::X25519Private(secret) = &key.material else {
                    return Err(ProviderError::WrongKeyType);
                };
                let KeyMaterial::X25519Public(public) = &peer.material else {
                    return Err(ProviderError::WrongKeyType);
                };
                if length == 0 || length > 256 || length % 8 != 0 {
                    return Err(ProviderError::InvalidAlgorithm(format!(
                        "derive length {}",
                        length
                    )));
                }

                let secret = x25519_dalek::StaticSecret::from(*secret);
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(*public));
                Ok(shared.as_bytes()[..(length / 8) as usize].to_vec())
            }
            other => Err(ProviderError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    async fn import_key(
        &self,
        format: KeyFormat,
        data: &[u8],
        algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> ProviderResult<KeyObject> {
        let material = match (algorithm.name.as_str(), format) {
            ("HMAC" | "AES-GCM", KeyFormat::Raw) => KeyMaterial::Secret(data.to_vec()),
            ("HMAC" | "AES-GCM", KeyFormat::Jwk) => match KeyObject::material_from_jwk(data)? {
                KeyMaterial::Secret(bytes) => KeyMaterial::Secret(bytes),
                _ => return Err(ProviderError::InvalidKeyData("expected 'oct' JWK".to_string())),
            },
            ("Ed25519", KeyFormat::Raw) => KeyMaterial::Ed25519Public(key32(data)?),
            ("X25519", KeyFormat::Raw) => KeyMaterial::X25519Public(key32(data)?),
            ("Ed25519" | "X25519", KeyFormat::Spki) => KeyObject::material_from_der(data)
                .ok_or_else(|| ProviderError::InvalidKeyData("no SPKI found".to_string()))?,
            ("Ed25519", KeyFormat::Pkcs8) => {
                let seed = strip_prefix(data, &super::key::ED25519_PKCS8_PREFIX)?;
                KeyMaterial::Ed25519Private(seed)
            }
            ("X25519", KeyFormat::Pkcs8) => {
                let secret = strip_prefix(data, &super::key::X25519_PKCS8_PREFIX)?;
                KeyMaterial::X25519Private(secret)
            }
            ("Ed25519" | "X25519", KeyFormat::Jwk) => KeyObject::material_from_jwk(data)?,
            (name, format) => {
                return Err(ProviderError::UnsupportedFormat(format!(
                    "{} as {}",
                    name,
                    format.as_str()
                )))
            }
        };

        if algorithm.name == "AES-GCM" {
            if let KeyMaterial::Secret(bytes) = &material {
                if bytes.len() != 16 && bytes.len() != 32 {
                    return Err(ProviderError::InvalidKeyData(format!(
                        "AES key of {} bytes",
                        bytes.len()
                    )));
                }
            }
        }

        let kind = match &material {
            KeyMaterial::Secret(_) => HandleKind::Secret,
            KeyMaterial::Ed25519Public(_) | KeyMaterial::X25519Public(_) => HandleKind::Public,
            KeyMaterial::Ed25519Private(_) | KeyMaterial::X25519Private(_) => HandleKind::Private,
        };

        Ok(KeyObject::new(
            algorithm.clone(),
            kind,
            extractable,
            usages.to_vec(),
            material,
        ))
    }

    async fn export_key(&self, format: KeyFormat, key: &KeyObject) -> ProviderResult<Vec<u8>> {
        if !key.extractable {
            return Err(ProviderError::NotExtractable);
        }
        match format {
            KeyFormat::Raw => key.raw_bytes(),
            KeyFormat::Jwk => key.to_jwk(),
            KeyFormat::Spki => key.spki_der(),
            KeyFormat::Pkcs8 => key.pkcs8_der(),
        }
    }
}

fn strip_prefix(data: &[u8], prefix: &[u8]) -> ProviderResult<[u8; 32]> {
    if data.len() == prefix.len() + 32 && data.starts_with(prefix) {
        key32(&data[prefix.len()..])
    } else {
        Err(ProviderError::InvalidKeyData("bad PKCS#8 document".to_string()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
