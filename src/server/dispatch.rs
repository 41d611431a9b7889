//! Action routing
//!
//! A tag-indexed table of handlers, registered once at startup. Each
//! inbound envelope is decoded, executed against the provider and the
//! connection's handle registry, and answered with exactly one result
//! envelope; any error becomes the result's in-band error string.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::proto::{
    self, tags, ActionEnvelope, Algorithm, CryptoHandle, EventEnvelope, Envelope, GeneratedKey,
    HandleKind, KeyDescriptor, Outcome, ResultEnvelope,
};
use crate::provider::{CertObject, GeneratedKeyObjects, KeyObject, Provider, ProviderRegistry};
use crate::registry::{key_object_id, public_key_thumbprint, CryptoObject, HandleRegistry};

use super::session::{PromptOutcome, SecretPrompt, SessionHandle, SessionState};
use super::GatewayError;

/// Everything one connection's handlers can reach
pub struct ConnCtx {
    /// Live providers
    pub providers: Arc<ProviderRegistry>,
    /// This connection's handle table
    pub handles: Arc<HandleRegistry>,
    /// This connection's session
    pub session: SessionHandle,
    /// Host prompt capability
    pub prompt: Arc<dyn SecretPrompt>,
    /// Deadline for login prompts
    pub login_timeout: Duration,
    /// Gateway name for `ProviderInfo`
    pub gateway_name: String,
    /// Gateway version for `ProviderInfo`
    pub gateway_version: String,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, GatewayError>> + Send>>;
type Handler = Box<dyn Fn(Arc<ConnCtx>, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Tag-indexed handler table
pub struct Dispatcher {
    handlers: HashMap<&'static str, Handler>,
}

impl Dispatcher {
    /// Build the table with every action registered
    pub fn new() -> Self {
        let mut dispatcher = Dispatcher {
            handlers: HashMap::new(),
        };

        dispatcher.register(tags::PROVIDER_INFO, provider_info);
        dispatcher.register(tags::PROVIDER_GET_CRYPTO, provider_get_crypto);
        dispatcher.register(tags::IS_LOGGED_IN, is_logged_in);
        dispatcher.register(tags::LOGIN, login);

        dispatcher.register(tags::DIGEST, digest);
        dispatcher.register(tags::GENERATE_KEY, generate_key);
        dispatcher.register(tags::SIGN, sign);
        dispatcher.register(tags::VERIFY, verify);
        dispatcher.register(tags::ENCRYPT, encrypt);
        dispatcher.register(tags::DECRYPT, decrypt);
        dispatcher.register(tags::DERIVE_BITS, derive_bits);
        dispatcher.register(tags::DERIVE_KEY, derive_key);
        dispatcher.register(tags::IMPORT_KEY, import_key);
        dispatcher.register(tags::EXPORT_KEY, export_key);
        dispatcher.register(tags::WRAP_KEY, wrap_key);
        dispatcher.register(tags::UNWRAP_KEY, unwrap_key);

        dispatcher.register(tags::KEY_STORAGE_GET_ITEM, key_storage_get_item);
        dispatcher.register(tags::KEY_STORAGE_SET_ITEM, key_storage_set_item);
        dispatcher.register(tags::KEY_STORAGE_REMOVE_ITEM, key_storage_remove_item);
        dispatcher.register(tags::KEY_STORAGE_KEYS, key_storage_keys);
        dispatcher.register(tags::KEY_STORAGE_CLEAR, key_storage_clear);

        dispatcher.register(tags::CERT_STORAGE_GET_ITEM, cert_storage_get_item);
        dispatcher.register(tags::CERT_STORAGE_SET_ITEM, cert_storage_set_item);
        dispatcher.register(tags::CERT_STORAGE_REMOVE_ITEM, cert_storage_remove_item);
        dispatcher.register(tags::CERT_STORAGE_KEYS, cert_storage_keys);
        dispatcher.register(tags::CERT_STORAGE_CLEAR, cert_storage_clear);
        dispatcher.register(tags::CERT_STORAGE_IMPORT, cert_storage_import);
        dispatcher.register(tags::CERT_STORAGE_EXPORT, cert_storage_export);

        dispatcher
    }

    fn register<F, Fut>(&mut self, tag: &'static str, handler: F)
    where
        F: Fn(Arc<ConnCtx>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, GatewayError>> + Send + 'static,
    {
        self.handlers
            .insert(tag, Box::new(move |ctx, payload| Box::pin(handler(ctx, payload))));
    }

    /// Run one action to its result envelope
    pub async fn dispatch(&self, ctx: Arc<ConnCtx>, envelope: ActionEnvelope) -> ResultEnvelope {
        let outcome = match self.handlers.get(envelope.action.as_str()) {
            Some(handler) => match handler(ctx, envelope.payload).await {
                Ok(data) => Outcome::Data(data),
                Err(error) => Outcome::Error(error.to_string()),
            },
            None => Outcome::Error(
                GatewayError::UnknownAction(envelope.action.clone()).to_string(),
            ),
        };

        ResultEnvelope {
            action_id: envelope.action_id,
            action: envelope.action,
            outcome,
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn provider_of(ctx: &ConnCtx, id: &str) -> Result<Arc<Provider>, GatewayError> {
    Ok(ctx.providers.get(id).await?)
}

fn descriptor(handle: CryptoHandle, key: &KeyObject) -> KeyDescriptor {
    KeyDescriptor {
        handle,
        algorithm: key.algorithm.clone(),
        extractable: key.extractable,
        usages: key.usages.clone(),
    }
}

/// Insert a key into the connection's table under a fresh identity
fn register_key(
    ctx: &ConnCtx,
    provider_id: &str,
    key: Arc<KeyObject>,
) -> Result<KeyDescriptor, GatewayError> {
    let handle = CryptoHandle {
        id: key_object_id(&key)?,
        provider_id: provider_id.to_string(),
        kind: key.kind,
    };
    ctx.handles
        .insert(handle.clone(), CryptoObject::Key(key.clone()));
    Ok(descriptor(handle, &key))
}

// ---------------------------------------------------------------------
// Provider family
// ---------------------------------------------------------------------

async fn provider_info(ctx: Arc<ConnCtx>, _payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    Ok(proto::ProviderInfoResult {
        name: ctx.gateway_name.clone(),
        version: ctx.gateway_version.clone(),
        providers: ctx.providers.infos().await,
    }
    .encode())
}

async fn provider_get_crypto(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ProviderRequest::decode(&payload)?;
    // Existence check only; clients cache details from ProviderInfo
    provider_of(&ctx, &request.provider_id).await?;
    Ok(Vec::new())
}

async fn is_logged_in(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ProviderRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    Ok(proto::encode_bool(provider.is_logged_in()))
}

async fn login(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ProviderRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;

    if provider.requires_pin() && !provider.is_logged_in() {
        let message = format!("PIN for {}", provider.info.name);
        let outcome = tokio::time::timeout(
            ctx.login_timeout,
            ctx.prompt.prompt(&message, ctx.login_timeout),
        )
        .await;

        match outcome {
            Err(_) | Ok(PromptOutcome::TimedOut) => return Err(GatewayError::LoginTimeout),
            Ok(PromptOutcome::Cancelled) => return Err(GatewayError::LoginCancelled),
            Ok(PromptOutcome::Secret(_)) => provider.set_logged_in(),
        }
    }

    ctx.session.set_state(SessionState::OpenAuth).await;
    ctx.session
        .push(Envelope::Event(EventEnvelope {
            event: proto::events::AUTHORIZED.to_string(),
            payload: Vec::new(),
        }))
        .await;
    Ok(Vec::new())
}

// ---------------------------------------------------------------------
// Subtle family
// ---------------------------------------------------------------------

async fn digest(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::DigestRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    Ok(provider
        .subtle
        .digest(&request.algorithm, &request.data)
        .await?)
}

async fn generate_key(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::GenerateKeyRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let generated = provider
        .subtle
        .generate_key(&request.algorithm, request.extractable, &request.usages)
        .await?;

    // Handles are registered before the reply is sent
    let result = match generated {
        GeneratedKeyObjects::Single(key) => {
            let key = Arc::new(key);
            GeneratedKey::Single(register_key(&ctx, &request.provider_id, key)?)
        }
        GeneratedKeyObjects::Pair { public, private } => {
            // Both halves share the public-key thumbprint
            let thumbprint = public_key_thumbprint(&public)?;
            let public = Arc::new(public);
            let private = Arc::new(private);

            let public_handle = CryptoHandle {
                id: thumbprint.clone(),
                provider_id: request.provider_id.clone(),
                kind: HandleKind::Public,
            };
            let private_handle = CryptoHandle {
                id: thumbprint,
                provider_id: request.provider_id.clone(),
                kind: HandleKind::Private,
            };
            ctx.handles
                .insert(public_handle.clone(), CryptoObject::Key(public.clone()));
            ctx.handles
                .insert(private_handle.clone(), CryptoObject::Key(private.clone()));

            GeneratedKey::Pair {
                public: descriptor(public_handle, &public),
                private: descriptor(private_handle, &private),
            }
        }
    };

    Ok(result.encode())
}

async fn sign(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::SignRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let key = ctx.handles.lookup_key(&request.key)?;
    Ok(provider
        .subtle
        .sign(&request.algorithm, &key, &request.data)
        .await?)
}

async fn verify(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::VerifyRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let key = ctx.handles.lookup_key(&request.key)?;
    let valid = provider
        .subtle
        .verify(&request.algorithm, &key, &request.signature, &request.data)
        .await?;
    Ok(proto::encode_bool(valid))
}

async fn encrypt(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::CipherRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let key = ctx.handles.lookup_key(&request.key)?;
    Ok(provider
        .subtle
        .encrypt(&request.algorithm, &key, &request.data)
        .await?)
}

async fn decrypt(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::CipherRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let key = ctx.handles.lookup_key(&request.key)?;
    Ok(provider
        .subtle
        .decrypt(&request.algorithm, &key, &request.data)
        .await?)
}

/// Resolve `algorithm.public`, the peer handle key-agreement rides in
fn peer_of(ctx: &ConnCtx, algorithm: &Algorithm) -> Result<Arc<KeyObject>, GatewayError> {
    let handle = algorithm.public.as_ref().ok_or_else(|| {
        GatewayError::from(crate::provider::ProviderError::InvalidAlgorithm(
            "key agreement requires a peer public key".to_string(),
        ))
    })?;
    Ok(ctx.handles.lookup_key(handle)?)
}

async fn derive_bits(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::DeriveBitsRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let key = ctx.handles.lookup_key(&request.key)?;
    let peer = peer_of(&ctx, &request.algorithm)?;
    Ok(provider
        .subtle
        .derive_bits(&request.algorithm, &key, &peer, request.length)
        .await?)
}

async fn derive_key(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::DeriveKeyRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let key = ctx.handles.lookup_key(&request.key)?;
    let peer = peer_of(&ctx, &request.algorithm)?;
    let derived = provider
        .subtle
        .derive_key(
            &request.algorithm,
            &key,
            &peer,
            &request.derived_algorithm,
            request.extractable,
            &request.usages,
        )
        .await?;
    let descriptor = register_key(&ctx, &request.provider_id, Arc::new(derived))?;
    Ok(descriptor.to_bytes())
}

async fn import_key(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ImportKeyRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let key = provider
        .subtle
        .import_key(
            request.format,
            &request.data,
            &request.algorithm,
            request.extractable,
            &request.usages,
        )
        .await?;
    let descriptor = register_key(&ctx, &request.provider_id, Arc::new(key))?;
    Ok(descriptor.to_bytes())
}

async fn export_key(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ExportKeyRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let key = ctx.handles.lookup_key(&request.key)?;
    Ok(provider.subtle.export_key(request.format, &key).await?)
}

async fn wrap_key(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::WrapKeyRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let key = ctx.handles.lookup_key(&request.key)?;
    let wrapping_key = ctx.handles.lookup_key(&request.wrapping_key)?;
    Ok(provider
        .subtle
        .wrap_key(request.format, &key, &wrapping_key, &request.algorithm)
        .await?)
}

async fn unwrap_key(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::UnwrapKeyRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let unwrapping_key = ctx.handles.lookup_key(&request.unwrapping_key)?;
    let key = provider
        .subtle
        .unwrap_key(
            request.format,
            &request.data,
            &unwrapping_key,
            &request.unwrap_algorithm,
            &request.unwrapped_algorithm,
            request.extractable,
            &request.usages,
        )
        .await?;
    let descriptor = register_key(&ctx, &request.provider_id, Arc::new(key))?;
    Ok(descriptor.to_bytes())
}

// ---------------------------------------------------------------------
// Key storage family
// ---------------------------------------------------------------------

async fn key_storage_get_item(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::StorageGetItemRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let stored = provider
        .keys
        .get_item(&request.index)
        .await
        .ok_or_else(|| crate::provider::ProviderError::KeyStorageMiss(request.index.clone()))?;

    // Apply the caller's algorithm/usages when present
    let mut key = (*stored).clone();
    if let Some(algorithm) = request.algorithm {
        key.algorithm = algorithm;
    }
    if let Some(usages) = request.usages {
        key.usages = usages;
    }
    let key = Arc::new(key);

    let handle = CryptoHandle {
        id: request.index,
        provider_id: request.provider_id,
        kind: key.kind,
    };
    ctx.handles
        .insert(handle.clone(), CryptoObject::Key(key.clone()));
    Ok(descriptor(handle, &key).to_bytes())
}

async fn key_storage_set_item(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::StorageSetItemRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let key = ctx.handles.lookup_key(&request.item)?;
    let index = provider.keys.set_item(&request.item.id, key).await;
    Ok(index.into_bytes())
}

async fn key_storage_remove_item(
    ctx: Arc<ConnCtx>,
    payload: Vec<u8>,
) -> Result<Vec<u8>, GatewayError> {
    let request = proto::StorageRemoveItemRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    provider.keys.remove_item(&request.index).await;
    Ok(Vec::new())
}

async fn key_storage_keys(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ProviderRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    Ok(proto::encode_string_list(&provider.keys.keys().await))
}

async fn key_storage_clear(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ProviderRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    provider.keys.clear().await;
    Ok(Vec::new())
}

// ---------------------------------------------------------------------
// Certificate storage family
// ---------------------------------------------------------------------

/// Register a certificate and its public key, both under the
/// certificate's public-key thumbprint
fn register_certificate(
    ctx: &ConnCtx,
    provider_id: &str,
    id: &str,
    cert: Arc<CertObject>,
) -> proto::CertificateDescriptor {
    let cert_handle = CryptoHandle {
        id: id.to_string(),
        provider_id: provider_id.to_string(),
        kind: cert.kind,
    };
    let key_handle = CryptoHandle {
        id: id.to_string(),
        provider_id: provider_id.to_string(),
        kind: HandleKind::Public,
    };

    ctx.handles
        .insert(cert_handle.clone(), CryptoObject::Certificate(cert.clone()));
    ctx.handles.insert(
        key_handle.clone(),
        CryptoObject::Key(cert.public_key.clone()),
    );

    proto::CertificateDescriptor {
        handle: cert_handle,
        public_key: descriptor(key_handle, &cert.public_key),
    }
}

async fn cert_storage_import(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ImportCertRequest::decode(&payload)?;
    provider_of(&ctx, &request.provider_id).await?;

    if request.kind != HandleKind::X509 && request.kind != HandleKind::Request {
        return Err(crate::provider::ProviderError::InvalidKeyData(
            "certificate type must be x509 or request".to_string(),
        )
        .into());
    }

    let material = KeyObject::material_from_der(&request.data).ok_or_else(|| {
        crate::provider::ProviderError::InvalidKeyData(
            "no subject public key found in certificate".to_string(),
        )
    })?;
    let public_key = Arc::new(KeyObject::new(
        request.algorithm.clone(),
        HandleKind::Public,
        true,
        request.usages.clone(),
        material,
    ));
    let thumbprint = public_key_thumbprint(&public_key)?;

    let cert = Arc::new(CertObject {
        kind: request.kind,
        der: request.data,
        public_key,
    });

    Ok(register_certificate(&ctx, &request.provider_id, &thumbprint, cert).encode())
}

async fn cert_storage_get_item(
    ctx: Arc<ConnCtx>,
    payload: Vec<u8>,
) -> Result<Vec<u8>, GatewayError> {
    let request = proto::StorageGetItemRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let cert = provider
        .certs
        .get_item(&request.index)
        .await
        .ok_or_else(|| crate::provider::ProviderError::CertStorageMiss(request.index.clone()))?;

    Ok(register_certificate(&ctx, &request.provider_id, &request.index, cert).encode())
}

async fn cert_storage_set_item(
    ctx: Arc<ConnCtx>,
    payload: Vec<u8>,
) -> Result<Vec<u8>, GatewayError> {
    let request = proto::StorageSetItemRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    let cert = ctx.handles.lookup(&request.item)?.object.as_certificate()?;
    let index = provider.certs.set_item(&request.item.id, cert).await;
    Ok(index.into_bytes())
}

async fn cert_storage_remove_item(
    ctx: Arc<ConnCtx>,
    payload: Vec<u8>,
) -> Result<Vec<u8>, GatewayError> {
    let request = proto::StorageRemoveItemRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    provider.certs.remove_item(&request.index).await;
    Ok(Vec::new())
}

async fn cert_storage_keys(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ProviderRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    Ok(proto::encode_string_list(&provider.certs.keys().await))
}

async fn cert_storage_clear(ctx: Arc<ConnCtx>, payload: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ProviderRequest::decode(&payload)?;
    let provider = provider_of(&ctx, &request.provider_id).await?;
    provider.certs.clear().await;
    Ok(Vec::new())
}

async fn cert_storage_export(
    ctx: Arc<ConnCtx>,
    payload: Vec<u8>,
) -> Result<Vec<u8>, GatewayError> {
    let request = proto::ExportCertRequest::decode(&payload)?;
    provider_of(&ctx, &request.provider_id).await?;
    let cert = ctx.handles.lookup(&request.item)?.object.as_certificate()?;

    match request.format {
        proto::CertFormat::Raw => Ok(cert.der.clone()),
        proto::CertFormat::Pem => Ok(pem_encode(cert.kind, &cert.der).into_bytes()),
    }
}

fn pem_encode(kind: HandleKind, der: &[u8]) -> String {
    let label = match kind {
        HandleKind::Request => "CERTIFICATE REQUEST",
        _ => "CERTIFICATE",
    };
    let encoded = BASE64.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}
