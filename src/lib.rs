//! # Keyport
//!
//! A local WebCrypto gateway: asymmetric cryptography delegated over an
//! end-to-end encrypted socket. Clients keep only symmetric primitives
//! and randomness; key generation, signing, encryption, derivation,
//! wrapping, and key/certificate storage run inside this service, where
//! hardware tokens can back the material without it ever crossing the
//! transport in the clear.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 CALLER SIDE                      │
//! │   Client: correlated request/response            │
//! └──────────────────────┬──────────────────────────┘
//!                        │ action / result envelopes
//! ┌──────────────────────▼──────────────────────────┐
//! │               SECURE CHANNEL                     │
//! │   Pre-key handshake | Double Ratchet | storage   │
//! └──────────────────────┬──────────────────────────┘
//!                        │ opaque frames
//! ┌──────────────────────▼──────────────────────────┐
//! │               FRAME TRANSPORT                    │
//! │   WebSocket | in-memory (tests)                  │
//! └──────────────────────┬──────────────────────────┘
//!                        │
//! ┌──────────────────────▼──────────────────────────┐
//! │                GATEWAY SIDE                      │
//! │   Dispatcher | handle registry | providers       │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keyport::client::{Client, ClientConfig};
//! use keyport::proto::Algorithm;
//! use keyport::storage::MemoryStorage;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect(
//!     "127.0.0.1:31337",
//!     Arc::new(MemoryStorage::new()),
//!     ClientConfig::default(),
//! )
//! .await?;
//!
//! client.login("software").await?;
//! let digest = client
//!     .digest("software", Algorithm::named("SHA-256"), b"hello".to_vec())
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod crypto;
pub mod proto;
pub mod provider;
pub mod ratchet;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-export main types at crate root
pub use client::{Client, ClientConfig, ClientError};
pub use crypto::{Identity, RemoteIdentity};
pub use proto::{Algorithm, CryptoHandle, HandleKind, KeyFormat, KeyUsage};
pub use server::{Gateway, GatewayConfig, GatewayError, ServerInfo};
pub use storage::{FileStorage, MemoryStorage, Storage};
