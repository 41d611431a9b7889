//! Identity and session persistence
//!
//! Keyed stores for the local identity, pinned remote identities, and
//! ratchet session snapshots. A restart with intact storage reuses the
//! same identity and resumes the ratchet with a previously paired peer.
//!
//! All writes go through one document, so the identity/remote/session
//! groups stay atomic with respect to each other: no partial write is
//! ever observable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::crypto::{Identity, RemoteIdentity};
use crate::ratchet::RatchetState;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying file I/O failed
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted document could not be parsed
    #[error("Storage document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Abstract keyed store for identity and session state
///
/// Session saves are versioned: a snapshot is dropped when the store
/// already holds one with an equal or newer version, so a slow writer
/// can never roll the ratchet back.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load the local identity, if one has been provisioned
    async fn load_identity(&self) -> StorageResult<Option<Identity>>;

    /// Persist the local identity
    async fn save_identity(&self, identity: &Identity) -> StorageResult<()>;

    /// Load a pinned remote identity by logical key
    async fn load_remote_identity(&self, key: &str) -> StorageResult<Option<RemoteIdentity>>;

    /// Pin (or overwrite) a remote identity
    async fn save_remote_identity(&self, key: &str, remote: &RemoteIdentity)
        -> StorageResult<()>;

    /// Load a ratchet session snapshot by peer key
    async fn load_session(&self, key: &str) -> StorageResult<Option<RatchetState>>;

    /// Persist a ratchet session snapshot (stale versions are dropped)
    async fn save_session(&self, key: &str, state: &RatchetState) -> StorageResult<()>;
}

/// Everything the store holds, persisted as one JSON document
#[derive(Default, Serialize, Deserialize)]
struct StoreDocument {
    identity: Option<Identity>,
    remotes: HashMap<String, RemoteIdentity>,
    sessions: HashMap<String, RatchetState>,
}

impl StoreDocument {
    /// Apply a session snapshot unless it is older than what we hold
    ///
    /// Versions only order within one handshake lineage; a snapshot from
    /// a fresh handshake always replaces the previous session.
    fn put_session(&mut self, key: &str, state: &RatchetState) -> bool {
        if let Some(existing) = self.sessions.get(key) {
            if existing.epoch == state.epoch && existing.version >= state.version {
                debug!(
                    key,
                    have = existing.version,
                    got = state.version,
                    "dropping stale session snapshot"
                );
                return false;
            }
        }
        self.sessions.insert(key.to_string(), state.clone());
        true
    }
}

/// In-memory store, used by tests and short-lived clients
#[derive(Default)]
pub struct MemoryStorage {
    doc: RwLock<StoreDocument>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_identity(&self) -> StorageResult<Option<Identity>> {
        Ok(self.doc.read().await.identity.clone())
    }

    async fn save_identity(&self, identity: &Identity) -> StorageResult<()> {
        self.doc.write().await.identity = Some(identity.clone());
        Ok(())
    }

    async fn load_remote_identity(&self, key: &str) -> StorageResult<Option<RemoteIdentity>> {
        Ok(self.doc.read().await.remotes.get(key).cloned())
    }

    async fn save_remote_identity(
        &self,
        key: &str,
        remote: &RemoteIdentity,
    ) -> StorageResult<()> {
        self.doc
            .write()
            .await
            .remotes
            .insert(key.to_string(), remote.clone());
        Ok(())
    }

    async fn load_session(&self, key: &str) -> StorageResult<Option<RatchetState>> {
        Ok(self.doc.read().await.sessions.get(key).cloned())
    }

    async fn save_session(&self, key: &str, state: &RatchetState) -> StorageResult<()> {
        self.doc.write().await.put_session(key, state);
        Ok(())
    }
}

/// File-backed store
///
/// The whole document is rewritten on each save through a temporary
/// file and an atomic rename, so a crash mid-write leaves the previous
/// document intact.
pub struct FileStorage {
    path: PathBuf,
    doc: RwLock<StoreDocument>,
}

impl FileStorage {
    /// Open (or create) a store at `path`
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(FileStorage {
            path,
            doc: RwLock::new(doc),
        })
    }

    async fn flush(&self, doc: &StoreDocument) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn load_identity(&self) -> StorageResult<Option<Identity>> {
        Ok(self.doc.read().await.identity.clone())
    }

    async fn save_identity(&self, identity: &Identity) -> StorageResult<()> {
        let mut doc = self.doc.write().await;
        doc.identity = Some(identity.clone());
        self.flush(&doc).await
    }

    async fn load_remote_identity(&self, key: &str) -> StorageResult<Option<RemoteIdentity>> {
        Ok(self.doc.read().await.remotes.get(key).cloned())
    }

    async fn save_remote_identity(
        &self,
        key: &str,
        remote: &RemoteIdentity,
    ) -> StorageResult<()> {
        let mut doc = self.doc.write().await;
        doc.remotes.insert(key.to_string(), remote.clone());
        self.flush(&doc).await
    }

    async fn load_session(&self, key: &str) -> StorageResult<Option<RatchetState>> {
        Ok(self.doc.read().await.sessions.get(key).cloned())
    }

    async fn save_session(&self, key: &str, state: &RatchetState) -> StorageResult<()> {
        let mut doc = self.doc.write().await;
        if doc.put_session(key, state) {
            self.flush(&doc).await?;
        }
        Ok(())
    }
}
