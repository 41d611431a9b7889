//! Connection-scoped session state
//!
//! Each connected peer moves through a small state machine:
//!
//! ```text
//!   [connecting] --handshake ok--> [open-unauth] --auth ok--> [open-auth]
//!        \                            \                           |
//!         +-------- close ------------+---------- close ----------+--> [closed]
//! ```
//!
//! In `connecting` no ratchet exists and inbound envelopes are rejected;
//! `open-unauth` permits only the provider/login subset; `open-auth`
//! enables the full surface and unsolicited events; `closed` is
//! terminal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::proto::{Envelope, UNAUTHENTICATED_ACTIONS};

/// Connection lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Transport up, no ratchet yet
    Connecting,
    /// Ratchet established, login pending
    OpenUnauth,
    /// Full action surface enabled
    OpenAuth,
    /// Terminal
    Closed,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared view of one connected session
///
/// The connection loop owns the transport; everything else (login
/// handler, token broadcaster) talks to the session through this handle.
#[derive(Clone)]
pub struct SessionHandle {
    /// Server-local session id, for logs
    pub id: u64,
    state: Arc<RwLock<SessionState>>,
    outbound: mpsc::Sender<Envelope>,
}

impl SessionHandle {
    /// New session in `Connecting`, sending envelopes into `outbound`
    pub fn new(outbound: mpsc::Sender<Envelope>) -> Self {
        SessionHandle {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(RwLock::new(SessionState::Connecting)),
            outbound,
        }
    }

    /// Current state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Advance the state machine
    pub async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    /// Whether `action` may run in the current state
    pub async fn permits(&self, action: &str) -> bool {
        match self.state().await {
            SessionState::Connecting | SessionState::Closed => false,
            SessionState::OpenUnauth => UNAUTHENTICATED_ACTIONS.contains(&action),
            SessionState::OpenAuth => true,
        }
    }

    /// Queue an envelope for the peer; fails silently once closed
    pub async fn push(&self, envelope: Envelope) -> bool {
        self.outbound.send(envelope).await.is_ok()
    }
}

/// Outcome of a user-presence prompt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The user supplied a secret
    Secret(String),
    /// No reply within the deadline
    TimedOut,
    /// The user dismissed the prompt
    Cancelled,
}

/// Host capability for PIN/consent prompts
///
/// The host embeds an OS-native implementation; tests inject doubles.
#[async_trait]
pub trait SecretPrompt: Send + Sync {
    /// Ask the user for a secret, waiting at most `timeout`
    async fn prompt(&self, message: &str, timeout: Duration) -> PromptOutcome;
}

/// Prompt that approves instantly with an empty secret
///
/// Suits headless deployments where only the software provider is
/// exposed and no user presence is required.
pub struct AutoApprove;

#[async_trait]
impl SecretPrompt for AutoApprove {
    async fn prompt(&self, _message: &str, _timeout: Duration) -> PromptOutcome {
        PromptOutcome::Secret(String::new())
    }
}

/// Prompt that never answers; login attempts run into their deadline
pub struct NeverAnswer;

#[async_trait]
impl SecretPrompt for NeverAnswer {
    async fn prompt(&self, _message: &str, timeout: Duration) -> PromptOutcome {
        tokio::time::sleep(timeout + Duration::from_secs(1)).await;
        PromptOutcome::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::tags;

    fn session() -> SessionHandle {
        let (tx, _rx) = mpsc::channel(8);
        SessionHandle::new(tx)
    }

    #[tokio::test]
    async fn test_connecting_rejects_everything() {
        let session = session();
        assert!(!session.permits(tags::PROVIDER_INFO).await);
        assert!(!session.permits(tags::DIGEST).await);
    }

    #[tokio::test]
    async fn test_unauth_permits_subset() {
        let session = session();
        session.set_state(SessionState::OpenUnauth).await;

        assert!(session.permits(tags::PROVIDER_INFO).await);
        assert!(session.permits(tags::LOGIN).await);
        assert!(session.permits(tags::IS_LOGGED_IN).await);
        assert!(session.permits(tags::PROVIDER_GET_CRYPTO).await);
        assert!(!session.permits(tags::DIGEST).await);
        assert!(!session.permits(tags::GENERATE_KEY).await);
    }

    #[tokio::test]
    async fn test_auth_permits_all() {
        let session = session();
        session.set_state(SessionState::OpenAuth).await;

        assert!(session.permits(tags::DIGEST).await);
        assert!(session.permits(tags::CERT_STORAGE_IMPORT).await);
    }

    #[tokio::test]
    async fn test_closed_is_terminal() {
        let session = session();
        session.set_state(SessionState::Closed).await;
        assert!(!session.permits(tags::PROVIDER_INFO).await);
    }

    #[tokio::test]
    async fn test_session_ids_distinct() {
        assert_ne!(session().id, session().id);
    }
}
