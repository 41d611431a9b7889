//! Frame transport abstraction
//!
//! The transport moves whole binary frames, in order, between two
//! endpoints and nothing more; the ratchet above it supplies all
//! confidentiality and integrity. Implementations: an in-memory pair
//! for tests and a WebSocket stream for real connections.

use async_trait::async_trait;
use thiserror::Error;

pub mod websocket;
pub use websocket::WebSocketTransport;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Abstract frame transport
///
/// Delivers whole frames in order. Binary-safe; one envelope per frame.
#[async_trait]
pub trait Transport: Send {
    /// Send one frame to the peer
    async fn send(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Receive one frame
    ///
    /// Blocks until a frame is available or the connection is closed.
    async fn receive(&mut self) -> TransportResult<Vec<u8>>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;

    /// Close the transport
    async fn close(&mut self) -> TransportResult<()>;
}

/// In-memory transport for testing
///
/// Uses channels to simulate a connection between two endpoints.
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    /// Create a pair of connected in-memory transports
    pub fn create_pair() -> (MemoryTransport, MemoryTransport) {
        let (tx1, rx1) = mpsc::channel(100);
        let (tx2, rx2) = mpsc::channel(100);

        let transport1 = MemoryTransport {
            tx: tx1,
            rx: rx2,
            connected: true,
        };

        let transport2 = MemoryTransport {
            tx: tx2,
            rx: rx1,
            connected: true,
        };

        (transport1, transport2)
    }

    /// In-memory transport endpoint
    pub struct MemoryTransport {
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
        connected: bool,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
            if !self.connected {
                return Err(TransportError::Disconnected);
            }

            self.tx
                .send(data.to_vec())
                .await
                .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
        }

        async fn receive(&mut self) -> TransportResult<Vec<u8>> {
            if !self.connected {
                return Err(TransportError::Disconnected);
            }

            self.rx.recv().await.ok_or(TransportError::Disconnected)
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn close(&mut self) -> TransportResult<()> {
            self.connected = false;
            self.rx.close();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport() {
        let (mut alice, mut bob) = memory::create_pair();

        // Alice sends to Bob
        alice.send(b"frame one").await.unwrap();
        let received = bob.receive().await.unwrap();
        assert_eq!(received, b"frame one");

        // Bob sends to Alice
        bob.send(b"frame two").await.unwrap();
        let received = alice.receive().await.unwrap();
        assert_eq!(received, b"frame two");
    }

    #[tokio::test]
    async fn test_memory_transport_preserves_order() {
        let (mut alice, mut bob) = memory::create_pair();

        for i in 0..10u8 {
            alice.send(&[i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(bob.receive().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_memory_transport_close() {
        let (mut alice, _bob) = memory::create_pair();

        alice.close().await.unwrap();
        assert!(!alice.is_connected());

        // Should fail after close
        assert!(alice.send(b"test").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_drop_disconnects() {
        let (mut alice, bob) = memory::create_pair();
        drop(bob);

        assert!(alice.receive().await.is_err());
    }
}
