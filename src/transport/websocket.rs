//! WebSocket frame transport
//!
//! Binary frames only, one envelope per frame. Generic over the
//! underlying stream so the same type serves the client side (a TCP
//! connection) and the server side (the stream hyper hands back after
//! the upgrade).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{Transport, TransportError, TransportResult};

/// WebSocket transport over any async stream
pub struct WebSocketTransport<S> {
    ws: WebSocketStream<S>,
    connected: bool,
}

impl WebSocketTransport<MaybeTlsStream<TcpStream>> {
    /// Connect to a gateway at `ws://<addr>`
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(WebSocketTransport {
            ws,
            connected: true,
        })
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-upgraded WebSocket stream (server side)
    pub fn new(ws: WebSocketStream<S>) -> Self {
        WebSocketTransport {
            ws,
            connected: true,
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        self.ws
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn receive(&mut self) -> TransportResult<Vec<u8>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                // Pings are answered by the protocol layer on the next flush
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    return Err(TransportError::InvalidData(
                        "text frame on a binary channel".to_string(),
                    ))
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.connected = false;
                    return Err(TransportError::Disconnected);
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    self.connected = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.connected = false;
        self.ws
            .close(None)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
