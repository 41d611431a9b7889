//! Discovery endpoint and WebSocket upgrade
//!
//! One hyper listener serves both: a plaintext GET of the well-known
//! discovery document, and the upgrade that hands the connection to the
//! gateway's session loop.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::transport::WebSocketTransport;

use super::{Gateway, GatewayError};

/// Well-known path of the discovery document
pub const DISCOVERY_PATH: &str = "/.well-known/webcrypto-local";

pub(super) async fn serve(gateway: Arc<Gateway>, addr: SocketAddr) -> Result<(), GatewayError> {
    let listener = TcpListener::bind(addr).await?;
    info!("gateway listening on ws://{}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let gateway = gateway.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle_request(gateway.clone(), req));

            if let Err(error) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!(%peer, "http connection ended: {:?}", error);
            }
        });
    }
}

async fn handle_request(
    gateway: Arc<Gateway>,
    mut req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if hyper_tungstenite::is_upgrade_request(&req) {
        return Ok(upgrade(gateway, &mut req));
    }

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, DISCOVERY_PATH) => {
            let info = gateway.server_info().await;
            let body = serde_json::to_string(&info).expect("server info serializes");
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .header("Cache-Control", "no-store")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        _ => {
            let body = serde_json::json!({
                "error": "Not Found",
                "hint": format!("GET {} or upgrade to WebSocket", DISCOVERY_PATH),
            });
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(body.to_string())))
                .unwrap()
        }
    };

    Ok(response)
}

fn upgrade(gateway: Arc<Gateway>, req: &mut Request<Incoming>) -> Response<Full<Bytes>> {
    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => gateway.accept(WebSocketTransport::new(ws)),
                    Err(error) => error!("websocket upgrade failed: {:?}", error),
                }
            });
            response
        }
        Err(error) => {
            error!("websocket upgrade error: {:?}", error);
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from(format!(
                    "WebSocket upgrade failed: {}",
                    error
                ))))
                .unwrap()
        }
    }
}
