//! Keyport gateway daemon
//!
//! Serves the discovery document and the encrypted WebSocket channel on
//! one local port. Identity and ratchet sessions persist under the
//! storage path, so restarts keep the same identity and resume paired
//! sessions.
//!
//! Usage:
//!   keyport-gateway [--port 31337] [--host 127.0.0.1] [--storage <path>]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use keyport::provider::ProviderRegistry;
use keyport::server::{AutoApprove, Gateway, GatewayConfig};
use keyport::storage::FileStorage;
use tracing::error;

/// Keyport gateway daemon
#[derive(Parser)]
#[command(name = "keyport-gateway")]
#[command(about = "Local WebCrypto gateway over an end-to-end encrypted socket")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "31337")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Path of the identity/session store
    #[arg(long, default_value = "keyport-store.json")]
    storage: PathBuf,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keyport=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .expect("invalid host/port");

    let storage = FileStorage::open(&args.storage)
        .await
        .expect("failed to open storage");

    let gateway = Gateway::start(
        Arc::new(storage),
        Arc::new(ProviderRegistry::new()),
        Arc::new(AutoApprove),
        GatewayConfig::default(),
    )
    .await
    .expect("failed to start gateway");

    if let Err(e) = gateway.serve(addr).await {
        error!("gateway stopped: {}", e);
        std::process::exit(1);
    }
}
