//! Chat Relay Server Library
//!
//! Real-time group chat over WebSockets: presence tracking, session-scoped
//! history and best-effort fan-out to every connected client.

pub mod auth;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod sessions;
pub mod store;

use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::{AppState, RelayConfig};

pub use handlers::router as build_router;

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relay_server=debug,tower_http=info,info".into());

    // Already set (tests, embedding): keep the existing one.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    info!("=== Chat Relay ===");

    let config = RelayConfig::from_env();
    let port = config.port;
    info!("Data root: {:?}", config.data_root);
    info!(
        "Auth required: {} | send queue: {} | upload limit: {} MB",
        config.require_auth, config.send_queue, config.max_file_mb
    );

    let state = AppState::build(config).await?;
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Relay listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
