//! HTTP and WebSocket handlers

pub mod auth;
pub mod files;
pub mod messages;
pub mod sessions;
pub mod ws;

use axum::{
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

pub use crate::config::AppState;

pub use auth::{login, logout};
pub use files::{download_file, upload_file};
pub use messages::{history, list_messages};
pub use sessions::{current_session, end_session, presence};
pub use ws::ws_handler;

/// Multipart framing allowance on top of the upload limit
const BODY_OVERHEAD: usize = 64 * 1024;

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_file_bytes() + BODY_OVERHEAD;

    Router::new()
        // WebSocket
        .route("/ws", get(ws_handler))
        // Auth
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        // Messages
        .route("/api/messages", get(list_messages))
        .route("/api/messages/history/{username}", get(history))
        // Presence and sessions
        .route("/api/presence", get(presence))
        .route("/api/sessions/current", get(current_session))
        .route("/api/sessions/end", post(end_session))
        // Files
        .route(
            "/api/files/upload",
            post(upload_file).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/files/{file_id}", get(download_file))
        // Health check
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.bus.subscriber_count(),
        "users": state.registry.active_users().len(),
    }))
}
