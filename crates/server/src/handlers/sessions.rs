//! Session and presence handlers

use axum::{extract::State, Json};
use serde::Serialize;
use tracing::info;

use crate::config::AppState;
use crate::error::Result;
use crate::models::{ChatSession, UserList};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionResponse {
    pub ended: bool,
    pub session: Option<ChatSession>,
}

/// GET /api/sessions/current
pub async fn current_session(State(state): State<AppState>) -> Result<Json<ChatSession>> {
    Ok(Json(state.sessions.current_session().await?))
}

/// POST /api/sessions/end
pub async fn end_session(State(state): State<AppState>) -> Result<Json<EndSessionResponse>> {
    let session = state.sessions.end_current().await?;
    info!(
        "POST /api/sessions/end - {}",
        session.as_ref().map(|s| s.id.as_str()).unwrap_or("no open session")
    );
    Ok(Json(EndSessionResponse {
        ended: session.is_some(),
        session,
    }))
}

/// GET /api/presence
pub async fn presence(State(state): State<AppState>) -> Json<UserList> {
    Json(UserList::new(state.registry.active_users()))
}
