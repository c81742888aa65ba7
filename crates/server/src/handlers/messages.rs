//! Message history handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::info;

use crate::config::AppState;
use crate::error::{Error, Result};
use crate::models::ChatMessage;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub days: Option<i64>,
}

/// GET /api/messages
pub async fn list_messages(State(state): State<AppState>) -> Result<Json<Vec<ChatMessage>>> {
    let messages = state.store.find_all_order_by_timestamp_asc().await?;
    info!("GET /api/messages - {} message(s)", messages.len());
    Ok(Json(messages))
}

/// GET /api/messages/history/{username}
pub async fn history(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ChatMessage>>> {
    let days = query.days.unwrap_or(state.config.history_days);
    if days < 0 {
        return Err(Error::BadRequest("days must not be negative".to_string()));
    }

    let since = Duration::try_days(days)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .ok_or_else(|| Error::BadRequest(format!("days out of range: {}", days)))?;
    let messages = state.sessions.history_for_user(&username, since).await?;
    info!(
        "GET /api/messages/history/{} - {} message(s) in {} day(s)",
        username,
        messages.len(),
        days
    );
    Ok(Json(messages))
}
