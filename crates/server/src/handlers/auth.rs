//! Auth handlers

use crate::auth::AuthError;
use crate::config::AppState;
use crate::error::{Error, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
    pub username: Option<String>,
    pub token: Option<String>,
}

impl AuthResponse {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            username: None,
            token: None,
        }
    }
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> std::result::Result<Json<AuthResponse>, (StatusCode, Json<AuthResponse>)> {
    info!("POST /api/auth/login - {}", req.username);

    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(AuthResponse::failure("Username and password are required")),
        ));
    }

    match state.auth.login(req.username.trim(), &req.password).await {
        Ok(token) => Ok(Json(AuthResponse {
            success: true,
            message: "Login successful".to_string(),
            username: Some(token.username),
            token: Some(token.token),
        })),
        Err(AuthError::InvalidCredentials) => Err((
            StatusCode::UNAUTHORIZED,
            Json(AuthResponse::failure("Invalid username or password")),
        )),
        Err(e) => {
            warn!("Login failed for {}: {}", req.username, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AuthResponse::failure("Login failed")),
            ))
        }
    }
}

/// POST /api/auth/logout
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    let token = bearer_token(&headers)
        .ok_or_else(|| Error::Unauthorized("Missing bearer token".to_string()))?;

    if state.auth.logout(token).await {
        info!("POST /api/auth/logout");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AuthError::InvalidToken.into())
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
