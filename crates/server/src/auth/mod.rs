//! Authentication Module
//!
//! Password checks against the account table and short-lived bearer tokens.
//! Tokens live only in memory; a restart signs everybody out.

use crate::models::User;
use crate::store::{ChatStore, StoreError};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("password hashing task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Cheapest cost bcrypt accepts; keeps test seeding fast.
pub const TEST_HASH_COST: u32 = 4;

/// Bearer token handed out on login
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub token: String,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

pub struct AuthManager {
    store: Arc<dyn ChatStore>,
    tokens: RwLock<HashMap<String, AuthToken>>,
    token_ttl: Duration,
    hash_cost: u32,
}

impl AuthManager {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self::with_cost(store, DEFAULT_COST)
    }

    /// Manager hashing with `cost` rounds; tests use [`TEST_HASH_COST`].
    pub fn with_cost(store: Arc<dyn ChatStore>, cost: u32) -> Self {
        Self {
            store,
            tokens: RwLock::new(HashMap::new()),
            token_ttl: Duration::hours(24),
            hash_cost: cost,
        }
    }

    /// Create each `(username, password)` account that does not exist yet.
    ///
    /// Returns how many accounts were created.
    pub async fn seed(&self, users: &[(String, String)]) -> Result<usize> {
        let mut created = 0;
        for (username, password) in users {
            if self.store.find_by_username(username).await?.is_some() {
                debug!("[Auth] Seed user {} already exists", username);
                continue;
            }
            self.register(username, password).await?;
            created += 1;
        }
        if created > 0 {
            info!("[Auth] Seeded {} user(s)", created);
        }
        Ok(created)
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<User> {
        let user = User {
            username: username.to_string(),
            password_hash: hash_password(password.to_string(), self.hash_cost).await?,
            created_at: Utc::now(),
        };
        self.store.save_user(&user).await?;
        info!("[Auth] User registered: {}", username);
        Ok(user)
    }

    /// Check a username/password pair. Unknown users and wrong passwords look the same.
    pub async fn verify(&self, username: &str, password: &str) -> Result<User> {
        let user = self
            .store
            .find_by_username(username)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(password.to_string(), user.password_hash.clone()).await? {
            warn!("[Auth] Failed login attempt for {}", username);
            return Err(AuthError::InvalidCredentials);
        }
        Ok(user)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<AuthToken> {
        let user = self.verify(username, password).await?;

        let token = AuthToken {
            token: Uuid::new_v4().to_string(),
            username: user.username,
            expires_at: Utc::now() + self.token_ttl,
        };
        self.tokens
            .write()
            .await
            .insert(token.token.clone(), token.clone());

        info!("[Auth] User logged in: {}", token.username);
        Ok(token)
    }

    /// Username a live token belongs to. Expired tokens are evicted.
    pub async fn resolve(&self, token: &str) -> Result<String> {
        {
            let tokens = self.tokens.read().await;
            match tokens.get(token) {
                Some(t) if t.expires_at > Utc::now() => return Ok(t.username.clone()),
                Some(_) => {}
                None => return Err(AuthError::InvalidToken),
            }
        }

        self.tokens.write().await.remove(token);
        debug!("[Auth] Evicted expired token");
        Err(AuthError::InvalidToken)
    }

    /// Invalidate `token`. Returns whether it was live.
    pub async fn logout(&self, token: &str) -> bool {
        let removed = self.tokens.write().await.remove(token).is_some();
        if removed {
            info!("[Auth] Session invalidated");
        }
        removed
    }
}

// bcrypt is deliberately slow; keep it off the async workers.
async fn hash_password(password: String, cost: u32) -> Result<String> {
    Ok(tokio::task::spawn_blocking(move || hash(password, cost)).await??)
}

async fn verify_password(password: String, password_hash: String) -> Result<bool> {
    Ok(tokio::task::spawn_blocking(move || verify(password, &password_hash)).await??)
}
