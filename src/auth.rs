//! Auth Gate — resolves a bearer token to a user id.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::AuthError;
use crate::store::Database;
use crate::task::UserId;

const BEARER_PREFIX: &str = "Bearer ";

/// Token → user resolution.
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Auth gate backed by the `auth_tokens` table.
pub struct StoreAuthGate {
    store: Arc<dyn Database>,
}

impl StoreAuthGate {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }
}

/// Strip an optional `Bearer ` prefix and surrounding whitespace.
pub fn normalize_token(raw: &str) -> &str {
    let raw = raw.trim_start();
    raw.strip_prefix(BEARER_PREFIX).unwrap_or(raw).trim()
}

#[async_trait]
impl AuthGate for StoreAuthGate {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        let token = normalize_token(token);
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let record = self
            .store
            .find_auth_token(token)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if record.is_expired(Utc::now()) {
            return Err(AuthError::Expired {
                user_id: record.user_id,
            });
        }

        Ok(record.user_id)
    }
}
