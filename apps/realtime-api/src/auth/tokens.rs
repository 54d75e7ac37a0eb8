//! Token validation for gateway handshakes and bearer-authenticated routes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::kv::{self, KeyValueStore};
use crate::db::StoreError;

/// Identity resolved from a valid token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub display_name: String,
}

/// Why a token was rejected. The display form is the close reason sent to
/// the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no-token")]
    NoToken,
    #[error("invalid-token")]
    InvalidToken,
    #[error("user-not-found")]
    UserNotFound,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthenticatedUser, AuthError>;
}

/// Data stored alongside a token.
#[derive(Debug, Serialize, Deserialize)]
struct TokenData {
    user_id: String,
}

/// Profile data the validator resolves a user id to.
#[derive(Debug, Serialize, Deserialize)]
struct UserProfile {
    display_name: String,
}

fn token_key(token: &str) -> String {
    format!("auth:token:{token}")
}

fn user_key(user_id: &str) -> String {
    format!("auth:user:{user_id}")
}

/// Validator backed by a [`KeyValueStore`] populated by the account service
/// (or by `DEV_TOKENS` in development).
pub struct KvTokenValidator {
    kv: Arc<dyn KeyValueStore>,
}

impl KvTokenValidator {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub async fn register_user(&self, user_id: &str, display_name: &str) -> Result<(), StoreError> {
        let profile = UserProfile {
            display_name: display_name.to_string(),
        };
        kv::set_json(self.kv.as_ref(), &user_key(user_id), &profile).await
    }

    pub async fn register_token(&self, token: &str, user_id: &str) -> Result<(), StoreError> {
        let data = TokenData {
            user_id: user_id.to_string(),
        };
        kv::set_json(self.kv.as_ref(), &token_key(token), &data).await
    }

    pub async fn revoke_token(&self, token: &str) -> Result<(), StoreError> {
        self.kv.del(&token_key(token)).await
    }
}

#[async_trait]
impl TokenValidator for KvTokenValidator {
    async fn validate(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::NoToken);
        }

        let data: TokenData = kv::get_json(self.kv.as_ref(), &token_key(token))
            .await
            .map_err(|err| {
                tracing::warn!(?err, "token lookup failed");
                AuthError::InvalidToken
            })?
            .ok_or(AuthError::InvalidToken)?;

        let profile: UserProfile = kv::get_json(self.kv.as_ref(), &user_key(&data.user_id))
            .await
            .map_err(|err| {
                tracing::warn!(?err, user_id = %data.user_id, "profile lookup failed");
                AuthError::UserNotFound
            })?
            .ok_or(AuthError::UserNotFound)?;

        Ok(AuthenticatedUser {
            user_id: data.user_id,
            display_name: profile.display_name,
        })
    }
}
