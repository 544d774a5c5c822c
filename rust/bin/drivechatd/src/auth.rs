//! JWT bearer authentication.
//!
//! Validates `Authorization: Bearer <token>` (HS256) and maps the `sub`
//! claim to the task owner.

use axum::http::HeaderMap;
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use drivechat_core::auth::bearer_token;
use drivechat_core::{Authenticator, Principal, ServiceError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id tasks are scoped to.
    pub sub: String,
    /// Expiration (unix timestamp).
    pub exp: u64,
}

pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, ServiceError> {
        let token = bearer_token(headers)
            .ok_or_else(|| ServiceError::Unauthorized("missing authorization token".into()))?;

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| ServiceError::Unauthorized(format!("invalid token: {e}")))?;

        let owner = data.claims.sub.trim();
        if owner.is_empty() {
            return Err(ServiceError::Unauthorized("token has no subject".into()));
        }
        Ok(Principal {
            owner_id: owner.to_string(),
        })
    }
}
