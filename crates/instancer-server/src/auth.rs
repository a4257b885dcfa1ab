// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bearer-token authentication.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::AppState;

/// Claims carried in an access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id, as a string per JWT convention.
    pub sub: String,
    /// Expiry, unix seconds.
    pub exp: u64,
}

/// The authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    /// Numeric user id from the token's `sub` claim.
    pub user_id: i64,
}

/// Issue an HS256 token for a user, valid for `ttl_seconds`.
pub fn issue_token(
    secret: &str,
    user_id: i64,
    ttl_seconds: u64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: jsonwebtoken::get_current_timestamp() + ttl_seconds,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Validate a token and extract the caller's identity.
pub fn verify_token(secret: &str, token: &str) -> Result<Identity, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| ApiError::Unauthorized("invalid token".to_string()))?;

    let user_id = data
        .claims
        .sub
        .parse::<i64>()
        .map_err(|_| ApiError::Unauthorized("invalid subject claim".to_string()))?;

    Ok(Identity { user_id })
}

impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("expected bearer token".to_string()))?;

        verify_token(&state.auth_secret, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify() {
        let token = issue_token("secret", 42, 600).unwrap();
        let identity = verify_token("secret", &token).unwrap();
        assert_eq!(identity.user_id, 42);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_token("secret", 42, 600).unwrap();
        assert!(verify_token("other", &token).is_err());
    }

    #[test]
    fn non_numeric_subject_is_rejected() {
        let claims = Claims {
            sub: "alice".to_string(),
            exp: jsonwebtoken::get_current_timestamp() + 600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(verify_token("secret", &token).is_err());
    }
}
