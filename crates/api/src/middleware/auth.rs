//! JWT authentication helpers and the `AuthUser` extractor.
//!
//! The token's `sub` claim is the user id; that user may only read and
//! subscribe to its own `user:{id}` channel.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use beacon_common::config::AppConfig;
use beacon_common::error::AppError;

use crate::state::AppState;

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (the user id)
    pub sub: String,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
}

/// Authenticated user extracted from the `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub claims: Claims,
}

/// Encode a JWT token for a user.
pub fn encode_jwt(user_id: &str, secret: &str, expiry_hours: u64) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: user_id.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))?;

    Ok(token)
}

/// Decode and validate a JWT token.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    Ok(token_data.claims)
}

fn jwt_secret(config: &AppConfig) -> Result<String, AppError> {
    config
        .jwt_secret
        .clone()
        .ok_or_else(|| AppError::Config("JWT_SECRET is not configured".to_string()))
}

/// Validate a raw token (the `/ws` endpoint takes it as a query parameter).
pub fn authenticate_token(token: &str, config: &AppConfig) -> Result<AuthUser, AppError> {
    let secret = jwt_secret(config)?;
    let claims = decode_jwt(token, &secret)?;
    if claims.sub.is_empty() {
        return Err(AppError::Auth("Token has an empty subject".to_string()));
    }
    Ok(AuthUser {
        user_id: claims.sub.clone(),
        claims,
    })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let config = state.config.clone();

        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        async move {
            if let Some(auth) = auth_header
                && let Some(token) = auth.strip_prefix("Bearer ")
            {
                return authenticate_token(token, &config);
            }

            Err(AppError::Auth(
                "Missing or invalid Authorization header. Use 'Bearer <JWT>'".to_string(),
            ))
        }
    }
}
