//! Operator authentication.
//!
//! Operators either present the configured API key directly (`X-API-Key`) or
//! exchange it once for a JWT and send `Authorization: Bearer <token>`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use herald_common::error::AppError;

use crate::state::AppState;

/// Subject recorded in tokens minted from the operator API key.
pub const OPERATOR_SUBJECT: &str = "operator";

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
}

/// Authenticated operator, usable as an Axum extractor on protected routes.
#[derive(Debug, Clone)]
pub struct AuthOperator {
    pub subject: String,
}

pub fn encode_jwt(subject: &str, secret: &str, expiry_hours: u64) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: subject.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))
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

/// Whether `presented` matches the configured operator key. Always false when
/// no key is configured.
pub fn api_key_matches(configured: Option<&str>, presented: &str) -> bool {
    match configured {
        Some(expected) if !expected.is_empty() => {
            // Compare every byte so timing does not leak the matching prefix.
            expected.len() == presented.len()
                && expected
                    .bytes()
                    .zip(presented.bytes())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
        }
        _ => false,
    }
}

impl FromRequestParts<AppState> for AuthOperator {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        if let Some(auth) = header("authorization")
            && let Some(token) = auth.strip_prefix("Bearer ")
        {
            let claims = decode_jwt(token, &state.config.jwt_secret)?;
            return Ok(AuthOperator {
                subject: claims.sub,
            });
        }

        if let Some(api_key) = header("x-api-key")
            && api_key_matches(state.config.operator_api_key.as_deref(), &api_key)
        {
            return Ok(AuthOperator {
                subject: OPERATOR_SUBJECT.to_string(),
            });
        }

        Err(AppError::Auth(
            "Missing or invalid Authorization header. Use 'Bearer <JWT>' or 'X-API-Key: <key>'"
                .to_string(),
        ))
    }
}
