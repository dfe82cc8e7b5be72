//! Token exchange for operators.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use herald_common::error::AppError;

use crate::middleware::auth::{OPERATOR_SUBJECT, api_key_matches, encode_jwt};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/auth/token", post(issue_token))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub api_key: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_in_hours: u64,
}

/// POST /api/auth/token — Exchange the operator API key for a JWT.
async fn issue_token(
    State(state): State<AppState>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    if !api_key_matches(state.config.operator_api_key.as_deref(), &req.api_key) {
        tracing::warn!("Rejected operator token request");
        return Err(AppError::Auth("Invalid API key".to_string()));
    }

    let token = encode_jwt(
        OPERATOR_SUBJECT,
        &state.config.jwt_secret,
        state.config.jwt_expiry_hours,
    )?;

    tracing::info!("Operator token issued");

    Ok(Json(TokenResponse {
        token,
        expires_in_hours: state.config.jwt_expiry_hours,
    }))
}
