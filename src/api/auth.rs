//! Bearer-token extraction for the HTTP surface.
//!
//! Every route except the push handshake requires a verified token; the
//! extractor turns `Authorization: Bearer <token>` into the calling
//! user's identity.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::services::TokenVerifier;
use crate::AppState;

/// The authenticated caller of an HTTP request.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: i64,
    pub client_id: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::AuthFailed("missing bearer token".to_string()))?;

        let claims = state
            .auth
            .verify(token)
            .map_err(|e| AppError::AuthFailed(e.to_string()))?;

        Ok(AuthedUser {
            user_id: claims.user_id,
            client_id: claims.client_id,
        })
    }
}
