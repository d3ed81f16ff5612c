use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    Json,
};
use server_api::auth::verify_token;
use shared::{domain::Identity, error::ApiError};

use crate::{error_response, AppState};

/// Caller identity from `Authorization: Bearer <token>`.
pub struct AuthUser(pub Identity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = (StatusCode, Json<ApiError>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| error_response(ApiError::unauthorized("missing bearer token")))?;

        verify_token(&state.api.auth, token)
            .map(AuthUser)
            .map_err(error_response)
    }
}
