use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Identity, Role, UserId},
    error::ApiError,
};

/// Seven days, the lifetime tokens have always been issued with.
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Signing secret used when none is configured. Only fit for local runs.
pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: Role,
    iat: i64,
    exp: i64,
}

pub fn mint_token(
    cfg: &AuthConfig,
    identity: Identity,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        sub: identity.user_id.0.to_string(),
        role: identity.role,
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
    )
}

pub fn verify_token(cfg: &AuthConfig, token: &str) -> Result<Identity, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|error| match error.kind() {
        ErrorKind::ExpiredSignature => ApiError::unauthorized("token expired"),
        _ => ApiError::unauthorized("invalid token"),
    })?;

    let user_id = data
        .claims
        .sub
        .parse::<i64>()
        .map(UserId)
        .map_err(|_| ApiError::unauthorized("invalid token subject"))?;

    Ok(Identity {
        user_id,
        role: data.claims.role,
    })
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
