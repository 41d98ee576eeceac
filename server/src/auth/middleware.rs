//! Bearer token extraction.
//!
//! The token names the account (the identity) every row is scoped by. When
//! the server runs with an `AUTH_SECRET`, tokens take the form
//! `identity:secret` and the secret part must match.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated account extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub identity: String,
}

impl AuthUser {
    /// Resolve a raw bearer token against the configured secret.
    pub fn from_token(token: &str, secret: Option<&str>) -> Result<Self, AppError> {
        let identity = match secret {
            None => token,
            Some(secret) => match token.rsplit_once(':') {
                Some((identity, given)) if given == secret => identity,
                _ => return Err(AppError::Unauthorized),
            },
        };
        if identity.trim().is_empty() {
            return Err(AppError::Unauthorized);
        }
        Ok(AuthUser {
            identity: identity.to_string(),
        })
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        AuthUser::from_token(token, state.config.auth_secret.as_deref())
    }
}
