use axum::{
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};

use crate::{AppError, error::ChatError, session::{SessionClaim, SessionCodec}};

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Extracts the verified claim of a bearer-authenticated request.
pub struct Authenticated(pub SessionClaim);

impl Authenticated {
    pub fn require_admin(&self) -> Result<(), ChatError> {
        if self.0.is_admin() {
            Ok(())
        } else {
            Err(ChatError::AdminOnly)
        }
    }
}

impl<S> FromRequestParts<S> for Authenticated
where
    SessionCodec: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ChatError::Unauthorized)?;
        let claim = SessionCodec::from_ref(state)
            .verify(token)
            .map_err(ChatError::from)?;

        Ok(Self(claim))
    }
}
