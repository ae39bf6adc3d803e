//! Caller identity.
//!
//! Authentication happens upstream: the identity provider's gateway verifies
//! the caller and forwards its user id in [`USER_ID_HEADER`]. Handlers only
//! require that the header is present and non-empty.

use crate::errors::AppError;
use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{HeaderMap, StatusCode, request::Parts},
};
use std::convert::Infallible;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller of an upload route.
///
/// Extract `Option<AuthUser>` on routes that also serve anonymous callers.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

impl AuthUser {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(|user| AuthUser(user.to_string()))
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers)
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "Unauthorized"))
    }
}

impl<S> OptionalFromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}
