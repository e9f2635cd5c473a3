//! Caller identity.
//!
//! Sessions are verified by the upstream auth gateway, which forwards the
//! caller as `x-user-id` / `x-user-role`. The middleware turns those headers
//! into a [`Requester`] in the request extensions; handlers take it as an
//! extractor and get a 401 when it is absent.

use crate::{
    errors::AppError,
    models::requester::{Requester, Role},
};
use axum::{
    extract::{FromRequestParts, Request},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use tracing::debug;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

pub async fn identity_from_gateway(mut request: Request, next: Next) -> Response {
    let headers = request.headers();
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from);
    let role = headers
        .get(USER_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Role>().ok())
        .unwrap_or(Role::User);

    // Never trust an identity that arrived any other way.
    request.extensions_mut().remove::<Requester>();
    if let Some(user_id) = user_id {
        debug!(user_id = %user_id, role = role.as_str(), "caller identified");
        request.extensions_mut().insert(Requester { user_id, role });
    }
    next.run(request).await
}

impl<S: Send + Sync> FromRequestParts<S> for Requester {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Requester>()
            .cloned()
            .ok_or_else(AppError::unauthenticated)
    }
}
