//! Caller identity, consumed from the upstream auth middleware.
//!
//! Authentication itself is an external collaborator; it terminates ahead of
//! this service and forwards the authenticated principal as `x-user-id` and
//! `x-is-admin` headers. Requests without a principal are rejected.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct Caller {
    pub id: String,
    pub is_admin: bool,
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ApiError::unauthorized("missing x-user-id header"))?
            .to_string();
        let is_admin = parts
            .headers
            .get("x-is-admin")
            .and_then(|v| v.to_str().ok())
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Ok(Caller { id, is_admin })
    }
}
