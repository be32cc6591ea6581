use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;

/// Identity established by the authentication layer in front of this API.
/// That layer (JWT validation, session lookup) is a separate service; by the
/// time a request reaches these handlers the identity has been verified and
/// placed into the request extensions.
#[derive(Debug, Clone)]
pub struct TravelerIdentity {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct CurrentTraveler(pub Option<TravelerIdentity>);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentTraveler
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<TravelerIdentity>() {
            return Ok(Self(Some(identity.clone())));
        }

        Ok(Self(None))
    }
}

impl CurrentTraveler {
    pub fn require(&self) -> Result<&TravelerIdentity, AppError> {
        self.0.as_ref().ok_or(AppError::Unauthorized)
    }
}
