//! API error type. Every handler error becomes a JSON body with a
//! `message` field and an appropriate status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

use crate::auth::service::AuthError;
use crate::db::store::StoreError;
use crate::panel::provision::ProvisionError;
use crate::panel::PanelError;
use crate::stripe::StripeError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthenticated")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("Not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    UnprocessableEntity(String),

    #[error("Internal error")]
    Internal(anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(e) = &self {
            error!(error = ?e, "Internal error serving request");
        }

        let status = self.status();
        let body = Json(serde_json::json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::EmailTaken => Self::Conflict("Email already registered".to_string()),
            StoreError::NotFound => Self::NotFound,
            other => Self::Internal(other.into()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            // Bad credentials are 401; a valid customer login attempting the
            // admin surface is 403.
            AuthError::InvalidCredentials => Self::Unauthorized,
            AuthError::NotAdmin => Self::Forbidden("Administrator access required".to_string()),
            AuthError::InvalidToken => Self::Unauthorized,
            AuthError::Store(inner) => inner.into(),
            AuthError::Jwt(inner) => {
                // Token errors during verification are a caller problem.
                Self::Internal(inner.into())
            }
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(e: ProvisionError) -> Self {
        match e {
            ProvisionError::UnknownPlan(_)
            | ProvisionError::UnknownLocation(_)
            | ProvisionError::InvalidConfig(_) => Self::UnprocessableEntity(e.to_string()),
            ProvisionError::NoCapacity { .. } => Self::Conflict(e.to_string()),
            ProvisionError::Store(inner) => inner.into(),
            other => Self::Internal(other.into()),
        }
    }
}

impl From<PanelError> for ApiError {
    fn from(e: PanelError) -> Self {
        match e {
            PanelError::InvalidPowerSignal(_) => Self::BadRequest(e.to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

impl From<StripeError> for ApiError {
    // Signature failures get a 400 so Stripe surfaces them in the
    // endpoint's delivery log instead of retrying forever.
    fn from(e: StripeError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(StoreError::EmailTaken).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(StoreError::NotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(AuthError::InvalidToken).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(AuthError::NotAdmin).status(),
            StatusCode::FORBIDDEN
        );
    }
}
