use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use certion_firewall::FirewallError;
use certion_router::RoutingError;
use thiserror::Error;
use tracing::error;

use crate::models::ErrorResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        if status.is_server_error() {
            error!("Admin API error: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: Some(code.to_string()),
            }),
        )
            .into_response()
    }
}

impl From<FirewallError> for ApiError {
    fn from(err: FirewallError) -> Self {
        match err {
            FirewallError::InvalidRule(_)
            | FirewallError::InvalidWhitelistEntry(_)
            | FirewallError::InvalidConfig(_)
            | FirewallError::InvalidDuration(_) => ApiError::BadRequest(err.to_string()),
            FirewallError::AccessRequestNotFound(_) | FirewallError::RuleNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            FirewallError::DuplicateRule { .. } | FirewallError::InvalidTransition { .. } => {
                ApiError::Conflict(err.to_string())
            }
            FirewallError::Store(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<RoutingError> for ApiError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::InvalidSubdomain(_) => ApiError::BadRequest(err.to_string()),
            RoutingError::Store(_) => ApiError::Internal(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
