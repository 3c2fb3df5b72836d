//! Gateway error responses.

use crate::GasTownError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GasTownError> for ApiError {
    fn from(err: GasTownError) -> Self {
        let msg = err.to_string();
        match err {
            GasTownError::InvalidRequest(_)
            | GasTownError::SessionNotFound(_)
            | GasTownError::RuntimeNotFound(_) => ApiError::BadRequest(msg),
            GasTownError::SessionAlreadyExists(_) | GasTownError::CapacityExceeded(_) => {
                ApiError::Conflict(msg)
            }
            _ => ApiError::Internal(msg),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => error!(message = %msg, "API error"),
            _ => debug!(status = %status, message = %message, "Client error"),
        }

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
