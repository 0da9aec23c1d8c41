use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::error;

use crate::models::ErrorResponse;

pub type Result<T> = std::result::Result<T, AppError>;

/// Errors surfaced synchronously to whoever called into the core.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    /// Rendered with the same text as the matching `NotFound` where key
    /// validity must not leak.
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation<T: ToString>(t: T) -> Self {
        AppError::Validation(t.to_string())
    }

    pub fn conflict<T: ToString>(t: T) -> Self {
        AppError::Conflict(t.to_string())
    }

    pub fn unauthorized<T: ToString>(t: T) -> Self {
        AppError::Unauthorized(t.to_string())
    }

    pub fn not_found<T: ToString>(t: T) -> Self {
        AppError::NotFound(t.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let AppError::Internal(ref e) = self {
            error!("internal error: {:#}", e);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Failure fetching or decoding one page of an external content source.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

/// Failure after the caller has already been acknowledged. Only ever
/// reported out-of-band.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("upload was never acknowledged")]
    NotAcknowledged,

    #[error("media processing failed: {0:#}")]
    Processor(anyhow::Error),

    #[error("persisting asset failed: {0:#}")]
    Persist(anyhow::Error),
}
