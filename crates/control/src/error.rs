//! Handler errors rendered as `ControlResponse::Error` payloads.
//!
//! Rejected requests and recoverable domain failures travel with 200 so
//! callers can branch on the `kind`; only unexpected or fatal failures use 500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

use crate::protocol::ControlResponse;

pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Domain(#[from] rotor_core::Error),
}

impl AppError {
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Domain(e) if e.is_fatal() => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Domain(rotor_core::Error::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) | Self::ServiceUnavailable(_) | Self::Domain(_) => StatusCode::OK,
        }
    }

    fn body(&self) -> ControlResponse {
        match self {
            Self::BadRequest(reason) => ControlResponse::Error {
                kind: "bad_request".to_string(),
                message: reason.clone(),
            },
            Self::ServiceUnavailable(reason) => ControlResponse::Error {
                kind: "unavailable".to_string(),
                message: reason.clone(),
            },
            Self::Domain(e) => ControlResponse::error(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "control request failed");
        } else {
            tracing::warn!(error = %self, "control request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
