use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use parley_db::StoreError;
use parley_types::events::ErrorFrame;

/// Errors that can reach a client. Transport failures are not represented:
/// they only ever end the connection they happened on.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed admission parameters or inbound payload.
    #[error("{0}")]
    InvalidRequest(String),

    /// Missing or rejected credential.
    #[error("{0}")]
    Unauthorized(String),

    /// New connections are refused once shutdown has started.
    #[error("Server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl ChatError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Persistence(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Persistence(StoreError::NotParticipant { .. }) => StatusCode::FORBIDDEN,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
            ErrorFrame::new("Internal server error")
        } else {
            ErrorFrame::new(self.to_string())
        };
        (status, Json(body)).into_response()
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Persistence(StoreError::Unavailable(format!("blocking task failed: {}", e)))
    }
}
