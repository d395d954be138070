//! HTTP mapping of relay errors

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use duet_core::{Error, ErrorKind};
use tracing::error;

/// An error returned from an HTTP handler
#[derive(Debug)]
pub enum ApiError {
    /// A relay operation failed
    Relay(Error),
    /// The request body could not be extracted
    Rejected { status: StatusCode, message: String },
}

impl ApiError {
    fn rejected(status: StatusCode, body_text: String) -> Self {
        let message = if status == StatusCode::PAYLOAD_TOO_LARGE {
            "Payload too large".to_string()
        } else {
            body_text
        };
        Self::Rejected { status, message }
    }

    /// Status code for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Relay(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Rejected { status, .. } => *status,
        }
    }

    /// Message safe to show to clients
    pub fn public_message(&self) -> String {
        match self {
            Self::Relay(Error::Validation(msg))
            | Self::Relay(Error::Conflict(msg))
            | Self::Relay(Error::NotFound(msg)) => msg.clone(),
            Self::Relay(Error::PayloadTooLarge { limit, .. }) => {
                format!("Payload too large (limit {} bytes)", limit)
            }
            Self::Relay(_) => "Internal server error".to_string(),
            Self::Rejected { message, .. } => message.clone(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Relay(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::rejected(e.status(), e.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        Self::rejected(e.status(), e.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::rejected(e.status(), e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Self::Relay(e) = &self {
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!("Request failed: {}", e);
            }
        }
        let body = serde_json::json!({ "error": self.public_message() });
        (status, Json(body)).into_response()
    }
}

/// Result type for HTTP handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;
