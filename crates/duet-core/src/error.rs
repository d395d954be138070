//! Error types for Duet

use thiserror::Error;

/// Main error type for Duet operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payload too large: {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Entropy source unavailable: {0}")]
    Entropy(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using Duet's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Caller-facing classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed input; always a client error
    Validation,
    /// A live pairing request already exists for the couple
    Conflict,
    /// No matching pairing request, signal or backup
    NotFound,
    /// Blob or payload exceeds the configured ceiling
    PayloadTooLarge,
    /// Storage or entropy failure
    Internal,
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Error::Entropy(_) | Error::Internal(_) | Error::Io(_) | Error::Json(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Reject empty or blank identifiers
pub fn require_field<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::validation(format!("Missing required field: {}", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(Error::conflict("x").kind(), ErrorKind::Conflict);
        assert_eq!(Error::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::PayloadTooLarge { size: 2, limit: 1 }.kind(),
            ErrorKind::PayloadTooLarge
        );
        assert_eq!(Error::Entropy("rng".into()).kind(), ErrorKind::Internal);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(Error::from(io).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_require_field() {
        assert_eq!(require_field("coupleId", Some(" c1 ")).unwrap(), "c1");
        assert!(matches!(
            require_field("coupleId", Some("   ")),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            require_field("coupleId", None),
            Err(Error::Validation(_))
        ));
    }
}
