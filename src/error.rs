//! Error type shared by the agent, the host controller and the control channel.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::concurrency::CancelReason;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The peer could not be reached or answered with a non-success status.
    #[error("transport error: {0}")]
    Transport(String),

    /// A request or argument failed validation (missing id, empty message, bad file name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An external command could not be launched or exited unsuccessfully.
    #[error("command `{command}` failed: {detail}")]
    Execution { command: String, detail: String },

    /// A required file, tool or sandbox is unavailable.
    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled: {0}")]
    Cancelled(CancelReason),

    /// The operation clashes with one already in progress.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn execution(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Execution {
            command: command.into(),
            detail: detail.into(),
        }
    }

    /// HTTP status used when the error crosses the control channel.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::UnknownSession(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(err.to_string())
    }
}

// Error response type
#[derive(Debug)]
pub(crate) struct AppError(pub StatusCode, pub String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err.status_code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_codes() {
        assert_eq!(
            Error::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::UnknownSession("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::execution("objdump", "exit status 1").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn execution_message_names_command() {
        let err = Error::execution("readelf -a /tmp/binary", "exit status 1");
        assert_eq!(
            err.to_string(),
            "command `readelf -a /tmp/binary` failed: exit status 1"
        );
    }

    #[test]
    fn cancelled_is_distinguishable() {
        assert!(Error::Cancelled(CancelReason::DeadlineExceeded).is_cancelled());
        assert!(!Error::Resource("vol.py".into()).is_cancelled());
    }
}
