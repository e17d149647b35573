//! The status slot written by the transport's finish operation.

use std::fmt;

use thiserror::Error;

/// Outcome codes for a finished RPC operation, as reported by the transport.
///
/// This crate never interprets these; the stream layer reacting to a finish
/// completion does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusCode {
    #[default]
    Ok,
    Cancelled,
    Unknown,
    DeadlineExceeded,
    NotFound,
    ResourceExhausted,
    Aborted,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "ok",
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unknown => "unknown",
            StatusCode::DeadlineExceeded => "deadline exceeded",
            StatusCode::NotFound => "not found",
            StatusCode::ResourceExhausted => "resource exhausted",
            StatusCode::Aborted => "aborted",
            StatusCode::Internal => "internal",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// A code plus human-readable detail, filled in by the transport during a
/// finish operation and read back inside the deferred action.
///
/// Implements `Error` so a stream layer can propagate a failed finish with
/// `?`; a `Status` with [`StatusCode::Ok`] is simply never treated as one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    /// The default, successful status.
    pub fn ok() -> Self {
        Status::default()
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}
