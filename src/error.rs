//! # Errors
//!
//! Error types surfaced by message handlers. Each variant maps to the HTTP
//! status code carried in the reply `status` field.

use http::StatusCode;
use thiserror::Error;

/// A short-hand `Result` using [`Error`] as the error variant.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned when handling messages.
#[derive(Error, Debug)]
pub enum Error {
    /// The message was malformed: schema validation, CBOR decoding, or an
    /// integrity CID check failed.
    #[error("{0}")]
    BadRequest(String),

    /// A signature failed verification or the signer could not be resolved.
    #[error("{0}")]
    Unauthorized(String),

    /// The author is not permitted to perform the requested action.
    #[error("{0}")]
    Forbidden(String),

    /// The record does not exist or its latest state is a delete.
    #[error("{0}")]
    NotFound(String),

    /// The message was superseded by a more recent one for the same record.
    /// Conflicts are normal outcomes and leave the store untouched.
    #[error("{0}")]
    Conflict(String),

    /// An underlying store or provider failure. Retryable by the caller.
    #[error("{0}")]
    Unexpected(String),
}

impl Error {
    /// The HTTP-style status code for the error.
    #[must_use]
    pub const fn code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::Forbidden(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The error's detail string.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::BadRequest(detail)
            | Self::Unauthorized(detail)
            | Self::Forbidden(detail)
            | Self::NotFound(detail)
            | Self::Conflict(detail)
            | Self::Unexpected(detail) => detail,
        }
    }

    /// Render the error as a reply status.
    #[must_use]
    pub fn status(&self) -> crate::Status {
        crate::Status {
            code: self.code().as_u16(),
            detail: Some(self.detail().to_string()),
        }
    }
}

// Provider failures surface as retryable storage errors. The underlying
// cause is logged, not leaked to the caller.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        tracing::warn!("provider error: {err:#}");
        Self::Unexpected("storage failure".to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("deserialization failed: {err}"))
    }
}

impl From<base64ct::Error> for Error {
    fn from(err: base64ct::Error) -> Self {
        Self::BadRequest(format!("base64 decoding failed: {err}"))
    }
}

/// Construct an `Error::Unexpected` error from a string or format expression.
#[doc(hidden)]
#[macro_export]
macro_rules! unexpected {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Unexpected(format!($fmt, $($arg)*))
    };
    ($err:expr $(,)?) => {
        $crate::Error::Unexpected(format!($err))
    };
}

/// Construct an `Error::Forbidden` error from a string or format expression.
#[doc(hidden)]
#[macro_export]
macro_rules! forbidden {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Forbidden(format!($fmt, $($arg)*))
    };
    ($err:expr $(,)?) => {
        $crate::Error::Forbidden(format!($err))
    };
}

/// Construct an `Error::BadRequest` error from a string or format expression.
#[doc(hidden)]
#[macro_export]
macro_rules! bad_request {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::BadRequest(format!($fmt, $($arg)*))
    };
    ($err:expr $(,)?) => {
        $crate::Error::BadRequest(format!($err))
    };
}
