//! Error taxonomy shared by every layer.
//!
//! Each [`Error`] variant maps to exactly one [`ErrorKind`]. Retry, circuit
//! breaker and envelope shaping all decide on the kind, never on the message
//! text or the originating library.

use std::fmt;
use std::time::Duration;

/// Semantic classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or contradictory configuration, detected before any I/O.
    Configuration,
    /// Caller-supplied arguments failed a required-field or format check.
    Validation,
    /// Network-level failure: refused, reset, DNS, TLS.
    Connection,
    /// Connect or total request timeout elapsed.
    Timeout,
    /// Vendor rejected credentials, or a stored credential failed to decrypt.
    Authentication,
    /// Vendor returned a well-formed error response.
    VendorApi,
    /// Circuit breaker is open; the call never reached the vendor.
    CircuitOpen,
    /// A named entity (host credential, record) does not exist.
    NotFound,
    /// Local filesystem failure.
    Io,
    /// Anything else: bugs, serialization failures, panics.
    Internal,
}

impl ErrorKind {
    /// Stable lowercase label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::VendorApi => "vendor_api",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the transport, resilience, vault and tool layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{0}")]
    Validation(String),
    #[error("connection failed: {0}")]
    Connection(String),
    /// The connection broke after the request was written.
    #[error("connection lost mid-request: {0}")]
    Interrupted(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("vendor API error (HTTP {status}): {message}")]
    VendorApi { status: u16, message: String },
    #[error("circuit '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Error::Authentication(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// The semantic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Connection(_) | Error::Interrupted(_) => ErrorKind::Connection,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::VendorApi { .. } => ErrorKind::VendorApi,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Io(_) => ErrorKind::Io,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// `true` when the failed request may have been processed by the vendor,
    /// so sending it again could repeat its effect.
    pub fn may_have_reached_vendor(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Interrupted(_) | Error::VendorApi { .. }
        )
    }

    /// `true` for a vendor response with a 5xx status.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::VendorApi { status, .. } if *status >= 500)
    }

    /// Message safe to hand back to a tool caller.
    ///
    /// Validation and vendor API messages originate from user input or the
    /// vendor's own error body and are returned verbatim. Every other kind gets
    /// a fixed sentence plus the correlation id for server-side log lookup.
    pub fn public_message(&self, correlation_id: &str) -> String {
        let generic = match self {
            Error::Validation(message) => return message.clone(),
            Error::VendorApi { status, message } => {
                return format!("vendor API returned HTTP {status}: {message}")
            }
            Error::Configuration(_) => "server is misconfigured",
            Error::Connection(_) | Error::Interrupted(_) => "could not reach the vendor API",
            Error::Timeout(_) => "the vendor API did not respond in time",
            Error::Authentication(_) => {
                "authentication with the vendor API failed; check the configured credentials"
            }
            Error::CircuitOpen { .. } => {
                "the vendor API is temporarily unavailable after repeated failures"
            }
            Error::NotFound(_) => "the requested resource was not found",
            Error::Io(_) | Error::Internal(_) => "internal error, check server logs",
        };
        format!("{generic} (ref: {correlation_id})")
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_builder() {
            Error::Configuration(err.to_string())
        } else if err.is_decode() {
            Error::Internal(err.to_string())
        } else if err.is_connect() {
            Error::Connection(err.to_string())
        } else {
            Error::Interrupted(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {err}"))
    }
}
