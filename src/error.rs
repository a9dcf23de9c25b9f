//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result<T>`]. `Error` wraps a boxed
//! [`ErrorKind`] plus a set of string labels used for cheap retryability checks without
//! re-matching the full kind at every call site.

use std::{collections::HashSet, fmt};

use thiserror::Error as ThisError;

/// Label attached to errors that a caller may safely retry.
pub const RETRYABLE: &str = "retryable";
/// Label attached to errors that should abort the owning source's dispatcher.
pub const FATAL: &str = "fatal";
/// Label attached to errors that mean the remote host could not be reached at all (DNS,
/// connect, timeout) — distinct from a reachable host returning an error status. Only this
/// label should make the Broker (§4.2) fail fast instead of retrying the login step.
pub const UNREACHABLE: &str = "unreachable";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, ThisError)]
#[error("{kind}")]
pub struct Error {
    kind: Box<ErrorKind>,
    labels: HashSet<&'static str>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.labels.contains(RETRYABLE)
    }

    pub fn is_fatal(&self) -> bool {
        self.labels.contains(FATAL)
    }

    /// True only for a genuine connectivity failure (DNS, connect, timeout) — never for a
    /// reachable host that responded with an error status. See [`UNREACHABLE`].
    pub fn is_unreachable(&self) -> bool {
        self.labels.contains(UNREACHABLE)
    }

    fn new(kind: ErrorKind, labels: &[&'static str]) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels.iter().copied().collect(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth { message: message.into() }, &[FATAL])
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network { message: message.into() }, &[RETRYABLE, UNREACHABLE])
    }

    pub fn parse(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Parse { file: file.into(), message: message.into() },
            &[],
        )
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage { message: message.into() }, &[])
    }

    pub fn embedding(status: u16, body: impl Into<String>) -> Self {
        Self::new(ErrorKind::Embedding { status, body: body.into() }, &[])
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config { message: message.into() }, &[FATAL])
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Auth { .. })
    }

    pub fn is_network_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Network { .. })
    }

    pub fn is_parse_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Parse { .. })
    }

    pub fn is_storage_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Storage { .. })
    }

    pub fn is_embedding_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Embedding { .. })
    }
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Login to an upstream source failed after exhausting retries.
    Auth { message: String },
    /// A transient network failure; may be retried at the HTTP layer.
    Network { message: String },
    /// A document standardizer produced no text for a file.
    Parse { file: String, message: String },
    /// A metadata store write failed.
    Storage { message: String },
    /// The embedding endpoint returned a non-200 response.
    Embedding { status: u16, body: String },
    /// A configuration value failed validation.
    Config { message: String },
    Io(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Auth { message } => write!(f, "authentication failed: {message}"),
            ErrorKind::Network { message } => write!(f, "network error: {message}"),
            ErrorKind::Parse { file, message } => write!(f, "failed to parse {file}: {message}"),
            ErrorKind::Storage { message } => write!(f, "storage error: {message}"),
            ErrorKind::Embedding { status, body } => {
                write!(f, "embedding endpoint returned {status}: {body}")
            }
            ErrorKind::Config { message } => write!(f, "invalid configuration: {message}"),
            ErrorKind::Io(message) => write!(f, "io error: {message}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io(err.to_string()), &[])
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Only a true connect/timeout failure means the host could not be reached at all;
        // an error HTTP status (e.g. from `.error_for_status()`) means the host *was*
        // reached and responded, so it must not trip the Broker's fail-fast-on-unreachable
        // path (§4.2) — it's a per-attempt failure like any other and should be retried.
        let labels: &[&'static str] = if err.is_timeout() || err.is_connect() {
            &[RETRYABLE, UNREACHABLE]
        } else {
            &[]
        };
        Error::new(ErrorKind::Network { message: err.to_string() }, labels)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::new(ErrorKind::Storage { message: err.to_string() }, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_retryable() {
        let err = Error::network("timed out");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn auth_errors_are_fatal() {
        let err = Error::auth("bad password");
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }
}
