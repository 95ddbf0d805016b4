//! Failure taxonomy for storage- and network-facing operations.
//!
//! Raw failures arrive as `std::io::Error`s or as bare messages from
//! platform layers. Both are sorted into a small set of kinds so that retry
//! and fallback decisions never depend on backend-specific types.

use std::fmt;
use std::io;
use thiserror::Error;

/// Coarse category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Abort,
    Other,
}

impl ErrorKind {
    /// Network and timeout failures are worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Abort => "abort",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

const ABORT_PATTERNS: &[&str] = &["abort", "cancel"];
const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline"];
const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "connection",
    "connect",
    "unreachable",
    "offline",
    "dns",
    "resolve",
    "refused",
    "reset by peer",
    "broken pipe",
    "socket",
    "fetch",
];

/// Classify a failure by its message. Case-insensitive.
///
/// Abort patterns win over timeout, and timeout over network, so that
/// "connection timed out" is a timeout and "request aborted" is an abort.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if has(ABORT_PATTERNS) {
        ErrorKind::Abort
    } else if has(TIMEOUT_PATTERNS) {
        ErrorKind::Timeout
    } else if has(NETWORK_PATTERNS) {
        ErrorKind::Network
    } else {
        ErrorKind::Other
    }
}

/// Classify an I/O error by kind, falling back to its message.
pub fn classify_io(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::TimedOut => ErrorKind::Timeout,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::BrokenPipe => ErrorKind::Network,
        io::ErrorKind::Interrupted => ErrorKind::Abort,
        _ => classify_message(&err.to_string()),
    }
}

/// A classified failure from an external dependency.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Aborted: {0}")]
    Abort(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_kind(classify_message(&message), message)
    }

    pub fn from_io(err: &io::Error) -> Self {
        Self::with_kind(classify_io(err), err.to_string())
    }

    pub fn with_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Network => TransportError::Network(message),
            ErrorKind::Timeout => TransportError::Timeout(message),
            ErrorKind::Abort => TransportError::Abort(message),
            ErrorKind::Other => TransportError::Other(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Network(_) => ErrorKind::Network,
            TransportError::Timeout(_) => ErrorKind::Timeout,
            TransportError::Abort(_) => ErrorKind::Abort,
            TransportError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::from_io(&err)
    }
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        TransportError::Timeout(err.to_string())
    }
}

/// Retry predicate for [`TransportError`]s: retry transient failures only.
pub fn retry_transient(err: &TransportError, _attempt: u32) -> bool {
    err.is_transient()
}
