//! Error types for relay-sync-agent
//!
//! One crate-wide error type with enough context (user sid, job id, path) to
//! log and recover without re-deriving it, plus a retryability classification
//! shared between the remote client's retry loop and generic retry helpers.

use thiserror::Error;

/// Result type alias for relay-sync-agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for relay-sync-agent
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable description of the problem
        message: String,
        /// The configuration key that caused the error, if known
        key: Option<String>,
    },

    /// I/O error performing a local filesystem operation
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reading or writing a user's persisted state file
    #[error("state store error for user {sid}: {message}")]
    State {
        /// The user this state store belongs to
        sid: String,
        /// Human-readable description of the problem
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote platform error, classified into transient or semantic
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Profile enumeration or resolution error
    #[error("profile error: {0}")]
    Profile(String),

    /// IPC transport or protocol error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The IPC endpoint is already bound by another live process
    #[error("IPC endpoint already in use")]
    IpcEndpointInUse,

    /// Operation attempted on a user that is not known to the orchestrator
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// Operation attempted on a daemon in the wrong lifecycle state
    #[error("daemon for user {sid} is already {state}")]
    AlreadyInState {
        /// The user whose daemon is in the wrong state
        sid: String,
        /// The state that made the operation invalid (e.g. "running", "stopped")
        state: &'static str,
    },

    /// Cancellation was requested; not a failure, just an early exit
    #[error("operation cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Errors from the remote compute platform's HTTP API, pre-classified by retryability.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network-level failure (connect/timeout/reset) — always retryable
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// 5xx server error — retryable
    #[error("server error {status}: {body}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// 429 Too Many Requests — retryable, honoring `Retry-After` when present
    #[error("rate limited (scope={scope:?}, retry_after={retry_after:?})")]
    TooManyRequests {
        /// The rate scope the client inferred for this request
        scope: String,
        /// Server-supplied retry hint, if any
        retry_after: Option<std::time::Duration>,
    },

    /// A 4xx error other than 429 — not retryable, surfaced for policy decisions
    #[error("client error {status}: {body}")]
    Client {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// Distinguished duplicate-file error (409, or 400 whose body names a conflict)
    #[error("file already exists")]
    FileAlreadyExists,

    /// Response body did not decode into the expected shape
    #[error("failed to decode response body: {0}")]
    Decode(String),

    /// Request was cancelled by the caller
    #[error("request cancelled")]
    Cancelled,
}

impl RemoteError {
    /// Whether this error should be retried by the remote client's retry loop.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            RemoteError::Server { .. } => true,
            RemoteError::TooManyRequests { .. } => true,
            RemoteError::Client { .. } => false,
            RemoteError::FileAlreadyExists => false,
            RemoteError::Decode(_) => false,
            RemoteError::Cancelled => false,
        }
    }
}

/// Trait for errors that can be classified as retryable or not.
///
/// Transient failures (network timeouts, 5xx, 429) should return `true`.
/// Permanent failures (bad input, not found, decode failure) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;

    /// A server-supplied wait hint that should override the computed
    /// backoff delay for the next retry, if this error carries one (e.g. a
    /// 429's `Retry-After` header). `None` means "use the computed delay".
    fn retry_after(&self) -> Option<std::time::Duration> {
        None
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Remote(e) => e.is_retryable(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Error::Remote(e) => e.retry_after(),
            _ => None,
        }
    }
}

impl IsRetryable for RemoteError {
    fn is_retryable(&self) -> bool {
        RemoteError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            RemoteError::TooManyRequests { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Structured detail attached to an IPC error response, mirroring the shape
/// clients expect: a machine-readable code plus a human-readable message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g. "unknown_user", "already_running")
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl Error {
    /// Machine-readable error code for this error, used in the IPC error envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Io(_) => "io_error",
            Error::State { .. } => "state_error",
            Error::Serialization(_) => "serialization_error",
            Error::Remote(_) => "remote_error",
            Error::Profile(_) => "profile_error",
            Error::Ipc(_) => "ipc_error",
            Error::IpcEndpointInUse => "ipc_endpoint_in_use",
            Error::UnknownUser(_) => "unknown_user",
            Error::AlreadyInState { .. } => "already_in_state",
            Error::Cancelled => "cancelled",
            Error::Other(_) => "internal_error",
        }
    }

    /// Build the IPC error detail for this error.
    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_server_error_is_retryable() {
        let err = RemoteError::Server {
            status: 503,
            body: "unavailable".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn remote_client_error_is_not_retryable() {
        let err = RemoteError::Client {
            status: 400,
            body: "bad request".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn file_already_exists_is_not_retryable() {
        assert!(!RemoteError::FileAlreadyExists.is_retryable());
    }

    #[test]
    fn too_many_requests_is_retryable() {
        let err = RemoteError::TooManyRequests {
            scope: "default".into(),
            retry_after: Some(std::time::Duration::from_secs(5)),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn error_code_matches_variant() {
        assert_eq!(Error::Cancelled.error_code(), "cancelled");
        assert_eq!(
            Error::UnknownUser("bob".into()).error_code(),
            "unknown_user"
        );
    }

    #[test]
    fn to_detail_preserves_display_message() {
        let err = Error::UnknownUser("bob".into());
        let detail = err.to_detail();
        assert_eq!(detail.code, "unknown_user");
        assert_eq!(detail.message, err.to_string());
    }
}
