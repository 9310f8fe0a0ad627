//! Error types for the sync engine.

use crate::http::ClientFailure;
use crate::store::StoreError;
use docsync_protocol::{CodecError, ErrorCode};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// A synchronization is already in progress.
    #[error("a synchronization is already running")]
    AlreadyRunning,

    /// The engine was closed and cannot be used any more.
    #[error("sync engine is closed")]
    Closed,

    /// The engine was created outside a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The operation is not allowed in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Current state.
        state: String,
        /// Rejected operation.
        operation: String,
    },

    /// The request did not complete within its timeout.
    #[error("operation timed out")]
    Timeout,

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The access credential is no longer valid.
    #[error("access token is no longer valid")]
    Gone,

    /// Unexpected or malformed backend response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The run was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The run task panicked.
    #[error("sync run aborted: {0}")]
    Aborted(String),
}

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Local validation failed before any work started.
    Precondition,
    /// A request timed out.
    Timeout,
    /// The network failed.
    Transport,
    /// The access credential was invalidated.
    Gone,
    /// The backend answered with something unexpected.
    Protocol,
    /// The local store failed.
    Storage,
    /// The run was cancelled.
    Cancelled,
    /// The engine itself failed.
    Internal,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::AlreadyRunning
            | SyncError::Closed
            | SyncError::NoRuntime
            | SyncError::InvalidState { .. } => ErrorKind::Precondition,
            SyncError::Timeout => ErrorKind::Timeout,
            SyncError::Transport { .. } => ErrorKind::Transport,
            SyncError::Gone => ErrorKind::Gone,
            SyncError::Protocol(_) => ErrorKind::Protocol,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Aborted(_) => ErrorKind::Internal,
        }
    }

    /// Returns true for errors raised synchronously before any work started.
    pub fn is_precondition(&self) -> bool {
        self.kind() == ErrorKind::Precondition
    }

    /// Returns true if the access credential must be renewed.
    pub fn is_gone(&self) -> bool {
        matches!(self, SyncError::Gone)
    }

    /// Returns true if the next run may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Returns the per-item error code reported in events.
    pub fn error_code(&self) -> ErrorCode {
        match self.kind() {
            ErrorKind::Timeout | ErrorKind::Cancelled => ErrorCode::TIMEOUT,
            ErrorKind::Transport => ErrorCode::TRANSPORT,
            ErrorKind::Gone => ErrorCode::GONE,
            ErrorKind::Protocol => ErrorCode::PROTOCOL,
            ErrorKind::Storage => ErrorCode::STORAGE,
            ErrorKind::Precondition => ErrorCode::BAD_REQUEST,
            ErrorKind::Internal => ErrorCode::INTERNAL,
        }
    }
}

impl From<CodecError> for SyncError {
    fn from(err: CodecError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// Maps raw transport outcomes onto [`SyncError`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classifies an HTTP status. Returns `None` for success statuses.
    pub fn classify_status(status: u16) -> Option<SyncError> {
        match status {
            200..=299 => None,
            410 => Some(SyncError::Gone),
            408 | 504 => Some(SyncError::Timeout),
            500..=599 => Some(SyncError::transport_retryable(format!(
                "backend returned status {status}"
            ))),
            _ => Some(SyncError::Protocol(format!(
                "unexpected status {status}"
            ))),
        }
    }

    /// Classifies a failure raised by the HTTP client itself.
    pub fn classify_failure(failure: &ClientFailure) -> SyncError {
        match failure {
            ClientFailure::TimedOut => SyncError::Timeout,
            ClientFailure::Io(message) => SyncError::transport_retryable(message.clone()),
        }
    }

    /// Classifies a per-item error code reported by the backend.
    pub fn classify_code(code: ErrorCode) -> ErrorKind {
        match code.value() {
            410 => ErrorKind::Gone,
            408 | 504 => ErrorKind::Timeout,
            900 => ErrorKind::Transport,
            902 => ErrorKind::Storage,
            500..=599 => ErrorKind::Transport,
            _ => ErrorKind::Protocol,
        }
    }
}
