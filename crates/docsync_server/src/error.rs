//! Error types for the reference backend.

use docsync_protocol::CodecError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the reference backend.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Request body could not be decoded.
    #[error("malformed body: {0}")]
    Codec(#[from] CodecError),

    /// No access token was presented.
    #[error("access token required")]
    MissingToken,

    /// The access token is malformed, forged, expired or revoked.
    #[error("access token rejected: {0}")]
    InvalidToken(String),

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unknown endpoint.
    #[error("no route for {0}")]
    NoRoute(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns the HTTP status this error is reported with.
    ///
    /// Rejected tokens answer `410 Gone`, which clients treat as a terminal
    /// failure requiring new credentials.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Codec(_) => 400,
            ServerError::MissingToken => 401,
            ServerError::NotFound(_) | ServerError::NoRoute(_) => 404,
            ServerError::InvalidToken(_) => 410,
            ServerError::Internal(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}
