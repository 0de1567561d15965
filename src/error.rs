//! Error types for pgshell sessions.

use crate::state::SessionState;
use pgshell_pg::PgError;
use thiserror::Error;

/// The main error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A command was issued while the session could not accept it.
    #[error("Invalid session state: expected {expected}, found {found}")]
    InvalidState {
        expected: SessionState,
        found: SessionState,
    },

    /// The server rejected or failed the statement.
    #[error("{0}")]
    Query(String),

    /// The statement was terminated by a matched cancel request.
    #[error("Query cancelled: {0}")]
    Cancelled(String),

    /// The out-of-band cancel request could not be delivered.
    #[error("Cancel request failed: {0}")]
    CancelSend(String),

    /// The primary link is gone; the session cannot continue.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A result could not be exported.
    #[error("Export error: {0}")]
    Export(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Create an invalid state error.
    pub fn invalid_state(expected: SessionState, found: SessionState) -> Self {
        Self::InvalidState { expected, found }
    }

    /// True when the run loop must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::ConnectionLost(_))
    }
}

impl From<PgError> for SessionError {
    fn from(err: PgError) -> Self {
        match err {
            PgError::QueryCanceled(fields) => SessionError::Cancelled(fields.message),
            PgError::Server(fields) => SessionError::Query(fields.to_string()),
            PgError::InvalidStatement(msg) => SessionError::Query(msg),
            PgError::Auth(msg) => SessionError::Query(msg),
            fatal @ (PgError::Connection(_) | PgError::Protocol(_) | PgError::Io(_)) => {
                SessionError::ConnectionLost(fatal.to_string())
            }
        }
    }
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
