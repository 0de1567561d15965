//! PostgreSQL Driver Module (async I/O)
//!
//! Connection methods are split across modules:
//! - `connection.rs` - Core struct, connect and startup
//! - `io.rs` - send, recv
//! - `query.rs` - simple query execution
//! - `cancel.rs` - Out-of-band query cancellation
//! - `options.rs` - Connection parameters and SSL mode
//! - `stream.rs` - TCP / TLS / Unix stream

mod cancel;
mod connection;
mod io;
mod options;
mod query;
mod row;
mod stream;

pub use cancel::{CancelEndpoint, CancelToken};
pub use connection::PgConnection;
pub use options::{ConnectOptions, SslMode};
pub use row::{PgRow, QueryResult};

use crate::protocol::ErrorFields;
use thiserror::Error;

/// Error type for PostgreSQL driver operations.
#[derive(Debug, Error)]
pub enum PgError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Auth error: {0}")]
    Auth(String),
    /// Rejected client-side before anything was sent.
    #[error("Invalid statement: {0}")]
    InvalidStatement(String),
    /// The server rejected or failed the statement.
    #[error("{0}")]
    Server(ErrorFields),
    /// The server terminated the statement with SQLSTATE 57014.
    #[error("{0}")]
    QueryCanceled(ErrorFields),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PgError {
    /// True when the primary link can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Connection(_) | PgError::Protocol(_) | PgError::Io(_)
        )
    }
}

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;
