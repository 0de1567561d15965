//! PostgreSQL driver for interactive sessions.
//!
//! Simple-query execution over TCP, TLS or Unix sockets, SCRAM-SHA-256
//! authentication, and out-of-band cancellation of the running statement.
//!
//! ```ignore
//! let opts = ConnectOptions::new("localhost", 5432, "user", "db");
//! let mut conn = PgConnection::connect(&opts).await?;
//! let (token, endpoint) = (conn.cancel_token(), conn.cancel_endpoint());
//! tokio::spawn(async move { endpoint.send_cancel(token).await });
//! let result = conn.simple_query("SELECT pg_sleep(10)").await; // Err(QueryCanceled)
//! ```

pub mod driver;
pub mod protocol;

pub use driver::{
    CancelEndpoint, CancelToken, ConnectOptions, PgConnection, PgError, PgResult, PgRow,
    QueryResult, SslMode,
};
pub use protocol::{ErrorFields, TransactionStatus};
