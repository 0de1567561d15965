//! Connection handle: one established link plus its detached canceller.

use crate::cancel::CancelChannel;
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use pgshell_pg::{
    CancelToken, ConnectOptions, PgConnection, PgError, QueryResult, TransactionStatus,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rows and status of one executed statement, decoded to text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub command_tag: Option<String>,
    pub notices: Vec<String>,
}

impl From<QueryResult> for QueryOutput {
    fn from(result: QueryResult) -> Self {
        Self {
            columns: result.columns,
            rows: result.rows.iter().map(|r| r.to_text()).collect(),
            command_tag: result.command_tag,
            notices: result.notices,
        }
    }
}

/// The handle's `cancel()` capability, usable while `execute` holds the handle.
///
/// Session wiring hands it to the [`CancelWorker`](crate::cancel::CancelWorker).
#[derive(Clone)]
pub struct Canceller {
    token: CancelToken,
    channel: Arc<dyn CancelChannel>,
}

impl Canceller {
    pub fn new(token: CancelToken, channel: Arc<dyn CancelChannel>) -> Self {
        Self { token, channel }
    }

    /// Ask the server to stop whatever the owning connection is running.
    pub async fn cancel(&self) -> SessionResult<()> {
        self.channel.send_cancel(self.token).await
    }
}

/// One established database link.
#[async_trait]
pub trait ConnectionHandle: Send {
    /// Run a statement and wait for the server's answer.
    async fn execute(&mut self, sql: &str) -> SessionResult<QueryOutput>;

    /// Cancel capability for this link; never touches the link itself.
    fn canceller(&self) -> Canceller;

    /// Release the link. Calling it again is a no-op.
    async fn close(&mut self) -> SessionResult<()>;
}

/// [`ConnectionHandle`] over a [`PgConnection`].
pub struct PgHandle {
    conn: Option<PgConnection>,
    canceller: Canceller,
}

impl PgHandle {
    pub async fn connect(opts: &ConnectOptions) -> SessionResult<Self> {
        let conn = PgConnection::connect(opts)
            .await
            .map_err(|e| SessionError::ConnectionLost(e.to_string()))?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: PgConnection) -> Self {
        let canceller = Canceller::new(conn.cancel_token(), Arc::new(conn.cancel_endpoint()));
        Self {
            conn: Some(conn),
            canceller,
        }
    }

    /// `server_version` as reported at startup.
    pub fn server_version(&self) -> Option<&str> {
        self.conn.as_ref()?.server_parameter("server_version")
    }
}

#[async_trait]
impl ConnectionHandle for PgHandle {
    async fn execute(&mut self, sql: &str) -> SessionResult<QueryOutput> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| SessionError::ConnectionLost("connection is closed".to_string()))?;

        match conn.simple_query(sql).await {
            Ok(result) => Ok(result.into()),
            Err(e) => {
                if matches!(e, PgError::QueryCanceled(_))
                    && conn.transaction_status() == TransactionStatus::Failed
                {
                    warn!("cancelled statement aborted the open transaction; ROLLBACK to continue");
                }
                if e.is_fatal() {
                    // The link is unusable; drop it so later calls fail fast.
                    self.conn = None;
                }
                Err(e.into())
            }
        }
    }

    fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    async fn close(&mut self) -> SessionResult<()> {
        let Some(mut conn) = self.conn.take() else {
            debug!("close on already closed handle");
            return Ok(());
        };
        conn.close().await.map_err(SessionError::from)?;
        info!("connection closed");
        Ok(())
    }
}
