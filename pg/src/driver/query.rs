//! Simple query execution.

use super::row::{PgRow, QueryResult};
use super::{PgConnection, PgError, PgResult};
use crate::protocol::{BackendMessage, ErrorFields, FrontendMessage};
use tracing::debug;

impl PgConnection {
    /// Run `sql` over the simple query protocol.
    ///
    /// Always reads through to ReadyForQuery, also after an ErrorResponse, so
    /// the connection is back in sync when this returns. A statement the
    /// server terminated with SQLSTATE 57014 comes back as
    /// [`PgError::QueryCanceled`].
    pub async fn simple_query(&mut self, sql: &str) -> PgResult<QueryResult> {
        if sql.contains('\0') {
            return Err(PgError::InvalidStatement(
                "statement contains a NUL byte (0x00)".to_string(),
            ));
        }
        if self.is_closed() {
            return Err(PgError::Connection("Connection already closed".to_string()));
        }

        self.send(FrontendMessage::Query(sql.to_string())).await?;

        let mut result = QueryResult::default();
        let mut failure: Option<ErrorFields> = None;

        loop {
            match self.recv().await? {
                BackendMessage::RowDescription(fields) => {
                    result.columns = fields.into_iter().map(|f| f.name).collect();
                    result.rows.clear();
                }
                BackendMessage::DataRow(columns) => result.rows.push(PgRow::new(columns)),
                BackendMessage::CommandComplete(tag) => result.command_tag = Some(tag),
                BackendMessage::EmptyQueryResponse => {}
                BackendMessage::ErrorResponse(err) => {
                    debug!(code = %err.code, message = %err.message, "statement failed");
                    // Only the first error matters; the rest of the batch was skipped.
                    failure.get_or_insert(err);
                }
                BackendMessage::NoticeResponse(notice) => result.notices.push(notice.to_string()),
                BackendMessage::CopyInResponse { .. } => {
                    self.send(FrontendMessage::CopyFail(
                        "COPY FROM STDIN is not supported".to_string(),
                    ))
                    .await?;
                }
                BackendMessage::CopyOutResponse { .. }
                | BackendMessage::CopyData(_)
                | BackendMessage::CopyDone => {}
                BackendMessage::ParameterStatus { name, value } => {
                    self.server_params.insert(name, value);
                }
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    debug!(process_id, %channel, %payload, "notification");
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.transaction_status = status;
                    return match failure {
                        Some(err) if err.is_query_canceled() => Err(PgError::QueryCanceled(err)),
                        Some(err) => Err(PgError::Server(err)),
                        None => Ok(result),
                    };
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "Unexpected message during query: {:?}",
                        other
                    )));
                }
            }
        }
    }
}
