//! Command dispatcher: reads commands, runs statements, reports outcomes.

use crate::catalog::{self, TableDescription, TableInfo, TableRef};
use crate::error::{SessionError, SessionResult};
use crate::export;
use crate::handle::{ConnectionHandle, QueryOutput};
use crate::state::SessionStateMachine;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Directives that end the session. Matched exactly, case-sensitively.
pub const QUIT_DIRECTIVES: [&str; 3] = ["/quit", "/exit", "/q"];
pub const HELP_DIRECTIVE: &str = "/help";

const DESCRIBE_USAGE: &str = "/describe <table>";
const SAVE_USAGE: &str = "/save [file]";

/// One line of user input, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    Help,
    Tables,
    Schema,
    Describe(TableRef),
    Save(Option<String>),
    Browse,
    /// A known directive with the wrong arguments; carries its usage line.
    Usage(&'static str),
    Statement(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        if QUIT_DIRECTIVES.contains(&line) {
            return Command::Quit;
        }

        let mut words = line.split_whitespace();
        let head = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        match (head, args.as_slice()) {
            ("/help" | "/h", []) => Command::Help,
            ("/tables" | "/t", []) => Command::Tables,
            ("/schema" | "/s", []) => Command::Schema,
            ("/browse" | "/b", []) => Command::Browse,
            ("/describe" | "/d", [target]) => match TableRef::parse(target) {
                Some(table) => Command::Describe(table),
                None => Command::Usage(DESCRIBE_USAGE),
            },
            ("/describe" | "/d", _) => Command::Usage(DESCRIBE_USAGE),
            ("/save", []) => Command::Save(None),
            ("/save", [file]) => Command::Save(Some(file.to_string())),
            ("/save", _) => Command::Usage(SAVE_USAGE),
            ("/help" | "/h", _) => Command::Usage(HELP_DIRECTIVE),
            ("/tables" | "/t", _) => Command::Usage("/tables"),
            ("/schema" | "/s", _) => Command::Usage("/schema"),
            ("/browse" | "/b", _) => Command::Usage("/browse"),
            _ => Command::Statement(line.to_string()),
        }
    }
}

/// What the presentation layer is told about one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The statement succeeded.
    Rows {
        output: QueryOutput,
        elapsed: Duration,
    },
    /// The server rejected or failed the statement.
    QueryFailed { message: String },
    /// The statement was stopped by a user interrupt.
    Cancelled { message: String },
    /// The command could not be accepted in the current state.
    Rejected { message: String },
    Help,
    Tables(Vec<TableInfo>),
    Schema(Vec<TableInfo>),
    Described(TableDescription),
    Saved {
        path: PathBuf,
        rows: usize,
        columns: usize,
    },
    /// Show the last result in a pager.
    Browse { sql: String, output: QueryOutput },
}

/// The most recent statement that returned a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastResult {
    pub sql: String,
    pub output: QueryOutput,
}

/// Input collaborator: yields one command string per user action.
#[async_trait]
pub trait CommandSource: Send {
    /// `Ok(None)` means end of input.
    async fn next_command(&mut self) -> SessionResult<Option<String>>;
}

/// Output collaborator.
#[async_trait]
pub trait ResultSink: Send {
    async fn report(&mut self, outcome: &Outcome);
}

/// Why [`Dispatcher::run_loop`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Quit,
    EndOfInput,
}

/// Result of one statement: output, or the outcome that replaces it.
type Step = Result<(QueryOutput, Duration), Outcome>;

/// Unwrap a successful [`Step`] or return its outcome.
macro_rules! step {
    ($step:expr) => {
        match $step? {
            Ok((output, _)) => output,
            Err(outcome) => return Ok(outcome),
        }
    };
}

pub struct Dispatcher<H> {
    machine: Arc<SessionStateMachine>,
    handle: H,
    last: Option<LastResult>,
}

impl<H: ConnectionHandle> Dispatcher<H> {
    pub fn new(machine: Arc<SessionStateMachine>, handle: H) -> Self {
        Self {
            machine,
            handle,
            last: None,
        }
    }

    pub fn machine(&self) -> &Arc<SessionStateMachine> {
        &self.machine
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn last_result(&self) -> Option<&LastResult> {
        self.last.as_ref()
    }

    /// Process commands until quit, end of input, or a lost connection.
    ///
    /// Query errors and cancellations are reported to `sink` and the loop
    /// carries on. Only [`SessionError::ConnectionLost`] escapes.
    pub async fn run_loop<S, R>(&mut self, source: &mut S, sink: &mut R) -> SessionResult<LoopExit>
    where
        S: CommandSource + ?Sized,
        R: ResultSink + ?Sized,
    {
        loop {
            let line = match source.next_command().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("end of input");
                    self.shutdown().await?;
                    return Ok(LoopExit::EndOfInput);
                }
                Err(e) => {
                    if let Err(shutdown) = self.shutdown().await {
                        warn!(error = %shutdown, "could not shut down after input failure");
                    }
                    return Err(e);
                }
            };

            let result = match Command::parse(&line) {
                Command::Empty => continue,
                Command::Quit => match self.shutdown().await {
                    Ok(()) => {
                        info!("quit");
                        return Ok(LoopExit::Quit);
                    }
                    Err(e) => Ok(Outcome::Rejected {
                        message: e.to_string(),
                    }),
                },
                Command::Help => Ok(Outcome::Help),
                Command::Usage(usage) => Ok(Outcome::Rejected {
                    message: format!("usage: {}", usage),
                }),
                Command::Statement(sql) => self.execute(&sql).await,
                Command::Tables => self.list_tables(false).await,
                Command::Schema => self.list_tables(true).await,
                Command::Describe(table) => self.describe(table).await,
                Command::Save(file) => Ok(self.save(file.as_deref()).await),
                Command::Browse => Ok(self.browse()),
            };

            match result {
                Ok(outcome) => sink.report(&outcome).await,
                Err(e) => {
                    warn!(error = %e, "session ended");
                    if let Err(terminate) = self.machine.terminate() {
                        warn!(error = %terminate, "could not enter Terminating");
                    }
                    if let Err(close) = self.handle.close().await {
                        warn!(error = %close, "failed to close connection");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run one statement and remember its result set for `/save` and `/browse`.
    ///
    /// Returns `Err` only for fatal errors.
    pub async fn execute(&mut self, sql: &str) -> SessionResult<Outcome> {
        match self.run_statement(sql).await? {
            Ok((output, elapsed)) => {
                if !output.columns.is_empty() {
                    self.last = Some(LastResult {
                        sql: sql.to_string(),
                        output: output.clone(),
                    });
                }
                Ok(Outcome::Rows { output, elapsed })
            }
            Err(outcome) => Ok(outcome),
        }
    }

    /// Idle -> Executing -> Idle around one round trip.
    ///
    /// Does not return before a cancel aimed at this statement has been sent
    /// or dropped, so it can never reach the statement after it.
    async fn run_statement(&mut self, sql: &str) -> SessionResult<Step> {
        let pending = match self.machine.begin_execution(sql) {
            Ok(pending) => pending,
            Err(e @ SessionError::InvalidState { .. }) => {
                return Ok(Err(Outcome::Rejected {
                    message: e.to_string(),
                }));
            }
            Err(e) => return Err(e),
        };

        let started = Instant::now();
        let result = self.handle.execute(&pending.sql).await;
        let cancel_requested = self.machine.complete_execution(&pending);
        let elapsed = started.elapsed();
        self.machine.cancel_settled().await;
        debug!(seq = pending.seq, ?elapsed, cancel_requested, "execute returned");

        match result {
            Ok(output) => Ok(Ok((output, elapsed))),
            Err(SessionError::Cancelled(message)) if cancel_requested => {
                Ok(Err(Outcome::Cancelled { message }))
            }
            // 57014 nobody here asked for: statement_timeout, pg_cancel_backend, ...
            Err(SessionError::Cancelled(message)) => Ok(Err(Outcome::QueryFailed { message })),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok(Err(Outcome::QueryFailed {
                message: e.to_string(),
            })),
        }
    }

    async fn list_tables(&mut self, by_schema: bool) -> SessionResult<Outcome> {
        let output = step!(self.run_statement(catalog::LIST_TABLES).await);
        let tables = catalog::parse_tables(&output);
        Ok(if by_schema {
            Outcome::Schema(tables)
        } else {
            Outcome::Tables(tables)
        })
    }

    async fn describe(&mut self, table: TableRef) -> SessionResult<Outcome> {
        let info = step!(self.run_statement(&catalog::table_query(&table)).await);
        let Some((kind, comment)) = catalog::parse_table(&info) else {
            return Ok(Outcome::QueryFailed {
                message: format!("table {} not found", table),
            });
        };
        let columns = step!(self.run_statement(&catalog::columns_query(&table)).await);
        let foreign_keys = step!(self.run_statement(&catalog::foreign_keys_query(&table)).await);

        Ok(Outcome::Described(TableDescription {
            table,
            kind,
            comment,
            columns: catalog::parse_columns(&columns),
            foreign_keys: catalog::parse_foreign_keys(&foreign_keys),
        }))
    }

    fn last_with_rows(&self, action: &str) -> Result<&LastResult, Outcome> {
        match &self.last {
            None => Err(Outcome::Rejected {
                message: format!("no query results to {}; run a query first", action),
            }),
            Some(last) if last.output.rows.is_empty() => Err(Outcome::Rejected {
                message: format!("last query returned no rows to {}", action),
            }),
            Some(last) => Ok(last),
        }
    }

    async fn save(&mut self, file: Option<&str>) -> Outcome {
        let last = match self.last_with_rows("save") {
            Ok(last) => last,
            Err(outcome) => return outcome,
        };
        match export::save_csv(&last.output, file).await {
            Ok(path) => {
                info!(path = %path.display(), "results saved");
                Outcome::Saved {
                    path,
                    rows: last.output.rows.len(),
                    columns: last.output.columns.len(),
                }
            }
            Err(e) => Outcome::Rejected {
                message: e.to_string(),
            },
        }
    }

    fn browse(&self) -> Outcome {
        match self.last_with_rows("browse") {
            Ok(last) => Outcome::Browse {
                sql: last.sql.clone(),
                output: last.output.clone(),
            },
            Err(outcome) => outcome,
        }
    }

    /// Terminating, then close the connection.
    ///
    /// Fails only when the session cannot terminate now. A failed close is
    /// logged; the session is over either way.
    async fn shutdown(&mut self) -> SessionResult<()> {
        self.machine.terminate()?;
        if let Err(e) = self.handle.close().await {
            warn!(error = %e, "failed to close connection cleanly");
        }
        Ok(())
    }
}
