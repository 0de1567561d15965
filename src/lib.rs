//! # pgshell
//!
//! Interactive PostgreSQL session where Ctrl+C cancels the running
//! statement, not the connection.
//!
//! ```rust,ignore
//! use pgshell::prelude::*;
//!
//! let handle = PgHandle::connect(&config.connect_options(&settings)).await?;
//! let session = Session::new(handle);
//! let exit = session.run(&mut StdinSource::new(), &mut TerminalSink::new(OutputFormat::Table, false)).await?;
//! ```
//!
//! ## Pieces
//!
//! | Module       | Role                                                  |
//! |--------------|-------------------------------------------------------|
//! | `handle`     | Owns the link: execute, cancel, close                 |
//! | `cancel`     | Sends CancelRequest over a short-lived side link      |
//! | `state`      | Idle / Executing / Cancelling / Terminating           |
//! | `relay`      | SIGINT to cancel request                              |
//! | `dispatcher` | Reads commands, runs statements, reports outcomes     |
//! | `catalog`    | `/tables`, `/schema`, `/describe` queries             |
//! | `export`     | `/save` to CSV                                        |

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod export;
pub mod handle;
pub mod input;
pub mod output;
pub mod relay;
pub mod session;
pub mod state;

pub mod prelude {
    pub use crate::cancel::{CancelChannel, CancelWorker};
    pub use crate::catalog::{ColumnInfo, ForeignKey, TableDescription, TableInfo, TableRef};
    pub use crate::config::{ConnectionFlags, DbConfig, Settings};
    pub use crate::dispatcher::{Command, CommandSource, Dispatcher, LastResult, LoopExit, Outcome, ResultSink};
    pub use crate::error::*;
    pub use crate::handle::{Canceller, ConnectionHandle, PgHandle, QueryOutput};
    pub use crate::input::{ReadlineSource, StdinSource};
    pub use crate::output::{OutputFormat, TerminalSink};
    pub use crate::relay::InterruptRelay;
    pub use crate::session::Session;
    pub use crate::state::{CancelDecision, PendingStatement, SessionState, SessionStateMachine};
}
