//! PostgreSQL Wire Protocol (pure, sync)
//!
//! No async, no I/O - just messages ↔ bytes and the SCRAM state machine.

pub mod auth;
pub mod wire;

pub use auth::ScramClient;
pub use wire::*;
