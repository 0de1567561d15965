//! Core I/O operations for PostgreSQL connection.

use super::{PgConnection, PgError, PgResult};
use crate::protocol::{BackendMessage, FrontendMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read-ahead reserved whenever the receive buffer runs low.
const READ_CHUNK: usize = 8192;

/// Largest backend message accepted, length field included. The server
/// caps a single field at 1 GiB.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

impl PgConnection {
    /// Send a frontend message and flush it.
    pub async fn send(&mut self, msg: FrontendMessage) -> PgResult<()> {
        let bytes = msg.encode();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one backend message, reading from the socket as needed.
    pub async fn recv(&mut self) -> PgResult<BackendMessage> {
        loop {
            if self.buffer.len() >= 5 {
                let msg_len = u32::from_be_bytes([
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                    self.buffer[4],
                ]) as usize;

                if !(4..=MAX_MESSAGE_LEN).contains(&msg_len) {
                    return Err(PgError::Protocol(format!(
                        "Invalid message length {} for type '{}'",
                        msg_len, self.buffer[0] as char
                    )));
                }

                if self.buffer.len() > msg_len {
                    let msg_bytes = self.buffer.split_to(msg_len + 1);
                    let (msg, _) =
                        BackendMessage::decode(&msg_bytes).map_err(PgError::Protocol)?;
                    return Ok(msg);
                }
            }

            if self.buffer.capacity() - self.buffer.len() < READ_CHUNK {
                self.buffer.reserve(READ_CHUNK * 8);
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(PgError::Connection("Connection closed".to_string()));
            }
        }
    }
}
