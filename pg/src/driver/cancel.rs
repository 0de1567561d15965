//! Out-of-band query cancellation.
//!
//! The primary link is busy reading the reply to the statement being
//! cancelled, so a CancelRequest always travels over a fresh, short-lived
//! connection to the same endpoint. The server never answers it.

use super::{PgConnection, PgResult};
use crate::protocol::FrontendMessage;
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Backend identity issued in BackendKeyData. Authorizes cancelling whatever
/// the owning connection is running; it is a capability, not a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelToken {
    process_id: i32,
    secret_key: i32,
}

impl CancelToken {
    pub fn new(process_id: i32, secret_key: i32) -> Self {
        Self {
            process_id,
            secret_key,
        }
    }

    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// The 16-byte CancelRequest packet.
    pub fn to_request(&self) -> Vec<u8> {
        FrontendMessage::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
        .encode()
    }
}

/// Where CancelRequests for a connection must be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelEndpoint {
    /// Peer address of the primary link.
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

impl CancelEndpoint {
    /// Open a link, write the CancelRequest, close. Fire-and-forget: success
    /// means the packet was handed to the OS, not that the server acted on it.
    pub async fn send_cancel(&self, token: CancelToken) -> PgResult<()> {
        let packet = token.to_request();
        match self {
            CancelEndpoint::Tcp(addr) => {
                let mut stream = TcpStream::connect(addr).await?;
                write_and_close(&mut stream, &packet).await?;
            }
            #[cfg(unix)]
            CancelEndpoint::Unix(path) => {
                let mut stream = tokio::net::UnixStream::connect(path).await?;
                write_and_close(&mut stream, &packet).await?;
            }
        }
        debug!(process_id = token.process_id(), endpoint = ?self, "cancel request sent");
        Ok(())
    }
}

async fn write_and_close<S>(stream: &mut S, packet: &[u8]) -> PgResult<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(packet).await?;
    stream.flush().await?;
    // The server closes its side on receipt; a failed shutdown changes nothing.
    let _ = stream.shutdown().await;
    Ok(())
}

impl PgConnection {
    /// Get the cancel key for this connection.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(self.process_id, self.secret_key)
    }

    /// The endpoint this connection was opened against.
    pub fn cancel_endpoint(&self) -> CancelEndpoint {
        self.endpoint.clone()
    }
}
