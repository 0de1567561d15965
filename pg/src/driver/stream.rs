//! Stream abstraction for TCP, TLS, and Unix socket connections.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream;

/// A PostgreSQL connection stream (TCP, TLS, or Unix).
#[allow(clippy::large_enum_variant)]
pub enum PgStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl PgStream {
    /// Non-blocking best-effort write, used from `Drop`.
    pub(crate) fn try_write(&self, buf: &[u8]) {
        match self {
            PgStream::Tcp(tcp) => {
                let _ = tcp.try_write(buf);
            }
            // TLS needs the async writer; the peer sees the TCP close instead.
            PgStream::Tls(_) => {}
            #[cfg(unix)]
            PgStream::Unix(unix) => {
                let _ = unix.try_write(buf);
            }
        }
    }
}

/// Forward a poll method to whichever stream variant is live.
macro_rules! delegate {
    ($self:ident, $stream:ident => $call:expr) => {
        match $self.get_mut() {
            PgStream::Tcp($stream) => {
                let $stream = Pin::new($stream);
                $call
            }
            PgStream::Tls($stream) => {
                let $stream = Pin::new($stream);
                $call
            }
            #[cfg(unix)]
            PgStream::Unix($stream) => {
                let $stream = Pin::new($stream);
                $call
            }
        }
    };
}

impl AsyncRead for PgStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, s => s.poll_read(cx, buf))
    }
}

impl AsyncWrite for PgStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, s => s.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => s.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => s.poll_shutdown(cx))
    }
}
