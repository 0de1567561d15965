//! PostgreSQL Connection
//!
//! Low-level connection with startup, SSL negotiation and authentication.
//!
//! Methods are split across modules:
//! - `io.rs` - Core I/O (send, recv)
//! - `query.rs` - Query execution
//! - `cancel.rs` - Query cancellation

use super::cancel::CancelEndpoint;
use super::options::{ConnectOptions, SslMode};
use super::stream::PgStream;
use super::{PgError, PgResult};
use crate::protocol::auth::SCRAM_SHA_256;
use crate::protocol::{BackendMessage, FrontendMessage, ScramClient, TransactionStatus};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Initial receive buffer capacity
pub(crate) const BUFFER_CAPACITY: usize = 16384;

/// A raw PostgreSQL connection.
pub struct PgConnection {
    pub(crate) stream: PgStream,
    pub(crate) buffer: BytesMut,
    pub(crate) endpoint: CancelEndpoint,
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,
    pub(crate) transaction_status: TransactionStatus,
    pub(crate) server_params: HashMap<String, String>,
    closed: bool,
}

impl PgConnection {
    /// Open a session: transport, optional TLS, startup and authentication.
    pub async fn connect(opts: &ConnectOptions) -> PgResult<Self> {
        match opts.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, Self::establish(opts))
                .await
                .map_err(|_| PgError::Connection(format!("Connection timeout after {:?}", timeout)))?,
            None => Self::establish(opts).await,
        }
    }

    async fn establish(opts: &ConnectOptions) -> PgResult<Self> {
        let (stream, endpoint) = match opts.unix_socket_path() {
            Some(path) => Self::open_unix(&path).await?,
            None => Self::open_tcp(opts).await?,
        };

        let mut conn = Self {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_CAPACITY),
            endpoint,
            process_id: 0,
            secret_key: 0,
            transaction_status: TransactionStatus::Idle,
            server_params: HashMap::new(),
            closed: false,
        };

        conn.send(FrontendMessage::Startup {
            user: opts.user.clone(),
            database: opts.database.clone(),
            application_name: opts.application_name.clone(),
        })
        .await?;

        conn.handle_startup(opts.password.as_deref()).await?;

        info!(
            user = %opts.user,
            database = %opts.database,
            backend_pid = conn.process_id,
            "connected"
        );
        Ok(conn)
    }

    #[cfg(unix)]
    async fn open_unix(path: &str) -> PgResult<(PgStream, CancelEndpoint)> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok((PgStream::Unix(stream), CancelEndpoint::Unix(path.into())))
    }

    #[cfg(not(unix))]
    async fn open_unix(path: &str) -> PgResult<(PgStream, CancelEndpoint)> {
        Err(PgError::Connection(format!(
            "Unix socket {} is not supported on this platform",
            path
        )))
    }

    /// TCP connect, then SSL negotiation according to `ssl_mode`.
    ///
    /// Cancels go to the address this link resolved to, not to a fresh
    /// lookup of the host name.
    async fn open_tcp(opts: &ConnectOptions) -> PgResult<(PgStream, CancelEndpoint)> {
        let tcp = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
        let endpoint = CancelEndpoint::Tcp(tcp.peer_addr()?);

        // Disable Nagle's algorithm for lower latency
        tcp.set_nodelay(true)?;

        Ok((Self::negotiate_tls(opts, tcp).await?, endpoint))
    }

    async fn negotiate_tls(opts: &ConnectOptions, mut tcp: TcpStream) -> PgResult<PgStream> {
        if !opts.ssl_mode.attempts_tls() {
            return Ok(PgStream::Tcp(tcp));
        }

        tcp.write_all(&FrontendMessage::SslRequest.encode()).await?;
        let mut response = [0u8; 1];
        tcp.read_exact(&mut response).await?;

        match response[0] {
            b'S' => Self::tls_handshake(&opts.host, tcp).await,
            b'N' if opts.ssl_mode.requires_tls() => Err(PgError::Connection(format!(
                "Server does not support TLS (sslmode={})",
                opts.ssl_mode
            ))),
            b'N' => {
                debug!(sslmode = %opts.ssl_mode, "server declined TLS, continuing in plaintext");
                Ok(PgStream::Tcp(tcp))
            }
            other => Err(PgError::Protocol(format!(
                "Unexpected SSLRequest response byte: 0x{:02x}",
                other
            ))),
        }
    }

    async fn tls_handshake(host: &str, tcp: TcpStream) -> PgResult<PgStream> {
        use tokio_rustls::TlsConnector;
        use tokio_rustls::rustls::pki_types::ServerName;
        use tokio_rustls::rustls::{ClientConfig, RootCertStore};

        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| PgError::Connection("Invalid hostname for TLS".to_string()))?;

        let tls = TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .map_err(|e| PgError::Connection(format!("TLS handshake failed: {}", e)))?;

        Ok(PgStream::Tls(tls))
    }

    /// Handle startup sequence (auth + params) up to the first ReadyForQuery.
    async fn handle_startup(&mut self, password: Option<&str>) -> PgResult<()> {
        let mut scram: Option<ScramClient> = None;

        loop {
            match self.recv().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationMD5Password(_) => {
                    return Err(PgError::Auth(
                        "MD5 auth not supported. Use SCRAM-SHA-256.".to_string(),
                    ));
                }
                BackendMessage::AuthenticationSASL(mechanisms) => {
                    let password = password.ok_or_else(|| {
                        PgError::Auth("Password required for SCRAM authentication".to_string())
                    })?;
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(PgError::Auth(format!(
                            "Server doesn't support SCRAM-SHA-256. Available: {:?}",
                            mechanisms
                        )));
                    }

                    let client = ScramClient::new(password);
                    self.send(FrontendMessage::SASLInitialResponse {
                        mechanism: SCRAM_SHA_256.to_string(),
                        data: client.client_first_message(),
                    })
                    .await?;
                    scram = Some(client);
                }
                BackendMessage::AuthenticationSASLContinue(server_first) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        PgError::Auth("Received SASL Continue without SASL init".to_string())
                    })?;
                    let client_final = client
                        .process_server_first(&server_first)
                        .map_err(|e| PgError::Auth(format!("SCRAM error: {}", e)))?;
                    self.send(FrontendMessage::SASLResponse(client_final)).await?;
                }
                BackendMessage::AuthenticationSASLFinal(server_final) => {
                    let client = scram.as_ref().ok_or_else(|| {
                        PgError::Auth("Received SASL Final without SASL init".to_string())
                    })?;
                    client
                        .verify_server_final(&server_final)
                        .map_err(|e| PgError::Auth(format!("Server verification failed: {}", e)))?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.server_params.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = process_id;
                    self.secret_key = secret_key;
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse(err) => {
                    return Err(PgError::Connection(err.to_string()));
                }
                _ => {}
            }
        }
    }

    /// Transaction status reported by the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// A run-time parameter reported by the server (e.g. `server_version`).
    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.server_params.get(name).map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send Terminate and shut the stream down. Calling it again is a no-op.
    pub async fn close(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .write_all(&FrontendMessage::Terminate.encode())
            .await?;
        self.stream.flush().await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

/// Best-effort Terminate when a connection is dropped without `close()`.
impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.stream.try_write(&FrontendMessage::Terminate.encode());
        }
    }
}
