//! PostgreSQL Wire Protocol Messages
//!
//! The subset of the Frontend/Backend protocol (v3.0) an interactive session
//! needs: startup, simple query, cancellation and SCRAM authentication.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

/// Protocol version 3.0, sent in the StartupMessage.
pub const PROTOCOL_VERSION: i32 = 196608;

/// CancelRequest protocol code: 80877102
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// SSLRequest protocol code: 80877103
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// SQLSTATE reported when a statement was terminated by a cancel request
/// (or by statement_timeout).
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";

/// Frontend (client → server) message types
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// Startup message (sent first, no type byte)
    Startup {
        user: String,
        database: String,
        application_name: Option<String>,
    },
    /// SSL negotiation request (no type byte)
    SslRequest,
    /// Out-of-band cancel request, sent on its own connection (no type byte)
    CancelRequest { process_id: i32, secret_key: i32 },
    Query(String),
    /// Abort a COPY FROM STDIN the server started
    CopyFail(String),
    Terminate,
    /// SASL initial response (first message in SCRAM)
    SASLInitialResponse { mechanism: String, data: Vec<u8> },
    /// SASL response (subsequent messages in SCRAM)
    SASLResponse(Vec<u8>),
}

/// Backend (server → client) message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationMD5Password([u8; 4]),
    AuthenticationSASL(Vec<String>),
    AuthenticationSASLContinue(Vec<u8>),
    AuthenticationSASLFinal(Vec<u8>),
    ParameterStatus {
        name: String,
        value: String,
    },
    /// Backend key data (for cancel)
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    EmptyQueryResponse,
    CopyInResponse {
        format: u8,
        column_formats: Vec<u8>,
    },
    CopyOutResponse {
        format: u8,
        column_formats: Vec<u8>,
    },
    CopyData(Vec<u8>),
    CopyDone,
    /// Async notification from LISTEN/NOTIFY
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

/// Transaction status carried by ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,    // 'I'
    InBlock, // 'T'
    Failed,  // 'E'
}

/// Field description in RowDescription
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Error fields from ErrorResponse / NoticeResponse
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    /// SQLSTATE
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ErrorFields {
    /// True when the server terminated the statement with `query_canceled`.
    pub fn is_query_canceled(&self) -> bool {
        self.code == SQLSTATE_QUERY_CANCELED
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.severity.is_empty() {
            write!(f, "{}", self.message)?;
        } else {
            write!(f, "{}: {}", self.severity, self.message)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Prefix `body` with its Int32 length (which counts itself) and an optional type byte.
fn frame(tag: Option<u8>, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(body.len() + 5);
    if let Some(tag) = tag {
        buf.push(tag);
    }
    buf.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

impl FrontendMessage {
    /// Encode message to bytes for sending over the wire.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            FrontendMessage::Startup {
                user,
                database,
                application_name,
            } => {
                let mut body = Vec::new();
                body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
                let mut param = |key: &str, value: &str| {
                    body.extend_from_slice(key.as_bytes());
                    body.push(0);
                    body.extend_from_slice(value.as_bytes());
                    body.push(0);
                };
                param("user", user);
                param("database", database);
                if let Some(name) = application_name {
                    param("application_name", name);
                }
                body.push(0);
                frame(None, &body)
            }
            FrontendMessage::SslRequest => frame(None, &SSL_REQUEST_CODE.to_be_bytes()),
            FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            } => {
                let mut body = [0u8; 12];
                body[0..4].copy_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
                body[4..8].copy_from_slice(&process_id.to_be_bytes());
                body[8..12].copy_from_slice(&secret_key.to_be_bytes());
                frame(None, &body)
            }
            FrontendMessage::Query(sql) => {
                let mut body = Vec::with_capacity(sql.len() + 1);
                body.extend_from_slice(sql.as_bytes());
                body.push(0);
                frame(Some(b'Q'), &body)
            }
            FrontendMessage::CopyFail(reason) => {
                let mut body = Vec::with_capacity(reason.len() + 1);
                body.extend_from_slice(reason.as_bytes());
                body.push(0);
                frame(Some(b'f'), &body)
            }
            FrontendMessage::Terminate => vec![b'X', 0, 0, 0, 4],
            FrontendMessage::SASLInitialResponse { mechanism, data } => {
                let mut body = Vec::new();
                body.extend_from_slice(mechanism.as_bytes());
                body.push(0);
                body.extend_from_slice(&(data.len() as i32).to_be_bytes());
                body.extend_from_slice(data);
                frame(Some(b'p'), &body)
            }
            FrontendMessage::SASLResponse(data) => frame(Some(b'p'), data),
        }
    }
}

/// Bounds-checked reader over a message payload.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], String> {
        if self.pos + n > self.buf.len() {
            return Err(format!("{} truncated", what));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8, String> {
        Ok(self.take(1, what)?[0])
    }

    fn i16(&mut self, what: &str) -> Result<i16, String> {
        let b = self.take(2, what)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self, what: &str) -> Result<i32, String> {
        let b = self.take(4, what)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32, String> {
        Ok(self.i32(what)? as u32)
    }

    /// Null-terminated string.
    fn cstr(&mut self, what: &str) -> Result<String, String> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| format!("Missing null terminator in {}", what))?;
        let s = String::from_utf8_lossy(&rest[..end]).to_string();
        self.pos += end + 1;
        Ok(s)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }
}

impl BackendMessage {
    /// Decode one message from wire bytes.
    /// Returns the message and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), String> {
        if buf.len() < 5 {
            return Err("Buffer too short".to_string());
        }

        let msg_type = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(format!("Invalid message length: {}", len));
        }
        let len = len as usize;

        if buf.len() < len + 1 {
            return Err("Incomplete message".to_string());
        }

        let payload = &buf[5..len + 1];

        let message = match msg_type {
            b'R' => Self::decode_auth(payload)?,
            b'S' => Self::decode_parameter_status(payload)?,
            b'K' => Self::decode_backend_key(payload)?,
            b'Z' => Self::decode_ready_for_query(payload)?,
            b'T' => Self::decode_row_description(payload)?,
            b'D' => Self::decode_data_row(payload)?,
            b'C' => BackendMessage::CommandComplete(
                String::from_utf8_lossy(payload)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            b'E' => BackendMessage::ErrorResponse(Self::parse_error_fields(payload)?),
            b'N' => BackendMessage::NoticeResponse(Self::parse_error_fields(payload)?),
            b'I' => BackendMessage::EmptyQueryResponse,
            b'G' => {
                let (format, column_formats) = Self::decode_copy_response(payload)?;
                BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                }
            }
            b'H' => {
                let (format, column_formats) = Self::decode_copy_response(payload)?;
                BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                }
            }
            b'd' => BackendMessage::CopyData(payload.to_vec()),
            b'c' => BackendMessage::CopyDone,
            b'A' => Self::decode_notification_response(payload)?,
            _ => return Err(format!("Unknown message type: {}", msg_type as char)),
        };

        Ok((message, len + 1))
    }

    fn decode_auth(payload: &[u8]) -> Result<Self, String> {
        let mut cur = Cursor::new(payload);
        let auth_type = cur.i32("Authentication")?;
        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            5 => {
                let salt = cur.take(4, "MD5 salt")?;
                Ok(BackendMessage::AuthenticationMD5Password([
                    salt[0], salt[1], salt[2], salt[3],
                ]))
            }
            10 => {
                let mut mechanisms = Vec::new();
                while cur.peek().is_some_and(|b| b != 0) {
                    mechanisms.push(cur.cstr("SASL mechanism")?);
                }
                Ok(BackendMessage::AuthenticationSASL(mechanisms))
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue(cur.rest().to_vec())),
            12 => Ok(BackendMessage::AuthenticationSASLFinal(cur.rest().to_vec())),
            _ => Err(format!("Unknown auth type: {}", auth_type)),
        }
    }

    fn decode_parameter_status(payload: &[u8]) -> Result<Self, String> {
        let mut cur = Cursor::new(payload);
        Ok(BackendMessage::ParameterStatus {
            name: cur.cstr("ParameterStatus name")?,
            value: cur.cstr("ParameterStatus value")?,
        })
    }

    fn decode_backend_key(payload: &[u8]) -> Result<Self, String> {
        let mut cur = Cursor::new(payload);
        Ok(BackendMessage::BackendKeyData {
            process_id: cur.i32("BackendKeyData")?,
            secret_key: cur.i32("BackendKeyData")?,
        })
    }

    fn decode_ready_for_query(payload: &[u8]) -> Result<Self, String> {
        let status = match payload.first() {
            Some(b'I') => TransactionStatus::Idle,
            Some(b'T') => TransactionStatus::InBlock,
            Some(b'E') => TransactionStatus::Failed,
            _ => return Err("Unknown transaction status".to_string()),
        };
        Ok(BackendMessage::ReadyForQuery(status))
    }

    fn decode_row_description(payload: &[u8]) -> Result<Self, String> {
        let mut cur = Cursor::new(payload);
        let field_count = cur.i16("RowDescription")?.max(0) as usize;
        let mut fields = Vec::with_capacity(field_count);

        for _ in 0..field_count {
            fields.push(FieldDescription {
                name: cur.cstr("field name")?,
                table_oid: cur.u32("RowDescription field")?,
                column_attr: cur.i16("RowDescription field")?,
                type_oid: cur.u32("RowDescription field")?,
                type_size: cur.i16("RowDescription field")?,
                type_modifier: cur.i32("RowDescription field")?,
                format: cur.i16("RowDescription field")?,
            });
        }

        Ok(BackendMessage::RowDescription(fields))
    }

    fn decode_data_row(payload: &[u8]) -> Result<Self, String> {
        let mut cur = Cursor::new(payload);
        let column_count = cur.i16("DataRow")?.max(0) as usize;
        let mut columns = Vec::with_capacity(column_count);

        for _ in 0..column_count {
            let len = cur.i32("DataRow")?;
            if len < 0 {
                columns.push(None);
            } else {
                columns.push(Some(cur.take(len as usize, "DataRow column data")?.to_vec()));
            }
        }

        Ok(BackendMessage::DataRow(columns))
    }

    fn parse_error_fields(payload: &[u8]) -> Result<ErrorFields, String> {
        let mut cur = Cursor::new(payload);
        let mut fields = ErrorFields::default();
        while let Some(field_type) = cur.peek() {
            if field_type == 0 {
                break;
            }
            cur.u8("error field")?;
            let value = cur.cstr("error field")?;
            match field_type {
                b'S' => fields.severity = value,
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                _ => {}
            }
        }
        Ok(fields)
    }

    fn decode_copy_response(payload: &[u8]) -> Result<(u8, Vec<u8>), String> {
        let mut cur = Cursor::new(payload);
        let format = cur.u8("CopyResponse")?;
        let num_columns = cur.i16("CopyResponse")?.max(0) as usize;
        let mut column_formats = Vec::with_capacity(num_columns);
        for _ in 0..num_columns {
            column_formats.push(cur.i16("CopyResponse column format")? as u8);
        }
        Ok((format, column_formats))
    }

    fn decode_notification_response(payload: &[u8]) -> Result<Self, String> {
        let mut cur = Cursor::new(payload);
        Ok(BackendMessage::NotificationResponse {
            process_id: cur.i32("NotificationResponse")?,
            channel: cur.cstr("NotificationResponse channel")?,
            payload: cur.cstr("NotificationResponse payload")?,
        })
    }
}
