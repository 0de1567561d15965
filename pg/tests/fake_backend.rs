//! Driver tests against a scripted in-process PostgreSQL backend.
//!
//! Each test binds a local listener, plays the server side of the protocol
//! byte by byte, and checks what the driver sends and how it recovers.

use pgshell_pg::{
    CancelEndpoint, ConnectOptions, PgConnection, PgError, SslMode, TransactionStatus,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PID: i32 = 4711;
const SECRET: i32 = -123_456;

fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn ready(status: u8) -> Vec<u8> {
    msg(b'Z', &[status])
}

fn error_response(code: &str, message: &str) -> Vec<u8> {
    let body = format!("SERROR\0C{}\0M{}\0\0", code, message);
    msg(b'E', body.as_bytes())
}

fn single_int_result(name: &str, value: &str) -> Vec<u8> {
    let mut desc = Vec::new();
    desc.extend_from_slice(&1i16.to_be_bytes());
    desc.extend_from_slice(name.as_bytes());
    desc.push(0);
    desc.extend_from_slice(&0u32.to_be_bytes());
    desc.extend_from_slice(&0i16.to_be_bytes());
    desc.extend_from_slice(&23u32.to_be_bytes());
    desc.extend_from_slice(&4i16.to_be_bytes());
    desc.extend_from_slice(&(-1i32).to_be_bytes());
    desc.extend_from_slice(&0i16.to_be_bytes());

    let mut row = Vec::new();
    row.extend_from_slice(&1i16.to_be_bytes());
    row.extend_from_slice(&(value.len() as i32).to_be_bytes());
    row.extend_from_slice(value.as_bytes());

    let mut out = msg(b'T', &desc);
    out.extend(msg(b'D', &row));
    out.extend(msg(b'C', b"SELECT 1\0"));
    out
}

/// Read an untyped startup-phase packet (length-prefixed, no tag).
async fn read_untyped(sock: &mut TcpStream) -> Vec<u8> {
    let len = sock.read_i32().await.unwrap() as usize;
    let mut body = vec![0u8; len - 4];
    sock.read_exact(&mut body).await.unwrap();
    body
}

/// Read one typed frontend message.
async fn read_typed(sock: &mut TcpStream) -> (u8, Vec<u8>) {
    let tag = sock.read_u8().await.unwrap();
    let len = sock.read_i32().await.unwrap() as usize;
    let mut body = vec![0u8; len - 4];
    sock.read_exact(&mut body).await.unwrap();
    (tag, body)
}

/// Consume the StartupMessage and accept it in trust mode.
async fn accept_session(sock: &mut TcpStream) {
    let startup = read_untyped(sock).await;
    assert_eq!(&startup[0..4], &196608i32.to_be_bytes());
    assert!(startup.windows(5).any(|w| w == b"user\0"));

    let mut reply = msg(b'R', &0i32.to_be_bytes());
    let mut key = Vec::new();
    key.extend_from_slice(&PID.to_be_bytes());
    key.extend_from_slice(&SECRET.to_be_bytes());
    reply.extend(msg(b'K', &key));
    reply.extend(msg(b'S', b"server_version\016.2\0"));
    reply.extend(ready(b'I'));
    sock.write_all(&reply).await.unwrap();
}

fn options(port: u16, ssl_mode: SslMode) -> ConnectOptions {
    let mut opts = ConnectOptions::new("127.0.0.1", port, "tester", "testdb");
    opts.ssl_mode = ssl_mode;
    opts.connect_timeout = Some(Duration::from_secs(5));
    opts
}

#[tokio::test]
async fn cancel_terminates_statement_and_session_survives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut primary, _) = listener.accept().await.unwrap();
        accept_session(&mut primary).await;

        let (tag, body) = read_typed(&mut primary).await;
        assert_eq!(tag, b'Q');
        assert_eq!(body, b"SELECT pg_sleep(10)\0");

        // The cancel arrives on a separate connection while the query "runs".
        let (mut side, _) = listener.accept().await.unwrap();
        let mut packet = [0u8; 16];
        side.read_exact(&mut packet).await.unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&16i32.to_be_bytes());
        expected.extend_from_slice(&80877102i32.to_be_bytes());
        expected.extend_from_slice(&PID.to_be_bytes());
        expected.extend_from_slice(&SECRET.to_be_bytes());
        assert_eq!(packet.to_vec(), expected);
        // Fire-and-forget: the client closes without waiting for anything.
        assert_eq!(side.read(&mut [0u8; 1]).await.unwrap(), 0);

        let mut reply = error_response("57014", "canceling statement due to user request");
        reply.extend(ready(b'I'));
        primary.write_all(&reply).await.unwrap();

        let (tag, body) = read_typed(&mut primary).await;
        assert_eq!(tag, b'Q');
        assert_eq!(body, b"SELECT 1\0");
        let mut reply = single_int_result("?column?", "1");
        reply.extend(ready(b'I'));
        primary.write_all(&reply).await.unwrap();

        let (tag, _) = read_typed(&mut primary).await;
        assert_eq!(tag, b'X');
    });

    let mut conn = PgConnection::connect(&options(port, SslMode::Disable))
        .await
        .unwrap();
    assert_eq!(conn.cancel_token().process_id(), PID);
    assert_eq!(conn.cancel_token().secret_key(), SECRET);
    assert_eq!(conn.server_parameter("server_version"), Some("16.2"));

    let token = conn.cancel_token();
    let endpoint = conn.cancel_endpoint();
    assert_eq!(
        endpoint,
        CancelEndpoint::Tcp(format!("127.0.0.1:{}", port).parse().unwrap())
    );
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        endpoint.send_cancel(token).await
    });

    let err = conn.simple_query("SELECT pg_sleep(10)").await.unwrap_err();
    match &err {
        PgError::QueryCanceled(fields) => assert_eq!(fields.code, "57014"),
        other => panic!("expected QueryCanceled, got {:?}", other),
    }
    assert!(!err.is_fatal());
    canceller.await.unwrap().unwrap();

    let result = conn.simple_query("SELECT 1").await.unwrap();
    assert_eq!(result.columns, vec!["?column?".to_string()]);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get_i64(0), Some(1));
    assert_eq!(result.command_tag.as_deref(), Some("SELECT 1"));

    conn.close().await.unwrap();
    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn server_error_is_drained_to_ready_for_query() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        accept_session(&mut sock).await;

        read_typed(&mut sock).await;
        let mut reply = error_response("42P01", "relation \"nope\" does not exist");
        reply.extend(msg(b'N', b"SNOTICE\0C00000\0Mtrailing notice\0\0"));
        reply.extend(ready(b'E'));
        sock.write_all(&reply).await.unwrap();

        read_typed(&mut sock).await;
        let mut reply = msg(b'C', b"ROLLBACK\0");
        reply.extend(ready(b'I'));
        sock.write_all(&reply).await.unwrap();
    });

    let mut conn = PgConnection::connect(&options(port, SslMode::Disable))
        .await
        .unwrap();

    let err = conn.simple_query("SELECT * FROM nope").await.unwrap_err();
    match err {
        PgError::Server(fields) => assert_eq!(fields.code, "42P01"),
        other => panic!("expected Server error, got {:?}", other),
    }
    assert_eq!(conn.transaction_status(), TransactionStatus::Failed);

    let result = conn.simple_query("ROLLBACK").await.unwrap();
    assert_eq!(result.command_tag.as_deref(), Some("ROLLBACK"));
    assert!(result.rows.is_empty());
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

    server.await.unwrap();
}

#[tokio::test]
async fn dropped_link_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        accept_session(&mut sock).await;
        read_typed(&mut sock).await;
        drop(sock);
    });

    let mut conn = PgConnection::connect(&options(port, SslMode::Disable))
        .await
        .unwrap();
    let err = conn.simple_query("SELECT 1").await.unwrap_err();
    assert!(err.is_fatal(), "unexpected error: {:?}", err);
    server.await.unwrap();
}

#[tokio::test]
async fn oversized_message_length_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        accept_session(&mut sock).await;
        read_typed(&mut sock).await;
        // DataRow header claiming ~2 GiB, no body follows.
        let mut header = vec![b'D'];
        header.extend_from_slice(&0x7FFF_FFF0u32.to_be_bytes());
        sock.write_all(&header).await.unwrap();
        let mut rest = Vec::new();
        let _ = sock.read_to_end(&mut rest).await;
    });

    let mut conn = PgConnection::connect(&options(port, SslMode::Disable))
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), conn.simple_query("SELECT 1"))
        .await
        .expect("driver waited for a body it should have refused")
        .unwrap_err();
    assert!(matches!(err, PgError::Protocol(_)), "unexpected error: {:?}", err);
    assert!(err.is_fatal());
    drop(conn);
    server.await.unwrap();
}

#[tokio::test]
async fn prefer_falls_back_to_plaintext() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let request = read_untyped(&mut sock).await;
        assert_eq!(request, 80877103i32.to_be_bytes().to_vec());
        sock.write_all(b"N").await.unwrap();
        accept_session(&mut sock).await;
    });

    let conn = PgConnection::connect(&options(port, SslMode::Prefer)).await;
    assert!(conn.is_ok());
    server.await.unwrap();
}

#[tokio::test]
async fn require_rejects_plaintext_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        read_untyped(&mut sock).await;
        sock.write_all(b"N").await.unwrap();
    });

    let err = PgConnection::connect(&options(port, SslMode::Require))
        .await
        .err()
        .expect("connect must fail");
    assert!(matches!(err, PgError::Connection(_)));
    server.await.unwrap();
}

#[tokio::test]
async fn nul_byte_is_rejected_before_sending() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        accept_session(&mut sock).await;
        let (tag, _) = read_typed(&mut sock).await;
        assert_eq!(tag, b'X');
    });

    let mut conn = PgConnection::connect(&options(port, SslMode::Disable))
        .await
        .unwrap();
    let err = conn.simple_query("SELECT '\0'").await.unwrap_err();
    assert!(matches!(err, PgError::InvalidStatement(_)));
    conn.close().await.unwrap();
    server.await.unwrap();
}
