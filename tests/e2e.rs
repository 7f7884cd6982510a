//! End-to-end scenarios over real TCP: startup, authentication, simple and
//! extended query flows, meta-DDL acknowledgement, teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use pg_warren::dbmgr::{factories, DatabaseManager, ManagerConfig};
use pg_warren::engine::memory::MemoryEngine;
use pg_warren::engine::{Engine, EngineHooks};
use pg_warren::session::{self, SessionConfig};

const PASSWORD: &str = "letmein";

struct Gateway {
    addr: SocketAddr,
    manager: Arc<DatabaseManager>,
    _dir: tempfile::TempDir,
    _shutdown: broadcast::Sender<()>,
}

async fn spawn_gateway() -> Gateway {
    let dir = tempfile::TempDir::new().unwrap();
    let engine: Arc<dyn Engine> =
        Arc::new(MemoryEngine::new(EngineHooks::with_version("1.1.0")));
    let manager = DatabaseManager::new(
        ManagerConfig {
            base_dir: dir.path().to_path_buf(),
            sweep_each: Duration::from_secs(3600),
            checkpoint_each: Duration::ZERO,
            log_open_close: false,
            ..ManagerConfig::default()
        },
        engine.clone(),
        factories::path_resolver(dir.path()),
        factories::database_creator(dir.path(), engine),
        Some(Arc::new(|_user: &str, password: &str, _db: &str| {
            Ok(password == PASSWORD)
        })),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, _) = broadcast::channel(1);
    {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let manager = manager.clone();
                let config = SessionConfig {
                    server_version: Some("14.0 (pg_warren 1.1)".into()),
                    log_messages: false,
                };
                let rx = shutdown.subscribe();
                tokio::spawn(async move {
                    let _ = session::entrypoint(socket, manager, config, None, rx).await;
                });
            }
        });
    }

    Gateway {
        addr,
        manager,
        _dir: dir,
        _shutdown: shutdown,
    }
}

fn cstr(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

struct RawClient {
    stream: TcpStream,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> RawClient {
        RawClient {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    async fn send_startup(&mut self, pairs: &[(&str, &str)]) {
        let mut body = Vec::new();
        body.extend_from_slice(&196608i32.to_be_bytes());
        for (key, value) in pairs {
            body.extend_from_slice(&cstr(key));
            body.extend_from_slice(&cstr(value));
        }
        body.push(0);
        let mut msg = Vec::new();
        msg.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
        msg.extend_from_slice(&body);
        self.stream.write_all(&msg).await.unwrap();
    }

    async fn send_ssl_request(&mut self) {
        let mut msg = Vec::new();
        msg.extend_from_slice(&8i32.to_be_bytes());
        msg.extend_from_slice(&80877103i32.to_be_bytes());
        self.stream.write_all(&msg).await.unwrap();
    }

    async fn send(&mut self, tag: u8, body: &[u8]) {
        let mut msg = vec![tag];
        msg.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
        msg.extend_from_slice(body);
        self.stream.write_all(&msg).await.unwrap();
    }

    async fn send_password(&mut self, password: &str) {
        self.send(b'p', &cstr(password)).await;
    }

    async fn send_query(&mut self, sql: &str) {
        self.send(b'Q', &cstr(sql)).await;
    }

    /// Read one backend frame as (tag, body-without-length).
    async fn read_msg(&mut self) -> (u8, Vec<u8>) {
        timeout(Duration::from_secs(5), async {
            let tag = self.stream.read_u8().await.unwrap();
            let len = self.stream.read_i32().await.unwrap();
            let mut body = vec![0u8; (len - 4) as usize];
            self.stream.read_exact(&mut body).await.unwrap();
            (tag, body)
        })
        .await
        .expect("timed out waiting for a backend message")
    }

    async fn expect_eof(&mut self) {
        let read = timeout(Duration::from_secs(5), self.stream.read_u8())
            .await
            .expect("timed out waiting for EOF");
        assert!(read.is_err(), "expected the server to close the stream");
    }

    /// Startup + cleartext password, consuming the greeting through
    /// ReadyForQuery. Returns the ParameterStatus pairs seen on the way.
    async fn authenticate(&mut self, user: &str, database: &str) -> Vec<(String, String)> {
        self.send_startup(&[("user", user), ("database", database)])
            .await;
        let (tag, body) = self.read_msg().await;
        assert_eq!(tag, b'R');
        assert_eq!(&body[..], &3i32.to_be_bytes());

        self.send_password(PASSWORD).await;
        let (tag, body) = self.read_msg().await;
        assert_eq!(tag, b'R');
        assert_eq!(&body[..], &0i32.to_be_bytes());

        let mut params = Vec::new();
        loop {
            let (tag, body) = self.read_msg().await;
            match tag {
                b'S' => {
                    let mut parts = body.split(|&b| b == 0);
                    let key = String::from_utf8(parts.next().unwrap().to_vec()).unwrap();
                    let value = String::from_utf8(parts.next().unwrap().to_vec()).unwrap();
                    params.push((key, value));
                }
                b'Z' => {
                    assert_eq!(body, vec![b'I']);
                    return params;
                }
                other => panic!("unexpected tag {:?} in greeting", other as char),
            }
        }
    }
}

fn expected_int8_row_description(name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1i16.to_be_bytes());
    body.extend_from_slice(&cstr(name));
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&0i16.to_be_bytes());
    body.extend_from_slice(&20u32.to_be_bytes());
    body.extend_from_slice(&8i16.to_be_bytes());
    body.extend_from_slice(&(-1i32).to_be_bytes());
    body.extend_from_slice(&0i16.to_be_bytes());
    body
}

#[tokio::test]
async fn startup_then_simple_select() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();

    let mut client = RawClient::connect(gateway.addr).await;
    let params = client.authenticate("u", "s1").await;
    assert!(params
        .iter()
        .any(|(k, v)| k == "client_encoding" && v == "UTF8"));
    assert!(params
        .iter()
        .any(|(k, v)| k == "server_encoding" && v == "UTF8"));
    assert!(params.iter().any(|(k, _)| k == "server_version"));

    client.send_query("SELECT 1").await;
    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'T');
    assert_eq!(body, expected_int8_row_description("1"));

    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'D');
    let mut expected = Vec::new();
    expected.extend_from_slice(&1i16.to_be_bytes());
    expected.extend_from_slice(&1i32.to_be_bytes());
    expected.extend_from_slice(b"1");
    assert_eq!(body, expected);

    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'C');
    assert_eq!(body, cstr("SELECT 1"));

    let (tag, body) = client.read_msg().await;
    assert_eq!((tag, body), (b'Z', vec![b'I']));

    client.send(b'X', &[]).await;
    client.expect_eof().await;
}

#[tokio::test]
async fn tokio_postgres_speaks_to_the_gateway() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();

    let mut config = tokio_postgres::Config::new();
    config
        .host("127.0.0.1")
        .port(gateway.addr.port())
        .user("u")
        .password(PASSWORD)
        .dbname("s1");
    let (client, connection) = config
        .connect(tokio_postgres::NoTls)
        .await
        .expect("connect through the gateway");
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let messages = client.simple_query("SELECT 1").await.unwrap();
    let mut saw_row = false;
    for message in &messages {
        if let tokio_postgres::SimpleQueryMessage::Row(row) = message {
            assert_eq!(row.get(0), Some("1"));
            saw_row = true;
        }
    }
    assert!(saw_row, "expected one data row");
}

#[tokio::test]
async fn unknown_database_fails_startup() {
    let gateway = spawn_gateway().await;
    let mut client = RawClient::connect(gateway.addr).await;
    client
        .send_startup(&[("user", "u"), ("database", "missing")])
        .await;

    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'E');
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("FATAL"));
    assert!(text.contains("missing"));
    client.expect_eof().await;
}

#[tokio::test]
async fn extended_query_with_parameters() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let mut client = RawClient::connect(gateway.addr).await;
    client.authenticate("u", "s1").await;

    // Parse named statement with two declared text parameters.
    let mut body = Vec::new();
    body.extend_from_slice(&cstr("s"));
    body.extend_from_slice(&cstr("SELECT ?, ?"));
    body.extend_from_slice(&2i16.to_be_bytes());
    body.extend_from_slice(&25u32.to_be_bytes());
    body.extend_from_slice(&25u32.to_be_bytes());
    client.send(b'P', &body).await;

    // Bind portal p with text parameters.
    let mut body = Vec::new();
    body.extend_from_slice(&cstr("p"));
    body.extend_from_slice(&cstr("s"));
    body.extend_from_slice(&0i16.to_be_bytes());
    body.extend_from_slice(&2i16.to_be_bytes());
    body.extend_from_slice(&5i32.to_be_bytes());
    body.extend_from_slice(b"hello");
    body.extend_from_slice(&2i32.to_be_bytes());
    body.extend_from_slice(b"42");
    body.extend_from_slice(&0i16.to_be_bytes());
    client.send(b'B', &body).await;

    // Describe statement and portal.
    let mut body = vec![b'S'];
    body.extend_from_slice(&cstr("s"));
    client.send(b'D', &body).await;
    let mut body = vec![b'P'];
    body.extend_from_slice(&cstr("p"));
    client.send(b'D', &body).await;

    // Execute flushes the whole pipelined batch.
    let mut body = cstr("p");
    body.extend_from_slice(&0i32.to_be_bytes());
    client.send(b'E', &body).await;

    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'1');
    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'2');

    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b't');
    let mut expected = Vec::new();
    expected.extend_from_slice(&2i16.to_be_bytes());
    expected.extend_from_slice(&25u32.to_be_bytes());
    expected.extend_from_slice(&25u32.to_be_bytes());
    assert_eq!(body, expected);

    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'n');

    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'D');
    let mut expected = Vec::new();
    expected.extend_from_slice(&2i16.to_be_bytes());
    expected.extend_from_slice(&5i32.to_be_bytes());
    expected.extend_from_slice(b"hello");
    expected.extend_from_slice(&2i32.to_be_bytes());
    expected.extend_from_slice(b"42");
    assert_eq!(body, expected);

    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'C');
    assert_eq!(body, cstr("SELECT 1"));
    let (tag, body) = client.read_msg().await;
    assert_eq!((tag, body), (b'Z', vec![b'I']));

    // Sync answers with its own boundary.
    client.send(b'S', &[]).await;
    let (tag, body) = client.read_msg().await;
    assert_eq!((tag, body), (b'Z', vec![b'I']));

    // Close the statement, Sync to collect the CloseComplete.
    let mut body = vec![b'S'];
    body.extend_from_slice(&cstr("s"));
    client.send(b'C', &body).await;
    client.send(b'S', &[]).await;
    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'3');
    let (tag, body) = client.read_msg().await;
    assert_eq!((tag, body), (b'Z', vec![b'I']));

    // The statement is gone now.
    let mut body = vec![b'S'];
    body.extend_from_slice(&cstr("s"));
    client.send(b'D', &body).await;
    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'E');
    assert!(String::from_utf8_lossy(&body).contains("does not exist"));
}

#[tokio::test]
async fn bind_to_missing_statement_keeps_the_session() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let mut client = RawClient::connect(gateway.addr).await;
    client.authenticate("u", "s1").await;

    let mut body = Vec::new();
    body.extend_from_slice(&cstr(""));
    body.extend_from_slice(&cstr("ghost"));
    body.extend_from_slice(&0i16.to_be_bytes());
    body.extend_from_slice(&0i16.to_be_bytes());
    body.extend_from_slice(&0i16.to_be_bytes());
    client.send(b'B', &body).await;

    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'E');
    assert!(String::from_utf8_lossy(&body).contains("ghost"));

    // The session survives: Sync then a simple query still work.
    client.send(b'S', &[]).await;
    let (tag, body) = client.read_msg().await;
    assert_eq!((tag, body), (b'Z', vec![b'I']));

    client.send_query("SELECT 1").await;
    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'T');
}

#[tokio::test]
async fn meta_ddl_is_acknowledged_inert() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let mut client = RawClient::connect(gateway.addr).await;
    client.authenticate("u", "s1").await;

    client.send_query("[[ CREATE DATABASE 'X' ]]").await;
    let (tag, body) = client.read_msg().await;
    assert_eq!((tag, body), (b'Z', vec![b'E']));

    // The session continues normally afterwards.
    client.send_query("SELECT 1").await;
    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'T');
}

#[tokio::test]
async fn engine_errors_are_recoverable() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let mut client = RawClient::connect(gateway.addr).await;
    client.authenticate("u", "s1").await;

    client.send_query("select * from nowhere").await;
    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'E');
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("ERROR"));
    assert!(text.contains("no such table"));
    let (tag, body) = client.read_msg().await;
    assert_eq!((tag, body), (b'Z', vec![b'I']));

    client.send_query("SELECT 2").await;
    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'T');
}

#[tokio::test]
async fn auth_denial_is_fatal_and_leaves_the_pool_alone() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let open_before = gateway.manager.open_count();

    let mut client = RawClient::connect(gateway.addr).await;
    client
        .send_startup(&[("user", "u"), ("database", "s1")])
        .await;
    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'R');

    client.send_password("wrong").await;
    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'E');
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("FATAL"));
    assert!(text.contains("not authorized"));
    client.expect_eof().await;

    assert_eq!(gateway.manager.open_count(), open_before);
}

#[tokio::test]
async fn ssl_probe_is_answered_no_without_tls() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();

    let mut client = RawClient::connect(gateway.addr).await;
    client.send_ssl_request().await;
    let byte = timeout(Duration::from_secs(5), client.stream.read_u8())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(byte, b'N');

    // Plain startup proceeds on the same connection.
    client.authenticate("u", "s1").await;
    client.send_query("SELECT 1").await;
    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'T');
}

#[tokio::test]
async fn ssl_probe_while_awaiting_password_is_tolerated() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();

    let mut client = RawClient::connect(gateway.addr).await;
    client
        .send_startup(&[("user", "u"), ("database", "s1")])
        .await;
    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'R');

    // Probe between the challenge and the password: refused without TLS,
    // and the password state is re-entered.
    client.send_ssl_request().await;
    let byte = timeout(Duration::from_secs(5), client.stream.read_u8())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(byte, b'N');

    client.send_password(PASSWORD).await;
    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'R');
    assert_eq!(&body[..], &0i32.to_be_bytes());
}

#[tokio::test]
async fn mid_session_ssl_probe_is_answered_and_the_session_continues() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let mut client = RawClient::connect(gateway.addr).await;
    client.authenticate("u", "s1").await;

    client.send_ssl_request().await;
    let byte = timeout(Duration::from_secs(5), client.stream.read_u8())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(byte, b'N');

    client.send_query("SELECT 1").await;
    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'T');
}

#[tokio::test]
async fn mid_session_cancel_request_terminates_with_an_error() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let mut client = RawClient::connect(gateway.addr).await;
    client.authenticate("u", "s1").await;

    let mut msg = Vec::new();
    msg.extend_from_slice(&16i32.to_be_bytes());
    msg.extend_from_slice(&80877102i32.to_be_bytes());
    msg.extend_from_slice(&1234i32.to_be_bytes());
    msg.extend_from_slice(&5678i32.to_be_bytes());
    client.stream.write_all(&msg).await.unwrap();

    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'E');
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("FATAL"));
    assert!(text.contains("cancel"));
    client.expect_eof().await;
}

#[tokio::test]
async fn stray_startup_mid_session_terminates_with_an_error() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let mut client = RawClient::connect(gateway.addr).await;
    client.authenticate("u", "s1").await;

    client
        .send_startup(&[("user", "u"), ("database", "s1")])
        .await;
    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'E');
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("FATAL"));
    assert!(text.contains("out of sequence"));
    client.expect_eof().await;
}

#[tokio::test]
async fn cancel_requests_are_rejected() {
    let gateway = spawn_gateway().await;
    let mut client = RawClient::connect(gateway.addr).await;

    let mut msg = Vec::new();
    msg.extend_from_slice(&16i32.to_be_bytes());
    msg.extend_from_slice(&80877102i32.to_be_bytes());
    msg.extend_from_slice(&1234i32.to_be_bytes());
    msg.extend_from_slice(&5678i32.to_be_bytes());
    client.stream.write_all(&msg).await.unwrap();

    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'E');
    assert!(String::from_utf8_lossy(&body).contains("cancel"));
    client.expect_eof().await;
}

#[tokio::test]
async fn flush_answers_with_a_boundary() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let mut client = RawClient::connect(gateway.addr).await;
    client.authenticate("u", "s1").await;

    client.send(b'H', &[]).await;
    let (tag, body) = client.read_msg().await;
    assert_eq!((tag, body), (b'Z', vec![b'I']));
}

#[tokio::test]
async fn unsupported_message_classes_terminate() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let mut client = RawClient::connect(gateway.addr).await;
    client.authenticate("u", "s1").await;

    client.send(b'd', b"copy payload").await;
    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'E');
    assert!(String::from_utf8_lossy(&body).contains("COPY"));
    client.expect_eof().await;
}

#[tokio::test]
async fn version_function_reports_through_the_wire() {
    let gateway = spawn_gateway().await;
    gateway.manager.get_or_create("s1").unwrap();
    let mut client = RawClient::connect(gateway.addr).await;
    client.authenticate("u", "s1").await;

    client.send_query("SELECT version()").await;
    let (tag, _) = client.read_msg().await;
    assert_eq!(tag, b'T');
    let (tag, body) = client.read_msg().await;
    assert_eq!(tag, b'D');
    assert!(String::from_utf8_lossy(&body).contains("1.1.0"));
}
