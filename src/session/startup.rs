//! Session startup: TLS negotiation, database resolution, authentication.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use super::stream::SessionStream;
use super::{Session, SessionConfig};
use crate::dbmgr::DatabaseManager;
use crate::errors::{Error, SessionIdentifier};
use crate::messages::{
    authentication_cleartext_password, authentication_ok, error_response_terminal,
    read_password_message, read_startup, ready_for_query, server_parameter_message, write_all,
    write_all_flush, PasswordRead, StartupRequest, TransactionStatus,
};

/// Drive one accepted connection from startup to teardown.
///
/// TLS negotiated here answers `SSLRequest` with `'S'` and swaps the framer
/// onto the encrypted stream before the startup message; the same upgrade
/// remains available to the password and ready states through the acceptor
/// threaded into the session.
pub async fn entrypoint(
    mut stream: TcpStream,
    manager: Arc<DatabaseManager>,
    config: SessionConfig,
    tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Error> {
    let addr = stream.peer_addr().map_err(Error::Transport)?;

    loop {
        match read_startup(&mut stream).await? {
            StartupRequest::SslRequest => {
                if let Some(acceptor) = &tls_acceptor {
                    let mut yes = BytesMut::new();
                    yes.put_u8(b'S');
                    write_all(&mut stream, yes).await?;
                    let tls_stream = acceptor.accept(stream).await.map_err(Error::Tls)?;
                    debug!("client {addr:?}: TLS established");
                    return startup_over(
                        SessionStream::tls(tls_stream),
                        addr,
                        manager,
                        config,
                        tls_acceptor,
                        shutdown,
                    )
                    .await;
                }
                // TLS is not configured; the client may retry in plain text.
                let mut no = BytesMut::new();
                no.put_u8(b'N');
                write_all(&mut stream, no).await?;
            }
            StartupRequest::GssEncRequest => {
                let mut no = BytesMut::new();
                no.put_u8(b'N');
                write_all(&mut stream, no).await?;
            }
            StartupRequest::CancelRequest { process_id, .. } => {
                debug!("client {addr:?}: rejected cancel request for pid {process_id}");
                error_response_terminal(&mut stream, "cancel requests are not supported", "0A000")
                    .await?;
                return Err(Error::Protocol("cancel requests are not supported".into()));
            }
            StartupRequest::Startup(params) => {
                return run_session(
                    SessionStream::plain(stream),
                    addr,
                    params,
                    manager,
                    config,
                    tls_acceptor,
                    shutdown,
                )
                .await;
            }
        }
    }
}

/// Read the startup message that follows a completed TLS handshake.
async fn startup_over(
    mut stream: SessionStream,
    addr: SocketAddr,
    manager: Arc<DatabaseManager>,
    config: SessionConfig,
    tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Error> {
    match read_startup(&mut stream).await? {
        StartupRequest::Startup(params) => {
            run_session(stream, addr, params, manager, config, tls_acceptor, shutdown).await
        }
        other => Err(Error::Protocol(format!(
            "expected startup after TLS handshake, got {other:?}"
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    mut stream: SessionStream,
    addr: SocketAddr,
    params: std::collections::HashMap<String, String>,
    manager: Arc<DatabaseManager>,
    config: SessionConfig,
    tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Error> {
    // Both keys are mandatory; their absence is a protocol error.
    let Some(user) = params.get("user").cloned() else {
        error_response_terminal(&mut stream, "missing user parameter", "08P01").await?;
        return Err(Error::Protocol("startup without user parameter".into()));
    };
    let Some(database) = params.get("database").cloned() else {
        error_response_terminal(&mut stream, "missing database parameter", "08P01").await?;
        return Err(Error::Protocol("startup without database parameter".into()));
    };
    let id = SessionIdentifier::new(&addr.to_string(), &user, &database);

    let db = match manager.get(&database) {
        Ok(db) => db,
        Err(err) => {
            error_response_terminal(
                &mut stream,
                &format!("database {database:?} is not available: {err}"),
                "3D000",
            )
            .await?;
            return Err(err);
        }
    };
    db.set_current_user(Some(user.clone()));

    write_all_flush(&mut stream, &authentication_cleartext_password()).await?;

    let password = loop {
        match read_password_message(&mut stream).await? {
            PasswordRead::Password(password) => break password,
            PasswordRead::SslProbe => match &tls_acceptor {
                Some(acceptor) if stream.is_plain() => {
                    // Same upgrade dance as at startup, then back to waiting
                    // for the password.
                    write_all_flush(&mut stream, b"S").await?;
                    stream = stream.upgrade(acceptor).await?;
                    debug!("session {id}: TLS established before authentication");
                }
                _ => {
                    write_all_flush(&mut stream, b"N").await?;
                }
            },
        }
    };

    let allowed = db.authorize(&user, &password, &database).unwrap_or_else(|err| {
        warn!("session {id}: access check failed: {err}");
        false
    });
    if !allowed {
        warn!("session {id}: not authorized");
        error_response_terminal(&mut stream, "not authorized", "28000").await?;
        return Err(Error::AuthDenied);
    }

    let mut greeting = authentication_ok();
    greeting.put(server_parameter_message("client_encoding", "UTF8"));
    greeting.put(server_parameter_message("server_encoding", "UTF8"));
    if let Some(version) = &config.server_version {
        greeting.put(server_parameter_message("server_version", version));
    }
    greeting.put(ready_for_query(TransactionStatus::Idle));
    write_all_flush(&mut stream, &greeting).await?;

    info!("session {id}: authenticated");
    let mut session = Session::new(stream, id, manager, config, db, tls_acceptor, shutdown);
    session.handle().await
}
