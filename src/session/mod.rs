//! Per-connection protocol driver.
//!
//! A session owns one accepted stream end-to-end: startup (with the optional
//! TLS upgrade), cleartext password authentication, then a strictly
//! sequential command loop. One request is fully answered before the next
//! frame is read, and every response batch is flushed in a single write.

mod extended;
pub mod metaddl;
mod query;
mod startup;
mod stream;

pub use startup::entrypoint;
pub use stream::SessionStream;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use log::debug;
use tokio::sync::broadcast;

use crate::dbmgr::{DatabaseHandle, DatabaseManager};
use crate::engine::Statement;
use crate::errors::{Error, SessionIdentifier};
use crate::messages::{
    error_message, read_message, ready_for_query, write_all_flush, FrontendMessage,
    TransactionStatus,
};

/// Knobs the session driver takes from the app layer.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Advertised as the `server_version` parameter when set.
    pub server_version: Option<String>,
    /// Log every client message. Noisy; off in production.
    pub log_messages: bool,
}

/// A named prepared statement created by Parse. The unnamed statement lives
/// under the empty string, like the unnamed portal.
pub(crate) struct PreparedStatement {
    pub(crate) sql: String,
    pub(crate) statement: Box<dyn Statement>,
    /// Parameter OIDs exactly as the client declared them; may be empty.
    pub(crate) param_oids: Vec<u32>,
}

/// A bound portal awaiting Execute.
pub(crate) struct Portal {
    pub(crate) statement: String,
    pub(crate) param_formats: Vec<i16>,
    pub(crate) params: Vec<Option<Vec<u8>>>,
    pub(crate) result_formats: Vec<i16>,
}

/// The per-connection state machine over a [`SessionStream`], so plain TCP
/// and TLS sessions share one implementation and can switch mid-session.
pub struct Session {
    pub(crate) stream: SessionStream,
    /// Outbound frames queue here until the response batch is complete.
    pub(crate) buffer: BytesMut,
    pub(crate) id: SessionIdentifier,
    pub(crate) manager: Arc<DatabaseManager>,
    pub(crate) config: SessionConfig,
    pub(crate) db: Arc<DatabaseHandle>,
    pub(crate) statements: HashMap<String, PreparedStatement>,
    pub(crate) portals: HashMap<String, Portal>,
    pub(crate) tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
    pub(crate) shutdown: broadcast::Receiver<()>,
}

impl Session {
    pub(crate) fn new(
        stream: SessionStream,
        id: SessionIdentifier,
        manager: Arc<DatabaseManager>,
        config: SessionConfig,
        db: Arc<DatabaseHandle>,
        tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
        shutdown: broadcast::Receiver<()>,
    ) -> Session {
        Session {
            stream,
            buffer: BytesMut::new(),
            id,
            manager,
            config,
            db,
            statements: HashMap::new(),
            portals: HashMap::new(),
            tls_acceptor,
            shutdown,
        }
    }

    /// The command loop. Returns cleanly on Terminate or client EOF; any
    /// error tears the session down.
    pub async fn handle(&mut self) -> Result<(), Error> {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.recv() => return Err(Error::ShuttingDown),
                message = read_message(&mut self.stream) => message?,
            };
            let Some(message) = message else {
                debug!("session {}: client closed the stream", self.id);
                return Ok(());
            };
            match message {
                FrontendMessage::Query { sql } => self.handle_query(&sql).await?,
                FrontendMessage::Parse {
                    name,
                    sql,
                    param_oids,
                } => self.handle_parse(name, &sql, param_oids).await?,
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                } => {
                    self.handle_bind(portal, statement, param_formats, params, result_formats)
                        .await?
                }
                FrontendMessage::Describe { target, name } => {
                    self.handle_describe(target, &name).await?
                }
                FrontendMessage::Execute { portal, max_rows } => {
                    self.handle_execute(&portal, max_rows).await?
                }
                FrontendMessage::Close { target, name } => {
                    self.handle_close(target, &name).await?
                }
                FrontendMessage::Sync => {
                    self.push(ready_for_query(TransactionStatus::Idle));
                    self.flush_response().await?;
                }
                FrontendMessage::Flush => {
                    // Flush answers with a ReadyForQuery boundary; tests pin
                    // this shape.
                    self.push(ready_for_query(TransactionStatus::Idle));
                    self.flush_response().await?;
                }
                FrontendMessage::Terminate => {
                    debug!("session {}: terminated", self.id);
                    return Ok(());
                }
                FrontendMessage::SslRequest => self.upgrade_tls().await?,
                FrontendMessage::GssEncRequest => {
                    return self
                        .fatal("GSSAPI encryption is not supported", "0A000")
                        .await;
                }
                FrontendMessage::CancelRequest => {
                    return self.fatal("cancel requests are not supported", "0A000").await;
                }
                FrontendMessage::Startup => {
                    return self.fatal("startup message out of sequence", "08P01").await;
                }
                FrontendMessage::Password { .. } => {
                    return self.fatal("unexpected password message", "08P01").await;
                }
                FrontendMessage::FunctionCall => {
                    return self.fatal("function calls are not supported", "0A000").await;
                }
                FrontendMessage::CopyData
                | FrontendMessage::CopyDone
                | FrontendMessage::CopyFail => {
                    return self.fatal("COPY is not supported", "0A000").await;
                }
            }
        }
    }

    /// Lazy TLS: answer an `SSLRequest` from the ready state. When TLS is
    /// configured and the transport is still plain, write `'S'` and swap the
    /// framer onto the encrypted stream; otherwise answer `'N'` and carry on.
    async fn upgrade_tls(&mut self) -> Result<(), Error> {
        self.flush_response().await?;
        let acceptor = match self.tls_acceptor.clone() {
            Some(acceptor) if self.stream.is_plain() => acceptor,
            _ => return write_all_flush(&mut self.stream, b"N").await,
        };
        write_all_flush(&mut self.stream, b"S").await?;
        let stream = std::mem::replace(&mut self.stream, SessionStream::Detached);
        self.stream = stream.upgrade(&acceptor).await?;
        debug!("session {}: TLS established mid-session", self.id);
        Ok(())
    }

    /// Queue one frame onto the current response batch.
    pub(crate) fn push(&mut self, frame: BytesMut) {
        self.buffer.put(frame);
    }

    /// Send the queued batch in one write.
    pub(crate) async fn flush_response(&mut self) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buf = self.buffer.split();
        write_all_flush(&mut self.stream, &buf).await
    }

    /// Queue a recoverable `ErrorResponse` and flush the batch. No
    /// `ReadyForQuery` follows: the client's Sync produces one.
    pub(crate) async fn error(&mut self, message: &str, code: &str) -> Result<(), Error> {
        self.push(error_message("ERROR", code, message));
        self.flush_response().await
    }

    /// A protocol violation: best-effort fatal `ErrorResponse`, then the
    /// session ends.
    async fn fatal(&mut self, message: &str, code: &str) -> Result<(), Error> {
        self.push(error_message("FATAL", code, message));
        let _ = self.flush_response().await;
        Err(Error::Protocol(message.to_string()))
    }
}
