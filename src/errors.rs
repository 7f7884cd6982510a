//! Errors.

use std::io;

use crate::engine::EngineError;

/// Everything that can go wrong inside the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database is not open")]
    NotOpen,
    #[error("could not open database file")]
    CouldNotOpenFile,
    #[error("database does not exist")]
    DoesNotExist,
    #[error("database does not live on this server")]
    WrongServer,
    #[error("cannot open database: too many databases open")]
    TooManyOpen,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not authorized")]
    AuthDenied,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Tls(#[from] native_tls::Error),
    #[error("shutting down")]
    ShuttingDown,
    #[error("engine driver {0:?} is already registered")]
    DriverRegistered(String),
    #[error("unknown engine driver {0:?}")]
    UnknownDriver(String),
    #[error("bad configuration: {0}")]
    BadConfig(String),
}

/// Enough context to identify a session in log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentifier {
    pub addr: String,
    pub username: String,
    pub database: String,
}

impl SessionIdentifier {
    pub fn new(addr: &str, username: &str, database: &str) -> SessionIdentifier {
        SessionIdentifier {
            addr: addr.into(),
            username: username.into(),
            database: database.into(),
        }
    }
}

impl std::fmt::Display for SessionIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let Self {
            addr,
            username,
            database,
        } = self;
        write!(f, "{{ {username}@{addr}/{database} }}")
    }
}
