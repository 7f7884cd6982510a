//! The narrow interface to the embedded SQL engine.
//!
//! The gateway never interprets SQL itself. Every statement is handed to an
//! [`Engine`] implementation registered once per process under a driver name;
//! the registry is immutable after first use. Deployments link their own
//! engine; [`memory::MemoryEngine`] is the in-process reference used by the
//! default wiring and the test-suite.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::errors::Error;

pub mod hooks;
pub mod memory;

pub use hooks::EngineHooks;

/// An error produced by the engine. The message is forwarded to clients
/// verbatim inside an `ErrorResponse`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> EngineError {
        EngineError(message.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// A single value scanned from a row or bound to a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Column metadata as declared by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// The engine's declared type name, e.g. `integer` or `blob`. Matched
    /// case-insensitively by the type mapper.
    pub decl_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, decl_type: impl Into<String>) -> Column {
        Column {
            name: name.into(),
            decl_type: decl_type.into(),
        }
    }
}

/// Result of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

pub trait Engine: Send + Sync {
    /// Open a connection from a `file:<path>?opts` open-string as produced by
    /// [`crate::dbmgr::ConnectionOptions::conn_str_opts`].
    fn open(&self, conn_str: &str) -> EngineResult<Box<dyn EngineConnection>>;
}

pub trait EngineConnection: Send + Sync {
    /// Probe liveness.
    fn ping(&self) -> EngineResult<()>;
    fn exec(&self, sql: &str, params: &[Value]) -> EngineResult<ExecOutcome>;
    fn query(&self, sql: &str, params: &[Value]) -> EngineResult<Box<dyn Rows>>;
    fn prepare(&self, sql: &str) -> EngineResult<Box<dyn Statement>>;
    /// Whether the engine's internal authorization layer is active.
    /// Informational only.
    fn auth_enabled(&self) -> EngineResult<bool>;
    /// Flush the write-ahead journal, when the engine keeps one.
    fn checkpoint(&self) -> EngineResult<()>;
    fn close(&self) -> EngineResult<()>;
}

pub trait Statement: Send + Sync {
    fn query(&self, params: &[Value]) -> EngineResult<Box<dyn Rows>>;
    fn parameter_count(&self) -> usize;
}

/// Cursor over a result set. The cursor owns whatever engine resources it
/// needs: it stays valid after the issuing lock is released, but not past
/// the owning connection's close.
pub trait Rows: Send {
    fn columns(&self) -> &[Column];
    fn next_row(&mut self) -> EngineResult<Option<Vec<Value>>>;
}

static DRIVERS: Lazy<Mutex<HashMap<String, Arc<dyn Engine>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register an engine under `name`. Registering the same name twice is an
/// error; the first registration wins for the lifetime of the process.
pub fn register_driver(name: &str, engine: Arc<dyn Engine>) -> Result<(), Error> {
    let mut drivers = DRIVERS.lock();
    if drivers.contains_key(name) {
        return Err(Error::DriverRegistered(name.to_string()));
    }
    drivers.insert(name.to_string(), engine);
    Ok(())
}

pub fn driver(name: &str) -> Result<Arc<dyn Engine>, Error> {
    DRIVERS
        .lock()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::UnknownDriver(name.to_string()))
}
