//! A single open database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use super::options::ConnectionOptions;
use super::DatabaseManager;
use crate::engine::{EngineConnection, ExecOutcome, Rows, Statement, Value};
use crate::errors::Error;

/// One open engine attached to one database file.
///
/// Readers share the lock, so concurrent queries from different sessions run
/// in parallel; `exec` and reopen are exclusive. The manager's sweep may
/// close a handle while sessions still reference it; the next use reopens
/// the engine and re-registers the handle with the manager.
pub struct DatabaseHandle {
    id: String,
    options: ConnectionOptions,
    engine: RwLock<Option<Box<dyn EngineConnection>>>,
    last_accessed: Mutex<Instant>,
    pending_delete: AtomicBool,
    /// Informational: the user that opened this handle last.
    current_user: Mutex<Option<String>>,
    manager: Weak<DatabaseManager>,
    me: Weak<DatabaseHandle>,
}

impl DatabaseHandle {
    pub(super) fn new(
        id: &str,
        options: ConnectionOptions,
        conn: Box<dyn EngineConnection>,
        manager: &Arc<DatabaseManager>,
    ) -> Arc<DatabaseHandle> {
        Arc::new_cyclic(|me| DatabaseHandle {
            id: id.to_string(),
            options,
            engine: RwLock::new(Some(conn)),
            last_accessed: Mutex::new(Instant::now()),
            pending_delete: AtomicBool::new(false),
            current_user: Mutex::new(None),
            manager: Arc::downgrade(manager),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn current_user(&self) -> Option<String> {
        self.current_user.lock().clone()
    }

    pub fn set_current_user(&self, user: Option<String>) {
        *self.current_user.lock() = user;
    }

    pub fn pending_delete(&self) -> bool {
        self.pending_delete.load(Ordering::Acquire)
    }

    pub(super) fn mark_pending_delete(&self) {
        self.pending_delete.store(true, Ordering::Release);
    }

    /// Time since the handle was last used.
    pub fn idle_for(&self) -> Duration {
        self.last_accessed.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }

    /// Probe liveness. Fails with [`Error::NotOpen`] when the engine is
    /// absent; does not trigger a reopen.
    pub fn ping(&self) -> Result<(), Error> {
        let guard = self.engine.read();
        let conn = guard.as_ref().ok_or(Error::NotOpen)?;
        conn.ping().map_err(Error::from)
    }

    /// Attempt a non-blocking liveness check. Used by the manager while it
    /// holds its own lock: a handle whose lock is exclusively held is being
    /// operated on and counts as live.
    pub(super) fn is_live(&self) -> bool {
        match self.engine.try_read() {
            Some(guard) => guard
                .as_ref()
                .map(|conn| conn.ping().is_ok())
                .unwrap_or(false),
            None => true,
        }
    }

    /// Execute a statement under the exclusive lock.
    pub fn exec(&self, sql: &str, params: &[Value]) -> Result<ExecOutcome, Error> {
        let mut guard = self.engine.write();
        if guard.is_none() {
            if let Some(live) = self.reopen_locked(&mut guard)? {
                drop(guard);
                return live.exec(sql, params);
            }
        }
        let conn = guard.as_ref().ok_or(Error::NotOpen)?;
        self.touch();
        conn.exec(sql, params).map_err(Error::from)
    }

    /// Run a query under the shared lock. The returned cursor outlives the
    /// lock but not the connection's close.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Box<dyn Rows>, Error> {
        {
            let guard = self.engine.read();
            if let Some(conn) = guard.as_ref() {
                self.touch();
                return conn.query(sql, params).map_err(Error::from);
            }
        }
        let mut guard = self.engine.write();
        if guard.is_none() {
            if let Some(live) = self.reopen_locked(&mut guard)? {
                drop(guard);
                return live.query(sql, params);
            }
        }
        let guard = RwLockWriteGuard::downgrade(guard);
        let conn = guard.as_ref().ok_or(Error::NotOpen)?;
        self.touch();
        conn.query(sql, params).map_err(Error::from)
    }

    /// Single-row convenience over [`DatabaseHandle::query`].
    pub fn query_row(&self, sql: &str, params: &[Value]) -> Result<Option<Vec<Value>>, Error> {
        let mut rows = self.query(sql, params)?;
        Ok(rows.next_row()?)
    }

    /// Prepare a statement, reopening first if the engine is absent.
    pub fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>, Error> {
        {
            let guard = self.engine.read();
            if let Some(conn) = guard.as_ref() {
                self.touch();
                return conn.prepare(sql).map_err(Error::from);
            }
        }
        let mut guard = self.engine.write();
        if guard.is_none() {
            if let Some(live) = self.reopen_locked(&mut guard)? {
                drop(guard);
                return live.prepare(sql);
            }
        }
        let guard = RwLockWriteGuard::downgrade(guard);
        let conn = guard.as_ref().ok_or(Error::NotOpen)?;
        self.touch();
        conn.prepare(sql).map_err(Error::from)
    }

    /// Reopen the engine in place. Returns the surviving handle when a
    /// concurrent reopen won the registration race; the caller should use
    /// that handle and forget this one.
    pub fn reopen(&self) -> Result<Option<Arc<DatabaseHandle>>, Error> {
        let mut guard = self.engine.write();
        self.reopen_locked(&mut guard)
    }

    fn reopen_locked(
        &self,
        slot: &mut Option<Box<dyn EngineConnection>>,
    ) -> Result<Option<Arc<DatabaseHandle>>, Error> {
        let manager = self.manager.upgrade().ok_or(Error::NotOpen)?;
        let path = manager.resolve_path(&self.id)?;
        let meta = std::fs::metadata(&path).map_err(|_| Error::NotOpen)?;
        if !meta.is_file() {
            return Err(Error::NotOpen);
        }
        let conn_str = format!(
            "file:{}{}",
            path.display(),
            self.options.conn_str_opts("rw")
        );
        let conn = manager.engine().open(&conn_str)?;
        conn.ping()?;
        *slot = Some(conn);
        self.pending_delete.store(false, Ordering::Release);
        self.touch();
        manager.note_reopen(&self.id);

        let me = self.me.upgrade().ok_or(Error::NotOpen)?;
        if let Some(live) = manager.add_conn(&self.id, &me) {
            // Lost the race: another live handle is registered for this id.
            // Adopt it and close the engine we just opened.
            if let Some(conn) = slot.take() {
                let _ = conn.close();
            }
            manager.note_close(&self.id);
            return Ok(Some(live));
        }
        Ok(None)
    }

    /// Close the engine and flag the handle for deletion. Idempotent.
    pub fn close(&self) {
        let conn = {
            let mut guard = self.engine.write();
            guard.take()
        };
        self.pending_delete.store(true, Ordering::Release);
        if let Some(conn) = conn {
            if let Err(err) = conn.close() {
                log::warn!("database {:?}: close failed: {err}", self.id);
            }
            if let Some(manager) = self.manager.upgrade() {
                manager.note_close(&self.id);
            }
        }
    }

    /// Whether the engine's internal authorization layer is active.
    pub fn auth_enabled(&self) -> bool {
        let guard = self.engine.read();
        guard
            .as_ref()
            .and_then(|conn| conn.auth_enabled().ok())
            .unwrap_or(false)
    }

    /// Forward to the manager's access-check function; allow when none is
    /// configured.
    pub fn authorize(&self, user: &str, password: &str, database: &str) -> Result<bool, Error> {
        let manager = self.manager.upgrade().ok_or(Error::NotOpen)?;
        manager.authorize(user, password, database)
    }

    /// Checkpoint the engine's journal.
    pub fn checkpoint(&self) -> Result<(), Error> {
        let guard = self.engine.read();
        let conn = guard.as_ref().ok_or(Error::NotOpen)?;
        conn.checkpoint().map_err(Error::from)
    }
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("id", &self.id)
            .field("pending_delete", &self.pending_delete())
            .finish()
    }
}
