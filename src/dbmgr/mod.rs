//! The process-wide registry of open databases.
//!
//! One manager per process maps database ids to open [`DatabaseHandle`]s,
//! enforces the open cap, and reclaims idle handles in the background. The
//! map is guarded by a single mutex; engines are opened outside it, so the
//! cap check is advisory and concurrent openers may briefly overshoot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;

pub mod config;
pub mod factories;
pub mod handle;
pub mod options;

#[cfg(test)]
mod tests;

pub use config::{FnCheckAccess, FnCreateDb, FnGetPath, ManagerConfig};
pub use handle::DatabaseHandle;
pub use options::{
    AutoVacuum, ConnectionOptions, JournalMode, LockingMode, SecureDelete, Synchronous,
    TransactionLock,
};

use crate::engine::{Engine, EngineConnection};
use crate::errors::Error;

/// Point-in-time counter values, for the stats log line and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub open: i64,
    pub opens: u64,
    pub closes: u64,
    pub errors: u64,
}

pub struct DatabaseManager {
    cfg: ManagerConfig,
    engine: Arc<dyn Engine>,
    databases: Mutex<HashMap<String, Arc<DatabaseHandle>>>,
    open_count: AtomicI64,
    total_opens: AtomicU64,
    total_closes: AtomicU64,
    total_errors: AtomicU64,
    get_path: FnGetPath,
    create_db: FnCreateDb,
    check_access: Option<FnCheckAccess>,
    stop: broadcast::Sender<()>,
    me: Weak<DatabaseManager>,
}

impl DatabaseManager {
    /// Build the manager and start its background tasks. Must be called from
    /// within a tokio runtime.
    pub fn new(
        cfg: ManagerConfig,
        engine: Arc<dyn Engine>,
        get_path: FnGetPath,
        create_db: FnCreateDb,
        check_access: Option<FnCheckAccess>,
    ) -> Arc<DatabaseManager> {
        let (stop, _) = broadcast::channel(1);
        let manager = Arc::new_cyclic(|me| DatabaseManager {
            cfg,
            engine,
            databases: Mutex::new(HashMap::new()),
            open_count: AtomicI64::new(0),
            total_opens: AtomicU64::new(0),
            total_closes: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            get_path,
            create_db,
            check_access,
            stop,
            me: me.clone(),
        });
        manager.spawn_sweeper();
        manager.spawn_checkpointer();
        manager
    }

    fn spawn_sweeper(&self) {
        let weak = self.me.clone();
        let mut stop = self.stop.subscribe();
        let period = self.cfg.sweep_each;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.sweep();
                    }
                }
            }
        });
    }

    fn spawn_checkpointer(&self) {
        if self.cfg.checkpoint_each.is_zero() {
            return;
        }
        let weak = self.me.clone();
        let mut stop = self.stop.subscribe();
        let period = self.cfg.checkpoint_each;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.checkpoint_pass();
                    }
                }
            }
        });
    }

    fn me(&self) -> Arc<DatabaseManager> {
        // The weak self-reference only dies once the last Arc is gone, at
        // which point no method can be running.
        self.me.upgrade().expect("manager outlives its methods")
    }

    /// Return the open handle for `id`, opening the existing database file
    /// on a miss.
    pub fn get(&self, id: &str) -> Result<Arc<DatabaseHandle>, Error> {
        if let Some(handle) = self.lookup(id) {
            return Ok(handle);
        }
        self.open(id, self.cfg.default_options.clone())?;
        self.lookup(id).ok_or(Error::CouldNotOpenFile)
    }

    /// Like [`DatabaseManager::get`], but runs the creation collaborator
    /// when the database file does not exist yet.
    pub fn get_or_create(&self, id: &str) -> Result<Arc<DatabaseHandle>, Error> {
        if let Some(handle) = self.lookup(id) {
            return Ok(handle);
        }
        self.open_or_create(id, self.cfg.default_options.clone())?;
        self.lookup(id).ok_or(Error::CouldNotOpenFile)
    }

    fn lookup(&self, id: &str) -> Option<Arc<DatabaseHandle>> {
        self.databases.lock().get(id).cloned()
    }

    /// Open an existing database. No-op when `id` is already open.
    pub fn open(&self, id: &str, opts: ConnectionOptions) -> Result<(), Error> {
        if self.lookup(id).is_some() {
            return Ok(());
        }
        let handle = self.open_handle(id, opts, false)?;
        self.install(id, handle);
        Ok(())
    }

    /// Open a database, creating its file first when missing. No-op when
    /// `id` is already open.
    pub fn open_or_create(&self, id: &str, opts: ConnectionOptions) -> Result<(), Error> {
        if self.lookup(id).is_some() {
            return Ok(());
        }
        let handle = self.open_handle(id, opts, true)?;
        self.install(id, handle);
        Ok(())
    }

    fn open_handle(
        &self,
        id: &str,
        opts: ConnectionOptions,
        create: bool,
    ) -> Result<Arc<DatabaseHandle>, Error> {
        if self.open_count.load(Ordering::Relaxed) >= self.cfg.max_open as i64 {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
            return Err(Error::TooManyOpen);
        }
        let path = (self.get_path)(id)?;
        let conn = if create {
            match self.try_open(&path, &opts) {
                Ok(conn) => conn,
                Err(_) => {
                    (self.create_db)(id, &opts)?;
                    self.try_open(&path, &opts)?
                }
            }
        } else {
            let meta = std::fs::metadata(&path).map_err(|_| {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
                Error::CouldNotOpenFile
            })?;
            if !meta.is_file() {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
                return Err(Error::CouldNotOpenFile);
            }
            self.try_open(&path, &opts)?
        };
        self.open_count.fetch_add(1, Ordering::Relaxed);
        self.total_opens.fetch_add(1, Ordering::Relaxed);
        if self.cfg.log_open_close {
            info!("database {id:?} opened");
        }
        Ok(DatabaseHandle::new(id, opts, conn, &self.me()))
    }

    fn try_open(
        &self,
        path: &Path,
        opts: &ConnectionOptions,
    ) -> Result<Box<dyn EngineConnection>, Error> {
        let conn_str = format!("file:{}{}", path.display(), opts.conn_str_opts("rw"));
        let conn = self.engine.open(&conn_str).map_err(|err| {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
            err
        })?;
        conn.ping()?;
        Ok(conn)
    }

    fn install(&self, id: &str, handle: Arc<DatabaseHandle>) {
        let duplicate = {
            let mut databases = self.databases.lock();
            match databases.entry(id.to_string()) {
                std::collections::hash_map::Entry::Occupied(_) => Some(handle),
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(handle);
                    None
                }
            }
        };
        // Lost an open race; the earlier handle stays.
        if let Some(duplicate) = duplicate {
            duplicate.close();
        }
    }

    /// Called by a reopening handle. Installs it when the id has no entry or
    /// a dead one; returns the registered live handle otherwise so the
    /// caller can discard its own.
    pub(crate) fn add_conn(
        &self,
        id: &str,
        handle: &Arc<DatabaseHandle>,
    ) -> Option<Arc<DatabaseHandle>> {
        let mut databases = self.databases.lock();
        match databases.get(id).cloned() {
            None => {
                databases.insert(id.to_string(), handle.clone());
                None
            }
            Some(existing) if Arc::ptr_eq(&existing, handle) => None,
            Some(existing) if existing.is_live() => Some(existing),
            Some(_) => {
                databases.insert(id.to_string(), handle.clone());
                None
            }
        }
    }

    /// Close one database and drop it from the map.
    pub fn close_db(&self, id: &str) {
        let handle = self.databases.lock().remove(id);
        if let Some(handle) = handle {
            handle.close();
        }
    }

    /// Stop the background tasks, then close every handle.
    pub fn close(&self) {
        let _ = self.stop.send(());
        let handles: Vec<Arc<DatabaseHandle>> = {
            let mut databases = self.databases.lock();
            databases.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.close();
        }
    }

    /// Reclaim handles idle for longer than the configured threshold, plus
    /// any already flagged pending-delete. Entries are detached under the
    /// manager lock and their engines closed after it is released, so a
    /// concurrently reopening handle cannot deadlock against the sweep.
    pub fn sweep(&self) {
        let max_idle = self.cfg.max_idle_time;
        let expired: Vec<Arc<DatabaseHandle>> = {
            let mut databases = self.databases.lock();
            let ids: Vec<String> = databases
                .iter()
                .filter(|(_, handle)| handle.pending_delete() || handle.idle_for() > max_idle)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| databases.remove(id)).collect()
        };
        if expired.is_empty() {
            return;
        }
        debug!("sweeping {} idle database(s)", expired.len());
        for handle in expired {
            handle.mark_pending_delete();
            handle.close();
        }
    }

    /// Checkpoint every WAL-journal handle. Failures are logged and the
    /// handle is left for the next pass.
    fn checkpoint_pass(&self) {
        let wal_handles: Vec<Arc<DatabaseHandle>> = {
            let databases = self.databases.lock();
            databases
                .values()
                .filter(|handle| handle.options().journal_mode == JournalMode::Wal)
                .cloned()
                .collect()
        };
        for handle in wal_handles {
            match handle.checkpoint() {
                Ok(()) => debug!("database {:?} checkpointed", handle.id()),
                Err(Error::NotOpen) => {}
                Err(err) => warn!("database {:?}: checkpoint failed: {err}", handle.id()),
            }
        }
    }

    /// Forward to the configured access-check function; allow when none is
    /// configured.
    pub fn authorize(&self, user: &str, password: &str, database: &str) -> Result<bool, Error> {
        match &self.check_access {
            None => Ok(true),
            Some(check) => check(user, password, database),
        }
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            open: self.open_count.load(Ordering::Relaxed),
            opens: self.total_opens.load(Ordering::Relaxed),
            closes: self.total_closes.load(Ordering::Relaxed),
            errors: self.total_errors.load(Ordering::Relaxed),
        }
    }

    pub fn open_count(&self) -> i64 {
        self.open_count.load(Ordering::Relaxed)
    }

    pub(crate) fn resolve_path(&self, id: &str) -> Result<PathBuf, Error> {
        (self.get_path)(id)
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub(crate) fn note_reopen(&self, id: &str) {
        self.open_count.fetch_add(1, Ordering::Relaxed);
        self.total_opens.fetch_add(1, Ordering::Relaxed);
        if self.cfg.log_open_close {
            info!("database {id:?} reopened");
        }
    }

    pub(crate) fn note_close(&self, id: &str) {
        self.open_count.fetch_sub(1, Ordering::Relaxed);
        self.total_closes.fetch_add(1, Ordering::Relaxed);
        if self.cfg.log_open_close {
            info!("database {id:?} closed");
        }
    }
}
