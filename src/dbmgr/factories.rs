//! Default collaborator implementations.

use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use super::config::{FnCreateDb, FnGetPath};
use crate::engine::Engine;
use crate::errors::Error;

/// Resolve `<base>/<id>.db`. Ids that would escape the base directory are
/// rejected before they reach the filesystem.
pub fn path_resolver(base_dir: impl Into<PathBuf>) -> FnGetPath {
    let base = base_dir.into();
    Arc::new(move |id: &str| {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(Error::DoesNotExist);
        }
        Ok(base.join(format!("{id}.db")))
    })
}

/// Create the database file and flush it to disk. The engine is opened in
/// `rwc` mode and pinged: creating the file alone is not enough for engines
/// that defer allocation until first use.
pub fn database_creator(base_dir: impl Into<PathBuf>, engine: Arc<dyn Engine>) -> FnCreateDb {
    let resolve = path_resolver(base_dir);
    Arc::new(move |id, opts| {
        let path = resolve(id)?;
        let conn_str = format!("file:{}{}", path.display(), opts.conn_str_opts("rwc"));
        debug!("creating database {id:?} with open-string {conn_str}");
        let conn = engine.open(&conn_str)?;
        conn.ping()?;
        let _ = conn.close();
        Ok(())
    })
}
