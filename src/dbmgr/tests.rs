//! Tests for the database manager and handle lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::engine::memory::MemoryEngine;
use crate::engine::{EngineHooks, Value};

fn new_manager(dir: &TempDir, cfg: ManagerConfig) -> Arc<DatabaseManager> {
    let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new(EngineHooks::default()));
    DatabaseManager::new(
        cfg,
        engine.clone(),
        factories::path_resolver(dir.path()),
        factories::database_creator(dir.path(), engine),
        None,
    )
}

fn quiet_config(dir: &TempDir) -> ManagerConfig {
    ManagerConfig {
        base_dir: dir.path().to_path_buf(),
        // Long periods: tests drive sweep/checkpoint by hand.
        sweep_each: Duration::from_secs(3600),
        checkpoint_each: Duration::ZERO,
        log_open_close: false,
        ..ManagerConfig::default()
    }
}

#[tokio::test]
async fn get_or_create_builds_the_file_and_caches_the_handle() {
    let dir = TempDir::new().unwrap();
    let manager = new_manager(&dir, quiet_config(&dir));

    let first = manager.get_or_create("crm").unwrap();
    assert!(dir.path().join("crm.db").is_file());
    assert_eq!(manager.open_count(), 1);

    // Same id resolves to the same handle, never a second one.
    let second = manager.get("crm").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.open_count(), 1);
}

#[tokio::test]
async fn get_refuses_unknown_databases() {
    let dir = TempDir::new().unwrap();
    let manager = new_manager(&dir, quiet_config(&dir));

    match manager.get("missing") {
        Err(Error::CouldNotOpenFile) => {}
        other => panic!("expected CouldNotOpenFile, got {other:?}"),
    }
    assert_eq!(manager.open_count(), 0);
}

#[tokio::test]
async fn open_cap_is_enforced() {
    let dir = TempDir::new().unwrap();
    let cfg = ManagerConfig {
        max_open: 2,
        ..quiet_config(&dir)
    };
    let manager = new_manager(&dir, cfg);

    manager.get_or_create("a").unwrap();
    manager.get_or_create("b").unwrap();
    match manager.get_or_create("c") {
        Err(Error::TooManyOpen) => {}
        other => panic!("expected TooManyOpen, got {other:?}"),
    }
    assert_eq!(manager.open_count(), 2);
    assert!(manager.stats().errors >= 1);

    // An id that is already open never trips the cap.
    manager.get("a").unwrap();
}

#[tokio::test]
async fn handles_execute_and_query() {
    let dir = TempDir::new().unwrap();
    let manager = new_manager(&dir, quiet_config(&dir));
    let db = manager.get_or_create("store").unwrap();

    db.exec("create table kv(k text, v integer)", &[]).unwrap();
    let outcome = db.exec("insert into kv values ('answer', 42)", &[]).unwrap();
    assert_eq!(outcome.rows_affected, 1);

    let row = db.query_row("select * from kv", &[]).unwrap().unwrap();
    assert_eq!(
        row,
        vec![Value::Text("answer".into()), Value::Integer(42)]
    );
    db.ping().unwrap();
    // The reference engine runs without an internal authorization layer.
    assert!(!db.auth_enabled());
}

#[tokio::test]
async fn sweep_closes_idle_handles_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let cfg = ManagerConfig {
        max_idle_time: Duration::ZERO,
        ..quiet_config(&dir)
    };
    let manager = new_manager(&dir, cfg);
    manager.get_or_create("idle").unwrap();
    assert_eq!(manager.open_count(), 1);

    manager.sweep();
    assert_eq!(manager.open_count(), 0);
    let closes = manager.stats().closes;

    // Running the sweep again closes nothing further.
    manager.sweep();
    assert_eq!(manager.stats().closes, closes);
}

#[tokio::test]
async fn closed_handle_reopens_on_next_use() {
    let dir = TempDir::new().unwrap();
    let cfg = ManagerConfig {
        max_idle_time: Duration::ZERO,
        ..quiet_config(&dir)
    };
    let manager = new_manager(&dir, cfg);
    let db = manager.get_or_create("phoenix").unwrap();
    db.exec("create table t(v integer)", &[]).unwrap();

    manager.sweep();
    assert_eq!(manager.open_count(), 0);
    assert!(db.pending_delete());
    match db.ping() {
        Err(Error::NotOpen) => {}
        other => panic!("expected NotOpen, got {other:?}"),
    }

    // The next use reopens the engine and re-registers the handle.
    let mut rows = db.query("select 1", &[]).unwrap();
    assert_eq!(
        rows.next_row().unwrap().unwrap(),
        vec![Value::Integer(1)]
    );
    assert_eq!(manager.open_count(), 1);
    assert!(!db.pending_delete());
    assert!(Arc::ptr_eq(&db, &manager.get("phoenix").unwrap()));
}

#[tokio::test]
async fn reopen_adopts_the_registered_live_handle() {
    let dir = TempDir::new().unwrap();
    let cfg = ManagerConfig {
        max_idle_time: Duration::ZERO,
        ..quiet_config(&dir)
    };
    let manager = new_manager(&dir, cfg);
    let stale = manager.get_or_create("raced").unwrap();

    manager.sweep();
    // A fresh handle wins the slot before the stale one reopens.
    let fresh = manager.get("raced").unwrap();
    assert!(!Arc::ptr_eq(&stale, &fresh));

    let winner = stale.reopen().unwrap();
    match winner {
        Some(live) => assert!(Arc::ptr_eq(&live, &fresh)),
        None => panic!("expected the reopen to adopt the live handle"),
    }
    assert_eq!(manager.open_count(), 1);
}

#[tokio::test]
async fn close_db_and_close_tear_everything_down() {
    let dir = TempDir::new().unwrap();
    let manager = new_manager(&dir, quiet_config(&dir));
    manager.get_or_create("one").unwrap();
    manager.get_or_create("two").unwrap();

    manager.close_db("one");
    assert_eq!(manager.open_count(), 1);

    manager.close();
    assert_eq!(manager.open_count(), 0);
    assert_eq!(manager.stats().closes, 2);
}

#[tokio::test]
async fn authorize_defaults_to_allow() {
    let dir = TempDir::new().unwrap();
    let manager = new_manager(&dir, quiet_config(&dir));
    assert!(manager.authorize("anyone", "anything", "any").unwrap());

    let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new(EngineHooks::default()));
    let checked = DatabaseManager::new(
        quiet_config(&dir),
        engine.clone(),
        factories::path_resolver(dir.path()),
        factories::database_creator(dir.path(), engine),
        Some(Arc::new(|user: &str, password: &str, _db: &str| {
            Ok(user == "alice" && password == "opensesame")
        })),
    );
    assert!(checked.authorize("alice", "opensesame", "x").unwrap());
    assert!(!checked.authorize("alice", "wrong", "x").unwrap());
}

#[tokio::test]
async fn background_sweeper_reclaims_idle_handles() {
    let dir = TempDir::new().unwrap();
    let cfg = ManagerConfig {
        max_idle_time: Duration::from_millis(50),
        sweep_each: Duration::from_millis(50),
        checkpoint_each: Duration::ZERO,
        log_open_close: false,
        ..ManagerConfig::default()
    };
    let manager = new_manager(&dir, cfg);
    manager.get_or_create("sleepy").unwrap();
    assert_eq!(manager.open_count(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(manager.open_count(), 0);

    // A later get opens the database again.
    let db = manager.get("sleepy").unwrap();
    db.ping().unwrap();
}

#[tokio::test]
async fn user_stamp_is_informational() {
    let dir = TempDir::new().unwrap();
    let manager = new_manager(&dir, quiet_config(&dir));
    let db = manager.get_or_create("tagged").unwrap();
    assert_eq!(db.current_user(), None);
    db.set_current_user(Some("carol".into()));
    assert_eq!(db.current_user(), Some("carol".into()));
}
