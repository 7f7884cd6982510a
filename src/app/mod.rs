//! Gateway entry: runtime, listener and accept loop.

pub mod args;
pub mod logging;
pub mod tls;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use socket2::SockRef;
use tokio::net::TcpSocket;
use tokio::runtime::Builder;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::broadcast;

use crate::dbmgr::{factories, DatabaseManager, ManagerConfig};
use crate::engine::memory::{MemoryEngine, DRIVER_NAME};
use crate::engine::{self, Engine, EngineHooks};
use crate::errors::Error;
use crate::format_duration;
use crate::session::{self, SessionConfig};
use crate::VERSION;

use self::args::Args;

/// Sessions accepted since start.
pub static SESSIONS_OPENED: AtomicU64 = AtomicU64::new(0);
/// Sessions finished since start.
pub static SESSIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
/// Sessions that ended with an error, accept failures included.
pub static SESSION_ERRORS: AtomicU64 = AtomicU64::new(0);
/// Sessions currently running.
pub static ACTIVE_SESSIONS: AtomicI64 = AtomicI64::new(0);

pub fn run_server(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("worker-pg-warren")
        .build()?;
    runtime.block_on(async move { serve(args).await })?;
    Ok(())
}

async fn serve(args: Args) -> Result<(), Error> {
    // One-time driver registration with the default hook set.
    let engine: Arc<dyn Engine> =
        Arc::new(MemoryEngine::new(EngineHooks::with_version(VERSION)));
    engine::register_driver(DRIVER_NAME, engine.clone())?;

    let check_access = {
        let (ufile, gfile) = args.user_file_paths();
        match ufile {
            None => None,
            Some(ufile) => {
                let users = crate::auth::UserFile::load(&ufile)?;
                let groups = match gfile {
                    Some(gfile) => Some(crate::auth::GroupFile::load(&gfile)?),
                    None => None,
                };
                info!("loaded {} user(s) from {}", users.len(), ufile.display());
                Some(crate::auth::access_checker(users, groups))
            }
        }
    };

    let manager = DatabaseManager::new(
        ManagerConfig {
            base_dir: args.dir.clone(),
            max_open: args.max_open,
            max_idle_time: Duration::from_secs(args.max_idle_secs),
            sweep_each: Duration::from_secs(args.sweep_secs.max(1)),
            checkpoint_each: Duration::from_secs(args.checkpoint_secs),
            ..ManagerConfig::default()
        },
        engine.clone(),
        factories::path_resolver(&args.dir),
        factories::database_creator(&args.dir, engine),
        check_access,
    );

    let tls_acceptor = match args.tls_paths()? {
        Some((cert, key)) => {
            info!("TLS enabled with certificate {}", cert.display());
            Some(tls::build_acceptor(&cert, &key)?)
        }
        None => None,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let socket = TcpSocket::new_v4().map_err(Error::Transport)?;
    socket.set_reuseaddr(true).map_err(Error::Transport)?;
    socket.set_nodelay(true).map_err(Error::Transport)?;
    {
        let sock_ref = SockRef::from(&socket);
        sock_ref
            .set_linger(Some(Duration::from_secs(0)))
            .map_err(Error::Transport)?;
    }
    socket.bind(addr).map_err(Error::Transport)?;
    let listener = socket.listen(1024).map_err(Error::Transport)?;
    info!("Running on {addr}");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let session_config = SessionConfig {
        server_version: args.server_version.clone(),
        log_messages: args.log_messages,
    };

    // Periodic one-line session report.
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = manager.stats();
                info!(
                    "sessions: opened={} closed={} errored={} active={}; databases: open={} opens={} closes={} errors={}",
                    SESSIONS_OPENED.load(Ordering::Relaxed),
                    SESSIONS_CLOSED.load(Ordering::Relaxed),
                    SESSION_ERRORS.load(Ordering::Relaxed),
                    ACTIVE_SESSIONS.load(Ordering::Relaxed),
                    stats.open,
                    stats.opens,
                    stats.closes,
                    stats.errors,
                );
            }
        });
    }

    let mut term_signal = unix_signal(SignalKind::terminate()).map_err(Error::Transport)?;
    let mut interrupt_signal = unix_signal(SignalKind::interrupt()).map_err(Error::Transport)?;

    info!("Waiting for clients");
    loop {
        tokio::select! {
            _ = term_signal.recv() => {
                info!("Got SIGTERM, shutting down");
                break;
            }
            _ = interrupt_signal.recv() => {
                info!("Got SIGINT, shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        SESSION_ERRORS.fetch_add(1, Ordering::Relaxed);
                        error!("accept error: {err:?}");
                        continue;
                    }
                };
                if let Err(err) = socket.set_nodelay(true) {
                    warn!("client {addr:?}: cannot set nodelay: {err:?}");
                }
                let manager = manager.clone();
                let config = session_config.clone();
                let tls_acceptor = tls_acceptor.clone();
                let shutdown = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    SESSIONS_OPENED.fetch_add(1, Ordering::Relaxed);
                    ACTIVE_SESSIONS.fetch_add(1, Ordering::SeqCst);
                    let start = chrono::offset::Utc::now().naive_utc();
                    match session::entrypoint(socket, manager, config, tls_acceptor, shutdown)
                        .await
                    {
                        Ok(()) => {
                            let duration = chrono::offset::Utc::now().naive_utc() - start;
                            debug!(
                                "client {:?} disconnected, session duration: {}",
                                addr,
                                format_duration(&duration)
                            );
                        }
                        Err(err) => {
                            SESSION_ERRORS.fetch_add(1, Ordering::Relaxed);
                            let duration = chrono::offset::Utc::now().naive_utc() - start;
                            warn!(
                                "client {:?} disconnected with error: {}, duration: {}",
                                addr,
                                err,
                                format_duration(&duration)
                            );
                        }
                    }
                    SESSIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
                    ACTIVE_SESSIONS.fetch_add(-1, Ordering::SeqCst);
                });
            }
        }
    }

    info!("Shutting down...");
    let _ = shutdown_tx.send(());
    manager.close();
    Ok(())
}
