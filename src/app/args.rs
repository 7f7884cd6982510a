//! Command-line surface.

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

use crate::errors::Error;

/// pg_warren: PostgreSQL wire-protocol gateway over embedded per-file SQL
/// databases.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 5432, env = "PG_WARREN_PORT")]
    pub port: u16,

    /// Base directory for database files.
    #[arg(long, default_value = "/tmp", env = "PG_WARREN_DIR")]
    pub dir: PathBuf,

    /// Syslog-style verbosity, 0 (emergency) to 7 (debug).
    #[arg(long = "ll", default_value_t = 3, env = "PG_WARREN_LOG_LEVEL")]
    pub log_level: u8,

    /// Directory holding the TLS certificate and key.
    #[arg(long, env = "PG_WARREN_TLS_DIR")]
    pub tlsdir: Option<PathBuf>,

    /// TLS certificate file (PEM), relative to --tlsdir when that is set.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// TLS private key file (PKCS#8 PEM), relative to --tlsdir when that is
    /// set.
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Directory holding the user and group files.
    #[arg(long)]
    pub udir: Option<PathBuf>,

    /// htpasswd-style password file; without it every password is accepted.
    #[arg(long)]
    pub ufile: Option<PathBuf>,

    /// Group membership file; groups named after a database restrict who may
    /// open it.
    #[arg(long)]
    pub gfile: Option<PathBuf>,

    /// Maximum number of concurrently open databases.
    #[arg(long, default_value_t = 500)]
    pub max_open: usize,

    /// Close databases idle for longer than this many seconds.
    #[arg(long, default_value_t = 600)]
    pub max_idle_secs: u64,

    /// How often the idle sweeper runs, in seconds.
    #[arg(long, default_value_t = 30)]
    pub sweep_secs: u64,

    /// How often WAL databases are checkpointed, in seconds. Zero disables
    /// checkpointing.
    #[arg(long, default_value_t = 300)]
    pub checkpoint_secs: u64,

    /// Advertised server_version parameter; omitted when unset.
    #[arg(long, env = "PG_WARREN_SERVER_VERSION")]
    pub server_version: Option<String>,

    /// Log every client message (noisy).
    #[arg(long, default_value_t = false)]
    pub log_messages: bool,
}

pub fn parse() -> Args {
    Args::parse()
}

impl Args {
    /// Map the syslog-style number onto a tracing level.
    pub fn verbosity(&self) -> Level {
        match self.log_level {
            0..=3 => Level::ERROR,
            4 => Level::WARN,
            5 | 6 => Level::INFO,
            _ => Level::DEBUG,
        }
    }

    /// Resolve the TLS cert/key pair. All three flags are required together;
    /// a partial set is a configuration error.
    pub fn tls_paths(&self) -> Result<Option<(PathBuf, PathBuf)>, Error> {
        match (&self.tlsdir, &self.cert, &self.key) {
            (None, None, None) => Ok(None),
            (Some(dir), Some(cert), Some(key)) => Ok(Some((dir.join(cert), dir.join(key)))),
            _ => Err(Error::BadConfig(
                "TLS requires --tlsdir, --cert and --key together".into(),
            )),
        }
    }

    /// Resolve the user/group file paths against `--udir`.
    pub fn user_file_paths(&self) -> (Option<PathBuf>, Option<PathBuf>) {
        let resolve = |file: &Option<PathBuf>| {
            file.as_ref().map(|file| match &self.udir {
                Some(dir) => dir.join(file),
                None => file.clone(),
            })
        };
        (resolve(&self.ufile), resolve(&self.gfile))
    }
}
