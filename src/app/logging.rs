//! Logging initialisation.

use log::info;
use tracing_subscriber::EnvFilter;

use super::args::Args;
use crate::VERSION;

pub fn init_logging(args: &Args) {
    // Default from the verbosity flag; RUST_LOG still wins when set.
    let filter = EnvFilter::from_default_env().add_directive(args.verbosity().into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("Welcome to pg_warren! (Version {VERSION})");
}
