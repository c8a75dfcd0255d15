//! Device-side update agent.
//!
//! A JWT authenticator, an API client that transparently re-authenticates
//! on `401`, a loopback reverse proxy for on-device clients, a
//! crash-recoverable update state engine that drives external update
//! modules, and a deployment client that polls for work and reports back.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api_client;
pub mod auth;
pub mod cli;
pub mod config;
pub mod deployment;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod kvstore;
pub mod proxy;
pub mod update;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global `tracing` subscriber. `log_file`, when given,
/// writes logs to that file instead of stderr.
pub fn setup_tracing(level: &str, log_file: Option<&std::path::Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("opening log file {}: {e}", path.display())))?;
            subscriber.with(fmt::layer().with_writer(file).with_ansi(false)).init();
        }
        None => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
