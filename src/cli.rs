//! Command-line interface shared by the `authd` and `updated` binaries
//! (spec §6).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Device-side update agent.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the primary JSON config file.
    #[arg(short, long, env = "MENDER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a fallback JSON config file, merged underneath the
    /// primary one.
    #[arg(long, env = "MENDER_FALLBACK_CONFIG")]
    pub fallback_config: Option<PathBuf>,

    /// Data-store directory (KV store, keys, deployment logs).
    #[arg(long, env = "MENDER_DATASTORE_DIR")]
    pub data: Option<PathBuf>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Log level.
    #[arg(long, default_value = "info", value_parser = parse_log_level)]
    pub log_level: LogLevel,

    /// Force bootstrapping even if a key/identity already exist.
    #[arg(short = 'F', long)]
    pub forcebootstrap: bool,

    /// Read the private key passphrase from this file, or `-` for stdin.
    #[arg(long)]
    pub passphrase_file: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log levels accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// The `tracing`/`EnvFilter` level name this maps to.
    #[must_use]
    pub fn as_tracing_level(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Fatal => "error",
        }
    }
}

fn parse_log_level(s: &str) -> std::result::Result<LogLevel, String> {
    match s {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warning" => Ok(LogLevel::Warning),
        "error" => Ok(LogLevel::Error),
        "fatal" => Ok(LogLevel::Fatal),
        other => Err(format!(
            "invalid log level {other:?}, expected one of: trace, debug, info, warning, error, fatal"
        )),
    }
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate (or load) this device's key and identity, then exit.
    Bootstrap,
    /// Run the long-lived daemon loop.
    Daemon,
}

/// Resolve the private key passphrase from `--passphrase-file`, reading
/// from stdin when the value is `-`.
pub fn read_passphrase(path: &str) -> std::io::Result<String> {
    use std::io::Read;
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf.trim_end().to_string())
    } else {
        Ok(std::fs::read_to_string(path)?.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parses_all_documented_values() {
        for (input, expected) in [
            ("trace", LogLevel::Trace),
            ("debug", LogLevel::Debug),
            ("info", LogLevel::Info),
            ("warning", LogLevel::Warning),
            ("error", LogLevel::Error),
            ("fatal", LogLevel::Fatal),
        ] {
            assert_eq!(parse_log_level(input).unwrap(), expected);
        }
        assert!(parse_log_level("bogus").is_err());
    }
}
