//! Console logging plus the optional persistent output log.
//!
//! The console shows log events at the chosen level on stderr. The output log
//! appends debug-level events and every child output line to a file in the
//! state directory.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, anyhow};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::supervisor::output::OUTPUT_TARGET;

/// Install the global subscriber.
///
/// An invalid `level` is an error. A log file that cannot be opened is not:
/// logging goes on without it and the reason is handed back for the caller
/// to report.
pub fn init(level: &str, log_path: Option<&Path>) -> anyhow::Result<Option<anyhow::Error>> {
    let filter = match EnvFilter::try_from_env("DEVCTL_LOG") {
        Ok(filter) => filter,
        Err(_) => {
            let level = level
                .parse::<LevelFilter>()
                .map_err(|_| anyhow!("invalid log level: {level}"))?;
            EnvFilter::default().add_directive(level.into())
        }
    };
    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(filter);

    let (file, open_error) = match log_path.map(open_log).transpose() {
        Ok(file) => (file, None),
        Err(err) => (None, Some(err)),
    };
    let persistent = file.map(|file| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_filter(file_filter())
    });

    tracing_subscriber::registry()
        .with(console)
        .with(persistent)
        .init();
    Ok(open_error)
}

/// Child output at any level, everything else from debug up.
fn file_filter() -> Targets {
    Targets::new()
        .with_target(OUTPUT_TARGET, LevelFilter::TRACE)
        .with_default(LevelFilter::DEBUG)
}

fn open_log(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open output log {}", path.display()))
}
