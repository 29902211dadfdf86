use std::fs;
use std::io;
use std::path::Path;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::warn;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub command: String,
    pub timestamp: String,
}

/// Append `command` to the JSON history list at `path`.
///
/// A missing or corrupt history file starts a fresh list. The file is
/// replaced by rename, so readers never see a partial write.
pub fn record(path: &Path, command: &str) -> io::Result<()> {
    let mut entries = load(path);
    entries.push(HistoryEntry {
        command: command.to_string(),
        timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
    });

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(&entries)?;
    let mut staging = path.as_os_str().to_os_string();
    staging.push(format!(".{}.tmp", std::process::id()));
    fs::write(&staging, body)?;
    fs::rename(&staging, path)
}

pub fn load(path: &Path) -> Vec<HistoryEntry> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), "unreadable history, starting fresh: {err}");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&data) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %path.display(), "corrupt history, starting fresh: {err}");
            Vec::new()
        }
    }
}
