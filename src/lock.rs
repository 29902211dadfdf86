use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::supervisor::signal;

const ACQUIRE_ATTEMPTS: u32 = 5;
const TAKEOVER_BACKOFF: Duration = Duration::from_millis(20);
/// A takeover marker older than this was left by a crashed process.
const TAKEOVER_EXPIRY: Duration = Duration::from_secs(10);

/// Contents of the session marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub mode: String,
    pub acquired_at: DateTime<Local>,
}

/// Exclusive hold on a workspace for one mutating invocation.
///
/// The marker file is removed when the guard is dropped.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn acquire(path: &Path, mode: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            mode: mode.to_string(),
            acquired_at: Local::now(),
        };

        for _ in 0..ACQUIRE_ATTEMPTS {
            match try_create(path, &info) {
                Ok(()) => {
                    debug!(path = %path.display(), mode, "workspace lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }

            let raw = match fs::read(path) {
                Ok(raw) => raw,
                // Released between our create and read
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let Ok(held) = serde_json::from_slice::<LockInfo>(&raw) else {
                return Err(busy(path, None));
            };
            if signal::is_alive(held.pid) {
                return Err(busy(path, Some(held.pid)));
            }

            warn!(
                pid = held.pid,
                mode = held.mode.as_str(),
                "replacing stale workspace lock"
            );
            replace_stale(path, &raw)?;
        }

        Err(busy(path, holder(path).map(|held| held.pid)))
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), "failed to release workspace lock: {err}");
        }
    }
}

/// The current holder of the marker at `path`, if it can be read.
pub fn holder(path: &Path) -> Option<LockInfo> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn busy(path: &Path, pid: Option<u32>) -> Error {
    Error::WorkspaceBusy {
        marker: path.to_path_buf(),
        pid,
    }
}

fn try_create(path: &Path, info: &LockInfo) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let body = serde_json::to_vec_pretty(info)?;
    file.write_all(&body)?;
    file.sync_all()
}

/// Remove the marker at `path` if it still holds exactly `stale`.
///
/// Only the process holding the takeover marker may remove a stale lock, and
/// it re-reads the marker first. A dead holder never rewrites its marker, so
/// a match means nobody else has taken the workspace in the meantime.
fn replace_stale(path: &Path, stale: &[u8]) -> io::Result<()> {
    let Some(_takeover) = Takeover::claim(path)? else {
        thread::sleep(TAKEOVER_BACKOFF);
        return Ok(());
    };
    match fs::read(path) {
        Ok(current) if current == stale => match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        },
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Short-lived marker serialising stale-lock replacement.
struct Takeover {
    path: PathBuf,
}

impl Takeover {
    fn claim(lock: &Path) -> io::Result<Option<Self>> {
        let mut name = lock.file_name().unwrap_or_default().to_os_string();
        name.push(".takeover");
        let path = lock.with_file_name(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Self { path })),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let expired = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .is_some_and(|age| age > TAKEOVER_EXPIRY);
                if expired {
                    warn!(path = %path.display(), "removing abandoned takeover marker");
                    let _ = fs::remove_file(&path);
                }
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for Takeover {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
