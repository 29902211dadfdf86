//! Removal of build artifacts and dependency caches.
//!
//! Directories are first renamed to a hidden sibling "trash" name and only
//! then deleted, so an interrupted clean never leaves a half-deleted tree
//! under the original name. Trash left behind by an interrupted run is swept
//! on the next clean.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;

pub const REMOVE_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);
const TRASH_MARKER: &str = ".devctl-trash-";

/// What a clean pass removed and what it could not.
#[derive(Debug, Default)]
pub struct CleanReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<Error>,
    /// The pass stopped early on a stop request
    pub cancelled: bool,
}

impl CleanReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    fn absorb(&mut self, other: CleanReport) {
        self.removed.extend(other.removed);
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
    }
}

pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// A clean target must stay inside the toolchain root: relative, no `..`,
/// and naming something below the root rather than the root itself.
pub fn validate_target(pattern: &str) -> std::result::Result<(), String> {
    let path = Path::new(pattern);
    if path.is_absolute() || path.has_root() {
        return Err(format!("`{pattern}` must be a relative path"));
    }
    let mut names = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => names += 1,
            Component::CurDir => {}
            _ => return Err(format!("`{pattern}` may not leave its root")),
        }
    }
    if names == 0 {
        return Err(format!("`{pattern}` names the root itself"));
    }
    if is_glob(pattern) {
        glob::Pattern::new(pattern).map_err(|e| format!("`{pattern}`: {e}"))?;
    }
    Ok(())
}

/// Remove every path or glob match of `patterns` below `root`.
///
/// Missing paths count as already clean. A failing path is recorded and the
/// remaining paths are still processed. A stop request ends the pass before
/// the next path.
pub fn clean_paths(root: &Path, patterns: &[String], cancel: &CancellationToken) -> CleanReport {
    let mut report = CleanReport::default();
    report.absorb(sweep_trash(root, patterns));

    for pattern in patterns {
        let targets = match expand(root, pattern) {
            Ok(targets) => targets,
            Err(err) => {
                report.failures.push(err);
                continue;
            }
        };
        for target in targets {
            if cancel.is_cancelled() {
                debug!(path = %target.display(), "clean stopped before this path");
                report.cancelled = true;
                return report;
            }
            match remove(&target) {
                Ok(true) => {
                    info!(path = %target.display(), "removed");
                    report.removed.push(target);
                }
                Ok(false) => debug!(path = %target.display(), "already clean"),
                Err(failure) => {
                    warn!(path = %failure.path.display(), "removal failed: {}", failure.source);
                    report.failures.push(Error::CleanFailed {
                        path: failure.path,
                        source: failure.source,
                    });
                }
            }
        }
    }
    report
}

fn expand(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, Error> {
    if !is_glob(pattern) {
        return Ok(vec![root.join(pattern)]);
    }

    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        pattern
    );
    let matches = glob::glob(&full).map_err(|e| Error::Config(format!("`{pattern}`: {e}")))?;
    let mut targets = Vec::new();
    for entry in matches {
        match entry {
            Ok(path) if !is_trash(&path) => targets.push(path),
            Ok(_) => {}
            Err(err) => {
                return Err(Error::CleanFailed {
                    path: err.path().to_path_buf(),
                    source: err.into(),
                });
            }
        }
    }
    Ok(targets)
}

/// A removal that failed, with the path left behind: the target itself, or
/// its trash name once the rename went through.
#[derive(Debug)]
struct RemoveFailure {
    path: PathBuf,
    source: io::Error,
}

/// Returns `Ok(false)` when there was nothing to remove.
fn remove(path: &Path) -> Result<bool, RemoveFailure> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(failed(path)(err)),
    };

    if meta.is_dir() {
        let trash = trash_path(path);
        with_retries(path, || fs::rename(path, &trash)).map_err(failed(path))?;
        with_retries(&trash, || fs::remove_dir_all(&trash)).map_err(failed(&trash))?;
    } else {
        with_retries(path, || fs::remove_file(path)).map_err(failed(path))?;
    }
    Ok(true)
}

fn failed(path: &Path) -> impl FnOnce(io::Error) -> RemoveFailure {
    let path = path.to_path_buf();
    move |source| RemoveFailure { path, source }
}

/// Run `op` up to [`REMOVE_ATTEMPTS`] times. `NotFound` means someone else
/// finished the job.
fn with_retries(path: &Path, mut op: impl FnMut() -> io::Result<()>) -> io::Result<()> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) if attempt < REMOVE_ATTEMPTS => {
                debug!(path = %path.display(), attempt, "removal failed, retrying: {err}");
                attempt += 1;
                thread::sleep(RETRY_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}

fn trash_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}{TRASH_MARKER}{}", std::process::id()))
}

fn is_trash(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.contains(TRASH_MARKER))
}

/// Remove trash left by an interrupted or failed clean in any directory a
/// target lives in. Trash is deleted in place, never renamed again.
fn sweep_trash(root: &Path, patterns: &[String]) -> CleanReport {
    let mut dirs = BTreeSet::new();
    dirs.insert(root.to_path_buf());
    for pattern in patterns {
        let Some(parent) = Path::new(pattern).parent() else {
            continue;
        };
        if !is_glob(&parent.to_string_lossy()) {
            dirs.insert(root.join(parent));
        }
    }

    let mut report = CleanReport::default();
    for dir in dirs {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_trash(&path) {
                continue;
            }
            let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
            let swept = with_retries(&path, || {
                if is_dir {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                }
            });
            match swept {
                Ok(()) => info!(path = %path.display(), "swept leftover trash"),
                Err(source) => {
                    warn!(path = %path.display(), "could not sweep trash: {source}");
                    report.failures.push(Error::CleanFailed { path, source });
                }
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("target/debug/deps")).unwrap();
        fs::write(dir.path().join("target/debug/deps/libapp.rlib"), b"x").unwrap();
        fs::write(dir.path().join("Cargo.lock"), b"# lock").unwrap();
        fs::write(dir.path().join("main.rs"), b"fn main() {}").unwrap();
        dir
    }

    #[test]
    fn removes_dirs_and_files_and_keeps_the_rest() {
        let dir = setup();
        let report = clean_paths(dir.path(), &["target".into(), "Cargo.lock".into()], &CancellationToken::new());
        assert!(report.is_clean());
        assert_eq!(report.removed.len(), 2);
        assert!(!dir.path().join("target").exists());
        assert!(!dir.path().join("Cargo.lock").exists());
        assert!(dir.path().join("main.rs").exists());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| is_trash(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn cleaning_twice_is_a_no_op() {
        let dir = setup();
        let patterns = vec!["target".to_string(), "missing-dir".to_string()];
        assert!(clean_paths(dir.path(), &patterns, &CancellationToken::new()).is_clean());
        let second = clean_paths(dir.path(), &patterns, &CancellationToken::new());
        assert!(second.is_clean());
        assert!(second.removed.is_empty());
    }

    #[test]
    fn globs_match_multiple_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.log"), b"").unwrap();
        fs::write(dir.path().join("b.log"), b"").unwrap();
        fs::write(dir.path().join("keep.txt"), b"").unwrap();
        let report = clean_paths(dir.path(), &["*.log".into()], &CancellationToken::new());
        assert!(report.is_clean());
        assert_eq!(report.removed.len(), 2);
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn leftover_trash_is_swept() {
        let dir = setup();
        let stale = dir.path().join(".target.devctl-trash-99999");
        fs::create_dir_all(stale.join("debug")).unwrap();
        fs::write(stale.join("debug/old"), b"x").unwrap();

        let report = clean_paths(dir.path(), &["target".into()], &CancellationToken::new());
        assert!(report.is_clean());
        assert!(!stale.exists());
        assert!(!dir.path().join("target").exists());
    }

    #[test]
    fn rejects_targets_outside_the_root() {
        assert!(validate_target("target").is_ok());
        assert!(validate_target("./dist").is_ok());
        assert!(validate_target("src-tauri/target").is_ok());
        assert!(validate_target("*.log").is_ok());
        assert!(validate_target("../elsewhere").is_err());
        assert!(validate_target("a/../../b").is_err());
        assert!(validate_target("/etc").is_err());
        assert!(validate_target(".").is_err());
        assert!(validate_target("[").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn failure_on_one_path_does_not_stop_the_others() {
        use std::os::unix::fs::PermissionsExt;

        if unsafe { libc::geteuid() } == 0 {
            // root ignores directory permissions
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("cache.bin"), b"x").unwrap();
        fs::write(dir.path().join("dist.txt"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        let report = clean_paths(dir.path(), &["locked/cache.bin".into(), "dist.txt".into()], &CancellationToken::new());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert!(matches!(&report.failures[0], Error::CleanFailed { path, .. } if path.ends_with("cache.bin")));
        assert!(!dir.path().join("dist.txt").exists());
    }

    #[test]
    fn stop_request_ends_the_pass() {
        let dir = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = clean_paths(dir.path(), &["target".into(), "Cargo.lock".into()], &cancel);
        assert!(report.cancelled);
        assert!(!report.is_clean());
        assert!(report.removed.is_empty());
        assert!(dir.path().join("target").exists());
        assert!(dir.path().join("Cargo.lock").exists());
    }

    #[cfg(unix)]
    #[test]
    fn partly_deleted_directory_is_reported_and_finished_next_time() {
        use std::os::unix::fs::PermissionsExt;

        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let dir = setup();
        let pinned = dir.path().join("target/debug/pinned");
        fs::create_dir_all(&pinned).unwrap();
        fs::write(pinned.join("app.bin"), b"x").unwrap();
        fs::set_permissions(&pinned, fs::Permissions::from_mode(0o555)).unwrap();

        let report = clean_paths(dir.path(), &["target".into()], &CancellationToken::new());
        assert!(!report.is_clean());
        assert!(report.removed.is_empty());
        assert_eq!(report.failures.len(), 1);
        let trash = match &report.failures[0] {
            Error::CleanFailed { path, .. } => path.clone(),
            other => panic!("expected CleanFailed, got {other:?}"),
        };
        assert!(is_trash(&trash));
        assert!(trash.exists());
        assert!(!dir.path().join("target").exists());

        fs::set_permissions(trash.join("debug/pinned"), fs::Permissions::from_mode(0o755)).unwrap();
        let second = clean_paths(dir.path(), &["target".into()], &CancellationToken::new());
        assert!(second.is_clean());
        assert!(!trash.exists());
    }
}
