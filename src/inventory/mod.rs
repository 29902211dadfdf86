pub mod blurb;
pub mod file_walker;
pub mod language;

use std::path::Path;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::output::schema::InventoryReport;

pub use file_walker::ScanOptions;

/// Dependency caches, version-control metadata and build outputs.
pub const DEFAULT_IGNORE: &[&str] = &[
    ".git",
    ".svelte-kit",
    ".vscode",
    "__pycache__",
    "build",
    "build.log",
    "Cargo.lock",
    "dist",
    "dox",
    "node_modules",
    "package-lock.json",
    "target",
    "venv",
];

/// Walk `root` into a sorted inventory. A stop request aborts the walk with
/// [`Error::Cancelled`].
pub fn scan(
    root: &Path,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<InventoryReport> {
    if !root.is_dir() {
        return Err(Error::InvalidRoot(root.to_path_buf()));
    }
    let start = Instant::now();

    let mut partial = file_walker::walk_directory(root, options, cancel);
    if cancel.is_cancelled() {
        debug!(files = partial.files.len(), "inventory scan stopped");
        return Err(Error::Cancelled);
    }
    partial.files.sort_by(|a, b| a.path.cmp(&b.path));
    partial.folders.sort_by(|a, b| a.path.cmp(&b.path));
    partial.skipped.sort_by(|a, b| a.path.cmp(&b.path));

    let root_name = root
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| root.display().to_string());

    let report = InventoryReport {
        root_name,
        folder_count: partial.folders.len() as u64,
        total_file_count: partial.files.len() as u64,
        languages: partial.stats,
        skipped: partial.skipped,
        files: partial.files,
        folders: partial.folders,
    };

    debug_assert_eq!(report.languages.total_files(), report.total_file_count);
    debug!(
        folders = report.folder_count,
        files = report.total_file_count,
        skipped = report.skipped.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "inventory scan finished"
    );
    Ok(report)
}
