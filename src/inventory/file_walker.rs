use ignore::{DirEntry, ParallelVisitor, ParallelVisitorBuilder, WalkBuilder, WalkState};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Sender};

use tokio_util::sync::CancellationToken;

use crate::output::schema::{FileRecord, FolderRecord, LanguageStats, SkippedEntry};

use super::blurb::{file_blurb, readme_blurb};
use super::language::{Language, detect_language};

// Bytes of a file inspected for its leading comment
const BLURB_HEAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Entry names pruned from the walk (directories and files alike).
    pub ignore: BTreeSet<String>,
    pub respect_gitignore: bool,
    /// Walker threads; 0 lets the walker choose.
    pub threads: usize,
}

/// Results gathered by one walker thread.
#[derive(Debug, Default)]
pub struct Partial {
    pub files: Vec<FileRecord>,
    pub folders: Vec<FolderRecord>,
    pub skipped: Vec<SkippedEntry>,
    pub stats: LanguageStats,
}

impl Partial {
    fn merge(&mut self, other: Partial) {
        self.files.extend(other.files);
        self.folders.extend(other.folders);
        self.skipped.extend(other.skipped);
        self.stats.merge(&other.stats);
    }

    fn record_file(&mut self, record: FileRecord) {
        self.stats
            .record(record.language, record.lines.unwrap_or_default());
        self.files.push(record);
    }

    fn absorb(&mut self, root: &Path, entry: Result<DirEntry, ignore::Error>) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = error_path(&err)
                    .map(|p| relative_path(root, p))
                    .unwrap_or_else(|| "<unknown>".to_string());
                self.skipped.push(SkippedEntry {
                    path,
                    reason: err.to_string(),
                });
                return;
            }
        };
        if entry.depth() == 0 {
            return;
        }

        let path = entry.path();
        let relative = relative_path(root, path);
        let Some(file_type) = entry.file_type() else {
            return;
        };

        if file_type.is_dir() {
            self.folders.push(FolderRecord {
                path: relative,
                blurb: readme_blurb(path),
            });
            return;
        }

        // Links are listed but never followed
        if file_type.is_symlink() {
            self.record_file(FileRecord {
                path: relative,
                language: Language::Other,
                lines: None,
                blurb: None,
            });
            return;
        }
        if !file_type.is_file() {
            return;
        }

        let language = detect_language(path);
        if !language.is_counted() {
            self.record_file(FileRecord {
                path: relative,
                language,
                lines: None,
                blurb: None,
            });
            return;
        }

        match fs::read(path) {
            Ok(bytes) => {
                let head = &bytes[..bytes.len().min(BLURB_HEAD_BYTES)];
                let blurb = file_blurb(&String::from_utf8_lossy(head), language.comment_style());
                self.record_file(FileRecord {
                    path: relative,
                    language,
                    lines: Some(count_lines(&bytes)),
                    blurb,
                });
            }
            Err(err) => self.skipped.push(SkippedEntry {
                path: relative,
                reason: err.to_string(),
            }),
        }
    }
}

/// Newline-delimited line count; an unterminated last line still counts.
pub fn count_lines(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }
    let newlines = bytes.iter().filter(|&&b| b == b'\n').count() as u64;
    if bytes.last() == Some(&b'\n') {
        newlines
    } else {
        newlines + 1
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        _ => None,
    }
}

struct Collector<'s> {
    root: &'s Path,
    cancel: &'s CancellationToken,
    tx: Sender<Partial>,
}

impl<'s> ParallelVisitorBuilder<'s> for Collector<'s> {
    fn build(&mut self) -> Box<dyn ParallelVisitor + 's> {
        Box::new(Visitor {
            root: self.root,
            cancel: self.cancel,
            partial: Partial::default(),
            tx: self.tx.clone(),
        })
    }
}

struct Visitor<'s> {
    root: &'s Path,
    cancel: &'s CancellationToken,
    partial: Partial,
    tx: Sender<Partial>,
}

impl ParallelVisitor for Visitor<'_> {
    fn visit(&mut self, entry: Result<DirEntry, ignore::Error>) -> WalkState {
        if self.cancel.is_cancelled() {
            return WalkState::Quit;
        }
        self.partial.absorb(self.root, entry);
        WalkState::Continue
    }
}

impl Drop for Visitor<'_> {
    fn drop(&mut self) {
        let _ = self.tx.send(std::mem::take(&mut self.partial));
    }
}

/// Entries seen after `cancel` fires are dropped; the caller checks the
/// token to tell a short walk from a complete one.
pub fn walk_directory(root: &Path, options: &ScanOptions, cancel: &CancellationToken) -> Partial {
    let ignored = options.ignore.clone();
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .git_ignore(options.respect_gitignore)
        .git_global(options.respect_gitignore)
        .git_exclude(options.respect_gitignore)
        .follow_links(false)
        .threads(options.threads)
        .filter_entry(move |entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| ignored.contains(name))
        })
        .build_parallel();

    let (tx, rx) = mpsc::channel();
    let mut collector = Collector { root, cancel, tx };
    walker.visit(&mut collector);
    drop(collector);

    rx.into_iter().fold(Partial::default(), |mut acc, partial| {
        acc.merge(partial);
        acc
    })
}
