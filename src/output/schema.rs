use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::inventory::language::Language;

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub path: String,
    pub language: Language,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blurb: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderRecord {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blurb: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LanguageTotals {
    pub files: u64,
    pub lines: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LanguageStats {
    totals: HashMap<Language, LanguageTotals>,
}

impl LanguageStats {
    pub fn record(&mut self, language: Language, lines: u64) {
        let entry = self.totals.entry(language).or_default();
        entry.files += 1;
        entry.lines += lines;
    }

    /// Fold another partial aggregate into this one.
    pub fn merge(&mut self, other: &LanguageStats) {
        for (language, totals) in &other.totals {
            let entry = self.totals.entry(*language).or_default();
            entry.files += totals.files;
            entry.lines += totals.lines;
        }
    }

    #[cfg(test)]
    pub fn get(&self, language: Language) -> LanguageTotals {
        self.totals.get(&language).copied().unwrap_or_default()
    }

    pub fn total_files(&self) -> u64 {
        self.totals.values().map(|t| t.files).sum()
    }

    /// Totals keyed by language tag, in tag order.
    pub fn by_tag(&self) -> BTreeMap<&'static str, LanguageTotals> {
        self.totals
            .iter()
            .map(|(language, totals)| (language.tag(), *totals))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct InventoryReport {
    pub root_name: String,
    pub folder_count: u64,
    pub total_file_count: u64,
    pub languages: LanguageStats,
    pub skipped: Vec<SkippedEntry>,
    pub files: Vec<FileRecord>,
    pub folders: Vec<FolderRecord>,
}

impl InventoryReport {
    pub fn summary(&self) -> InventorySummary {
        InventorySummary {
            folders: self.folder_count,
            files: FileTotals {
                total: self.total_file_count,
                by_type: self.languages.by_tag(),
            },
            skipped: self.skipped.clone(),
        }
    }
}

/// Machine-readable projection of an [`InventoryReport`].
#[derive(Debug, Clone, Serialize)]
pub struct InventorySummary {
    pub folders: u64,
    pub files: FileTotals,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileTotals {
    pub total: u64,
    pub by_type: BTreeMap<&'static str, LanguageTotals>,
}
