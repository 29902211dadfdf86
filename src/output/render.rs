use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::Result;

use super::schema::{FileRecord, InventoryReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Tree,
    Summary,
}

pub fn render(report: &InventoryReport, mode: RenderMode) -> Result<String> {
    match mode {
        RenderMode::Tree => Ok(render_tree(report)),
        RenderMode::Summary => Ok(serde_json::to_string_pretty(&report.summary())?),
    }
}

// Case-insensitive order, exact name as tie-break
type SortKey = (String, String);

fn sort_key(name: &str) -> SortKey {
    (name.to_lowercase(), name.to_string())
}

#[derive(Default)]
struct DirNode<'a> {
    blurb: Option<&'a str>,
    dirs: BTreeMap<SortKey, DirNode<'a>>,
    files: BTreeMap<SortKey, &'a FileRecord>,
}

impl<'a> DirNode<'a> {
    fn descend(&mut self, segments: &[&str]) -> &mut DirNode<'a> {
        let mut node = self;
        for segment in segments {
            node = node.dirs.entry(sort_key(segment)).or_default();
        }
        node
    }
}

fn build_tree(report: &InventoryReport) -> DirNode<'_> {
    let mut root = DirNode::default();
    for folder in &report.folders {
        let segments: Vec<&str> = folder.path.split('/').collect();
        root.descend(&segments).blurb = folder.blurb.as_deref();
    }
    for file in &report.files {
        let segments: Vec<&str> = file.path.split('/').collect();
        let Some((name, parents)) = segments.split_last() else {
            continue;
        };
        root.descend(parents).files.insert(sort_key(name), file);
    }
    root
}

fn render_node(node: &DirNode<'_>, prefix: &str, out: &mut String) {
    let total = node.dirs.len() + node.files.len();
    let mut index = 0;

    for ((_, name), child) in &node.dirs {
        index += 1;
        let last = index == total;
        let connector = if last { "└── " } else { "├── " };
        let _ = write!(out, "{prefix}{connector}{name}/");
        if let Some(blurb) = child.blurb {
            let _ = write!(out, "  # {blurb}");
        }
        out.push('\n');
        let extension = if last { "    " } else { "│   " };
        render_node(child, &format!("{prefix}{extension}"), out);
    }

    for ((_, name), file) in &node.files {
        index += 1;
        let connector = if index == total { "└── " } else { "├── " };
        let _ = write!(out, "{prefix}{connector}{name}");
        if let Some(lines) = file.lines {
            let _ = write!(out, " :: {lines} lines");
        }
        if let Some(blurb) = &file.blurb {
            let _ = write!(out, "  # {blurb}");
        }
        out.push('\n');
    }
}

fn render_tree(report: &InventoryReport) -> String {
    let tree = build_tree(report);
    let mut out = format!("{}/\n", report.root_name);
    render_node(&tree, "", &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::language::Language;
    use crate::output::schema::{FolderRecord, LanguageStats, SkippedEntry};

    fn file(path: &str, language: Language, lines: Option<u64>, blurb: Option<&str>) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            language,
            lines,
            blurb: blurb.map(str::to_string),
        }
    }

    fn sample() -> InventoryReport {
        let files = vec![
            file("README.md", Language::Other, None, None),
            file("src/main.rs", Language::Rust, Some(15), Some("Backend entry point")),
            file("src/App.svelte", Language::Svelte, Some(40), None),
            file("src/lib/Panel.svelte", Language::Svelte, Some(12), None),
            file("mgr.py", Language::Python, Some(588), None),
        ];
        let mut languages = LanguageStats::default();
        for f in &files {
            languages.record(f.language, f.lines.unwrap_or_default());
        }
        InventoryReport {
            root_name: "app".into(),
            folder_count: 3,
            total_file_count: files.len() as u64,
            languages,
            skipped: vec![],
            files,
            folders: vec![
                FolderRecord { path: "src".into(), blurb: Some("Sources".into()) },
                FolderRecord { path: "src/lib".into(), blurb: None },
                FolderRecord { path: "assets".into(), blurb: None },
            ],
        }
    }

    #[test]
    fn tree_lists_dirs_first_with_annotations() {
        let text = render(&sample(), RenderMode::Tree).unwrap();
        let expected = "\
app/
├── assets/
├── src/  # Sources
│   ├── lib/
│   │   └── Panel.svelte :: 12 lines
│   ├── App.svelte :: 40 lines
│   └── main.rs :: 15 lines  # Backend entry point
├── mgr.py :: 588 lines
└── README.md
";
        assert_eq!(text, expected);
    }

    #[test]
    fn summary_is_sorted_json_of_counts() {
        let text = render(&sample(), RenderMode::Summary).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["folders"], 3);
        assert_eq!(value["files"]["total"], 5);
        assert_eq!(value["files"]["by_type"]["Svelte"]["files"], 2);
        assert_eq!(value["files"]["by_type"]["Svelte"]["lines"], 52);
        assert_eq!(value["files"]["by_type"]["Other"]["lines"], 0);
        assert!(value.get("skipped").is_none());

        let keys: Vec<_> = value["files"]["by_type"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(keys, vec!["Other", "Python", "Rust", "Svelte"]);
    }

    #[test]
    fn summary_reports_skips() {
        let mut report = sample();
        report.skipped.push(SkippedEntry {
            path: "secret.rs".into(),
            reason: "Permission denied".into(),
        });
        let text = render(&report, RenderMode::Summary).unwrap();
        assert!(text.contains("\"secret.rs\""));
    }

    #[test]
    fn rendering_is_deterministic() {
        let report = sample();
        for mode in [RenderMode::Tree, RenderMode::Summary] {
            assert_eq!(render(&report, mode).unwrap(), render(&report, mode).unwrap());
        }
    }
}
