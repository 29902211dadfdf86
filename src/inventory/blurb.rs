use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use super::language::CommentStyle;

const MAX_BLURB_CHARS: usize = 60;

// Only the head of a file is searched for its leading comment
const SCAN_LINES: usize = 12;

const README_NAMES: &[&str] = &["README.md", "README", "Readme.md", "readme.md"];

static LEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:/{2,}!?|/\*+!?|\*+/?|#+!?|<!--|"""|''')\s*"#).unwrap()
});

static TRAILER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\s*(?:\*+/|-->|"""|''')\s*$"#).unwrap());

static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#+\s*").unwrap());

enum Marker {
    Line,
    Block { open: &'static str, close: &'static str },
}

fn leading_marker(style: CommentStyle, line: &str) -> Option<Marker> {
    let blocks: &[(&'static str, &'static str)] = match style {
        CommentStyle::Slash | CommentStyle::Block => &[("/*", "*/")],
        CommentStyle::Hash => &[("\"\"\"", "\"\"\""), ("'''", "'''")],
        CommentStyle::Markup => &[("<!--", "-->")],
        CommentStyle::None => &[],
    };
    for &(open, close) in blocks {
        if line.starts_with(open) {
            return Some(Marker::Block { open, close });
        }
    }
    let line_prefix = match style {
        CommentStyle::Slash => Some("//"),
        CommentStyle::Hash => Some("#"),
        _ => None,
    };
    line_prefix
        .filter(|prefix| line.starts_with(prefix))
        .map(|_| Marker::Line)
}

fn clean_text(line: &str) -> String {
    let without_leader = LEADER.replace(line, "");
    TRAILER.replace(&without_leader, "").trim().to_string()
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_BLURB_CHARS {
        return text.to_string();
    }
    let mut short: String = text.chars().take(MAX_BLURB_CHARS - 1).collect();
    short.push('…');
    short
}

/// First line of the leading comment of a source file, if the file opens with one.
pub fn file_blurb(content: &str, style: CommentStyle) -> Option<String> {
    if style == CommentStyle::None {
        return None;
    }

    let mut open_block: Option<&'static str> = None;
    for (idx, raw) in content.lines().take(SCAN_LINES).enumerate() {
        let line = raw.trim();
        if line.is_empty() || (idx == 0 && line.starts_with("#!")) {
            continue;
        }

        match open_block {
            Some(close) => {
                if line.contains(close) {
                    open_block = None;
                }
            }
            None => match leading_marker(style, line)? {
                Marker::Line => {}
                Marker::Block { open, close } => {
                    if !line[open.len()..].contains(close) {
                        open_block = Some(close);
                    }
                }
            },
        }

        let text = clean_text(line);
        if text.chars().any(char::is_alphanumeric) {
            return Some(truncate(&text));
        }
    }
    None
}

/// First non-empty line of a README colocated in `dir`.
pub fn readme_blurb(dir: &Path) -> Option<String> {
    README_NAMES.iter().find_map(|name| {
        let content = fs::read_to_string(dir.join(name)).ok()?;
        content
            .lines()
            .map(|line| HEADING.replace(line.trim(), "").trim().to_string())
            .find(|line| !line.is_empty())
            .map(|line| truncate(&line))
    })
}
