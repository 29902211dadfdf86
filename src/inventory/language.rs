use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Language {
    Python,
    JupyterNotebook,
    Rust,
    JavaScript,
    TypeScript,
    C,
    Cpp,
    CHeader,
    Java,
    Html,
    Css,
    Shell,
    Svelte,
    Other,
}

/// How a language writes line comments, used for documentation blurbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentStyle {
    Slash,
    Hash,
    Markup,
    Block,
    None,
}

impl Language {
    pub fn tag(self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::JupyterNotebook => "Jupyter Notebook",
            Language::Rust => "Rust",
            Language::JavaScript => "JavaScript",
            Language::TypeScript => "TypeScript",
            Language::C => "C",
            Language::Cpp => "C++",
            Language::CHeader => "C/C++ Header",
            Language::Java => "Java",
            Language::Html => "HTML",
            Language::Css => "CSS",
            Language::Shell => "Shell Script",
            Language::Svelte => "Svelte",
            Language::Other => "Other",
        }
    }

    /// Recognized languages are read and line-counted; `Other` is only listed.
    pub fn is_counted(self) -> bool {
        self != Language::Other
    }

    pub fn comment_style(self) -> CommentStyle {
        match self {
            Language::Rust
            | Language::JavaScript
            | Language::TypeScript
            | Language::C
            | Language::Cpp
            | Language::CHeader
            | Language::Java => CommentStyle::Slash,
            Language::Python | Language::Shell => CommentStyle::Hash,
            Language::Html | Language::Svelte => CommentStyle::Markup,
            Language::Css => CommentStyle::Block,
            Language::JupyterNotebook | Language::Other => CommentStyle::None,
        }
    }
}

pub fn detect_language(path: &Path) -> Language {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return Language::Other;
    };
    match ext.to_ascii_lowercase().as_str() {
        "py" => Language::Python,
        "ipynb" => Language::JupyterNotebook,
        "rs" => Language::Rust,
        "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
        "ts" | "tsx" => Language::TypeScript,
        "c" => Language::C,
        "cpp" | "cc" | "cxx" => Language::Cpp,
        "h" | "hpp" => Language::CHeader,
        "java" => Language::Java,
        "html" | "htm" => Language::Html,
        "css" => Language::Css,
        "sh" => Language::Shell,
        "svelte" => Language::Svelte,
        _ => Language::Other,
    }
}
