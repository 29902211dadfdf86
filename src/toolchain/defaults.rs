use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::ToolchainKind;

/// Built-in settings for a detected toolchain, before configuration
/// overrides are applied. Paths are relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub root: PathBuf,
    pub install: Option<Vec<String>>,
    pub install_skip_if: Option<String>,
    pub build: Option<Vec<String>>,
    pub build_artifacts: Vec<String>,
    pub caches: Vec<String>,
    pub dev: Option<Vec<String>>,
    pub ready_pattern: Option<String>,
    pub depends_on: Vec<ToolchainKind>,
}

fn owned(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Toolchains present in `root`, mapped to their relative roots.
pub fn detect(root: &Path) -> BTreeMap<ToolchainKind, PathBuf> {
    let mut found = BTreeMap::new();

    if root.join("package.json").is_file() {
        found.insert(ToolchainKind::Frontend, PathBuf::from("."));
    }

    if root.join("src-tauri").join("Cargo.toml").is_file() {
        found.insert(ToolchainKind::Backend, PathBuf::from("src-tauri"));
    } else if root.join("Cargo.toml").is_file() {
        found.insert(ToolchainKind::Backend, PathBuf::from("."));
    }

    let host_conf = ["tauri.conf.json", "src-tauri/tauri.conf.json"];
    if host_conf.iter().any(|conf| root.join(conf).is_file()) {
        // The host CLI is driven through the frontend's package scripts.
        found.insert(ToolchainKind::Host, PathBuf::from("."));
    }

    found
}

pub fn defaults(kind: ToolchainKind, root: PathBuf) -> Defaults {
    match kind {
        ToolchainKind::Frontend => Defaults {
            root,
            install: Some(owned(&["npm", "install"])),
            install_skip_if: Some("node_modules".into()),
            build: Some(owned(&["npm", "run", "build"])),
            build_artifacts: owned(&[".svelte-kit", "dist", "build"]),
            caches: owned(&["node_modules", "package-lock.json"]),
            dev: Some(owned(&["npm", "run", "dev"])),
            ready_pattern: Some("Local:".into()),
            depends_on: vec![],
        },
        ToolchainKind::Backend => Defaults {
            root,
            install: Some(owned(&["cargo", "fetch"])),
            install_skip_if: None,
            build: Some(owned(&["cargo", "build", "--release"])),
            build_artifacts: owned(&["target"]),
            caches: owned(&["Cargo.lock"]),
            dev: Some(owned(&["cargo", "watch", "-x", "build"])),
            ready_pattern: Some("Finished".into()),
            depends_on: vec![],
        },
        ToolchainKind::Host => Defaults {
            root,
            install: None,
            install_skip_if: None,
            build: Some(owned(&["npm", "run", "tauri", "build"])),
            build_artifacts: vec![],
            caches: vec![],
            dev: Some(owned(&["npm", "run", "tauri", "dev"])),
            ready_pattern: None,
            depends_on: vec![ToolchainKind::Backend, ToolchainKind::Frontend],
        },
    }
}
