//! Workspace configuration: the optional `devctl.toml` and its resolution
//! over auto-detected toolchains and built-in defaults.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::inventory::{DEFAULT_IGNORE, ScanOptions};
use crate::supervisor::{Readiness, SupervisorSettings};
use crate::toolchain::defaults::{self, Defaults};
use crate::toolchain::{ToolchainDescriptor, ToolchainKind, clean};

pub const CONFIG_FILE: &str = "devctl.toml";
pub const DEFAULT_STATE_DIR: &str = ".devctl";
const DEFAULT_READY_AFTER_MS: u64 = 3_000;

/// On-disk configuration; every field is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    pub state_dir: Option<String>,
    pub history: Option<bool>,
    /// Append command output and log events to `<state_dir>/build.log`
    pub output_log: Option<bool>,
    pub inventory: InventoryConfig,
    pub supervisor: SupervisorConfig,
    pub toolchains: ToolchainsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct InventoryConfig {
    /// Replaces the built-in ignore set
    pub ignore: Option<Vec<String>>,
    /// Added to the ignore set
    pub extra_ignore: Vec<String>,
    pub respect_gitignore: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub startup_timeout_ms: Option<u64>,
    pub startup_attempts: Option<u32>,
    pub shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainsConfig {
    pub frontend: Option<ToolchainConfig>,
    pub backend: Option<ToolchainConfig>,
    pub host: Option<ToolchainConfig>,
}

impl ToolchainsConfig {
    fn get(&self, kind: ToolchainKind) -> Option<&ToolchainConfig> {
        match kind {
            ToolchainKind::Frontend => self.frontend.as_ref(),
            ToolchainKind::Backend => self.backend.as_ref(),
            ToolchainKind::Host => self.host.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainConfig {
    pub enabled: Option<bool>,
    pub root: Option<String>,
    pub install: Option<Vec<String>>,
    pub install_skip_if: Option<String>,
    pub build: Option<Vec<String>>,
    pub build_artifacts: Option<Vec<String>>,
    pub caches: Option<Vec<String>>,
    pub dev: Option<Vec<String>>,
    pub ready_pattern: Option<String>,
    pub ready_after_ms: Option<u64>,
    pub depends_on: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
}

/// Everything an invocation needs to know about the workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub history: bool,
    pub output_log: bool,
    pub scan: ScanOptions,
    pub supervisor: SupervisorSettings,
    /// In frontend, backend, host order
    pub toolchains: Vec<ToolchainDescriptor>,
}

impl Workspace {
    /// Load the workspace at `root`, reading `config_path` (or
    /// `<root>/devctl.toml` when present).
    pub fn load(root: &Path, config_path: Option<&Path>) -> anyhow::Result<Self> {
        if !root.is_dir() {
            return Err(Error::InvalidRoot(root.to_path_buf()).into());
        }
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to resolve root {}", root.display()))?;

        let config = match config_path {
            Some(path) => Some(load_config(path)?.ok_or_else(|| {
                anyhow!("config file {} does not exist", path.display())
            })?),
            None => load_config(&root.join(CONFIG_FILE))?,
        };

        let workspace = Self::resolve(root, config.unwrap_or_default())?;
        Ok(workspace)
    }

    pub fn resolve(root: PathBuf, config: WorkspaceConfig) -> Result<Self> {
        let state_name = config
            .state_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_STATE_DIR.to_string());
        check_relative("state_dir", &state_name, false)?;

        let scan = scan_options(&config.inventory, &state_name);
        let supervisor = supervisor_settings(&config.supervisor)?;
        let toolchains = resolve_toolchains(&root, &config.toolchains, supervisor.shutdown_grace)?;

        Ok(Self {
            state_dir: root.join(&state_name),
            history: config.history.unwrap_or(true),
            output_log: config.output_log.unwrap_or(true),
            scan,
            supervisor,
            toolchains,
            root,
        })
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("session.lock")
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join("history.json")
    }

    pub fn output_log_path(&self) -> Option<PathBuf> {
        self.output_log.then(|| self.state_dir.join("build.log"))
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Option<WorkspaceConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = toml::from_str(&data)
        .with_context(|| format!("failed to parse toml config {}", path.display()))?;
    Ok(Some(config))
}

fn scan_options(config: &InventoryConfig, state_name: &str) -> ScanOptions {
    let mut ignore: BTreeSet<String> = match &config.ignore {
        Some(names) => names.iter().cloned().collect(),
        None => DEFAULT_IGNORE.iter().map(|name| name.to_string()).collect(),
    };
    ignore.extend(config.extra_ignore.iter().cloned());

    // The tool's own state is never part of the inventory.
    if let Some(Component::Normal(first)) = Path::new(state_name)
        .components()
        .find(|c| !matches!(c, Component::CurDir))
    {
        ignore.insert(first.to_string_lossy().into_owned());
    }

    ScanOptions {
        ignore,
        respect_gitignore: config.respect_gitignore.unwrap_or(false),
        threads: 0,
    }
}

fn supervisor_settings(config: &SupervisorConfig) -> Result<SupervisorSettings> {
    let base = SupervisorSettings::default();
    let settings = SupervisorSettings {
        startup_timeout: config
            .startup_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(base.startup_timeout),
        startup_attempts: config.startup_attempts.unwrap_or(base.startup_attempts),
        shutdown_grace: config
            .shutdown_grace_ms
            .map(Duration::from_millis)
            .unwrap_or(base.shutdown_grace),
    };
    if settings.startup_attempts == 0 {
        return Err(Error::Config(
            "supervisor.startup_attempts must be at least 1".into(),
        ));
    }
    Ok(settings)
}

fn resolve_toolchains(
    root: &Path,
    config: &ToolchainsConfig,
    stop_grace: Duration,
) -> Result<Vec<ToolchainDescriptor>> {
    let detected = defaults::detect(root);

    let mut enabled = Vec::new();
    for kind in ToolchainKind::ALL {
        let overrides = config.get(kind);
        let wanted = match overrides.and_then(|c| c.enabled) {
            Some(flag) => flag,
            None => detected.contains_key(&kind) || overrides.is_some(),
        };
        if wanted {
            let rel_root = detected
                .get(&kind)
                .cloned()
                .unwrap_or_else(|| PathBuf::from("."));
            enabled.push((kind, defaults::defaults(kind, rel_root), overrides));
        }
    }

    let present: BTreeSet<ToolchainKind> = enabled.iter().map(|(kind, _, _)| *kind).collect();
    enabled
        .into_iter()
        .map(|(kind, base, overrides)| {
            let empty = ToolchainConfig::default();
            descriptor(root, kind, base, overrides.unwrap_or(&empty), &present, stop_grace)
        })
        .collect()
}

fn descriptor(
    root: &Path,
    kind: ToolchainKind,
    base: Defaults,
    config: &ToolchainConfig,
    present: &BTreeSet<ToolchainKind>,
    stop_grace: Duration,
) -> Result<ToolchainDescriptor> {
    let name = kind.name();
    let field = |f: &str| format!("toolchains.{name}.{f}");

    let rel_root = match &config.root {
        Some(value) => {
            check_relative(&field("root"), value, true)?;
            PathBuf::from(value)
        }
        None => base.root,
    };

    let install_skip_if = config.install_skip_if.clone().or(base.install_skip_if);
    if let Some(marker) = &install_skip_if {
        check_relative(&field("install_skip_if"), marker, false)?;
    }

    let install = config.install.clone().or(base.install);
    let build = config.build.clone().or(base.build);
    let dev = config.dev.clone().or(base.dev);
    for (label, argv) in [("install", &install), ("build", &build), ("dev", &dev)] {
        if argv.as_ref().is_some_and(|argv| argv.is_empty()) {
            return Err(Error::Config(format!("{} may not be empty", field(label))));
        }
    }

    let build_artifacts = config.build_artifacts.clone().unwrap_or(base.build_artifacts);
    let caches = config.caches.clone().unwrap_or(base.caches);
    for (label, targets) in [("build_artifacts", &build_artifacts), ("caches", &caches)] {
        for target in targets {
            clean::validate_target(target)
                .map_err(|reason| Error::Config(format!("{}: {reason}", field(label))))?;
        }
    }

    let readiness = match (&config.ready_pattern, config.ready_after_ms) {
        (Some(pattern), _) => Readiness::Marker(compile(&field("ready_pattern"), pattern)?),
        (None, Some(ms)) => Readiness::After(Duration::from_millis(ms)),
        (None, None) => match &base.ready_pattern {
            Some(pattern) => Readiness::Marker(compile(&field("ready_pattern"), pattern)?),
            None => Readiness::After(Duration::from_millis(DEFAULT_READY_AFTER_MS)),
        },
    };

    let depends_on = match &config.depends_on {
        Some(names) => names.clone(),
        None => base
            .depends_on
            .iter()
            .filter(|dep| present.contains(*dep))
            .map(|dep| dep.name().to_string())
            .collect(),
    };

    Ok(ToolchainDescriptor {
        name: name.to_string(),
        root: root.join(rel_root),
        install,
        install_skip_if: install_skip_if.map(PathBuf::from),
        build,
        build_artifacts,
        caches,
        dev,
        readiness,
        depends_on,
        env: config.env.clone(),
        stop_grace,
    })
}

fn compile(field: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("{field}: invalid pattern: {e}")))
}

/// Relative, without `..`; `allow_root` admits paths naming the base itself.
fn check_relative(field: &str, value: &str, allow_root: bool) -> Result<()> {
    let path = Path::new(value);
    if path.is_absolute() || path.has_root() {
        return Err(Error::Config(format!("{field}: `{value}` must be relative")));
    }
    let mut names = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => names += 1,
            Component::CurDir => {}
            _ => {
                return Err(Error::Config(format!(
                    "{field}: `{value}` may not leave the workspace"
                )));
            }
        }
    }
    if names == 0 && !allow_root {
        return Err(Error::Config(format!("{field}: `{value}` names the workspace root")));
    }
    Ok(())
}
