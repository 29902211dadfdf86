//! Uniform verbs over the workspace's package ecosystems.
//!
//! Each detected or configured toolchain is described once by a
//! [`ToolchainDescriptor`]; install, build, clean and dev-process creation
//! all read from it.

pub mod clean;
pub mod command;
pub mod defaults;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};
use crate::supervisor::{CommandLine, ProcessSpec, Readiness};

pub use clean::CleanReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolchainKind {
    Frontend,
    Backend,
    Host,
}

impl ToolchainKind {
    pub const ALL: [ToolchainKind; 3] = [
        ToolchainKind::Frontend,
        ToolchainKind::Backend,
        ToolchainKind::Host,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolchainKind::Frontend => "frontend",
            ToolchainKind::Backend => "backend",
            ToolchainKind::Host => "host",
        }
    }
}

impl fmt::Display for ToolchainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct ToolchainDescriptor {
    pub name: String,
    /// Absolute directory every command runs in
    pub root: PathBuf,
    pub install: Option<Vec<String>>,
    /// Install is skipped while this path (relative to `root`) exists
    pub install_skip_if: Option<PathBuf>,
    pub build: Option<Vec<String>>,
    pub build_artifacts: Vec<String>,
    pub caches: Vec<String>,
    pub dev: Option<Vec<String>>,
    pub readiness: Readiness,
    pub depends_on: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Grace period when a running command has to be stopped
    pub stop_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Skipped { marker: PathBuf },
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built,
    NotConfigured,
}

impl ToolchainDescriptor {
    fn command_line(&self, argv: &[String]) -> Result<CommandLine> {
        CommandLine::from_argv(argv, self.root.clone(), self.env.clone())
            .ok_or_else(|| Error::Config(format!("{}: empty command", self.name)))
    }

    pub async fn install(&self, force: bool, cancel: &CancellationToken) -> Result<InstallOutcome> {
        let Some(argv) = &self.install else {
            return Ok(InstallOutcome::NotConfigured);
        };
        if !force && let Some(marker) = &self.install_skip_if {
            let marker = self.root.join(marker);
            if marker.exists() {
                info!(toolchain = self.name.as_str(), marker = %marker.display(), "dependencies present; skipping install");
                return Ok(InstallOutcome::Skipped { marker });
            }
        }

        info!(toolchain = self.name.as_str(), "installing dependencies");
        let command = self.command_line(argv)?;
        let outcome = command::run_captured(&self.name, &command, cancel, self.stop_grace).await?;
        if !outcome.success() {
            return Err(Error::InstallFailed {
                toolchain: self.name.clone(),
                exit_code: outcome.exit_code,
                output: outcome.output(),
            });
        }
        Ok(InstallOutcome::Installed)
    }

    pub async fn build(&self, cancel: &CancellationToken) -> Result<BuildOutcome> {
        let Some(argv) = &self.build else {
            return Ok(BuildOutcome::NotConfigured);
        };

        info!(toolchain = self.name.as_str(), "building");
        let command = self.command_line(argv)?;
        let outcome = command::run_captured(&self.name, &command, cancel, self.stop_grace).await?;
        if !outcome.success() {
            return Err(Error::BuildFailed {
                toolchain: self.name.clone(),
                exit_code: outcome.exit_code,
                output: outcome.output(),
            });
        }
        Ok(BuildOutcome::Built)
    }

    pub fn clean_build_artifacts(&self, cancel: &CancellationToken) -> CleanReport {
        clean::clean_paths(&self.root, &self.build_artifacts, cancel)
    }

    pub fn clean_caches(&self, cancel: &CancellationToken) -> CleanReport {
        clean::clean_paths(&self.root, &self.caches, cancel)
    }

    /// The unstarted dev process, if this toolchain has one.
    pub fn dev_process(&self) -> Result<Option<ProcessSpec>> {
        let Some(argv) = &self.dev else {
            return Ok(None);
        };
        Ok(Some(ProcessSpec {
            name: self.name.clone(),
            command: self.command_line(argv)?,
            depends_on: self.depends_on.clone(),
            readiness: self.readiness.clone(),
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    /// A descriptor driven by `sh -c` scripts instead of real toolchains.
    pub(crate) fn scripted(name: &str, root: &Path) -> ToolchainDescriptor {
        ToolchainDescriptor {
            name: name.to_string(),
            root: root.to_path_buf(),
            install: None,
            install_skip_if: None,
            build: None,
            build_artifacts: vec![],
            caches: vec![],
            dev: None,
            readiness: Readiness::After(Duration::from_millis(50)),
            depends_on: vec![],
            env: BTreeMap::new(),
            stop_grace: Duration::from_millis(500),
        }
    }

    pub(crate) fn sh(script: &str) -> Option<Vec<String>> {
        Some(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[test]
    fn kinds_serialize_lowercase() {
        let json = serde_json::to_string(&ToolchainKind::ALL).unwrap();
        assert_eq!(json, r#"["frontend","backend","host"]"#);
        assert_eq!(ToolchainKind::Host.to_string(), "host");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_honours_skip_marker_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        let mut tc = scripted("frontend", dir.path());
        tc.install = sh("echo ran >> install.log");
        tc.install_skip_if = Some(PathBuf::from("node_modules"));
        let cancel = CancellationToken::new();

        let outcome = tc.install(false, &cancel).await.unwrap();
        assert!(matches!(outcome, InstallOutcome::Skipped { .. }));
        assert!(!dir.path().join("install.log").exists());

        let outcome = tc.install(true, &cancel).await.unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
        assert!(dir.path().join("install.log").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_install_carries_captured_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut tc = scripted("frontend", dir.path());
        tc.install = sh("echo 'npm ERR! code E404'; exit 1");

        let err = tc.install(false, &CancellationToken::new()).await.unwrap_err();
        match err {
            Error::InstallFailed {
                toolchain,
                exit_code,
                output,
            } => {
                assert_eq!(toolchain, "frontend");
                assert_eq!(exit_code, Some(1));
                assert!(output.contains("npm ERR! code E404"));
            }
            other => panic!("expected InstallFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_commands_are_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let tc = scripted("host", dir.path());
        let cancel = CancellationToken::new();
        assert_eq!(tc.install(false, &cancel).await.unwrap(), InstallOutcome::NotConfigured);
        assert_eq!(tc.build(&cancel).await.unwrap(), BuildOutcome::NotConfigured);
        assert!(tc.dev_process().unwrap().is_none());
    }

    #[test]
    fn dev_process_carries_dependencies_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut tc = scripted("host", dir.path());
        tc.dev = Some(vec!["npm".into(), "run".into(), "tauri".into(), "dev".into()]);
        tc.depends_on = vec!["backend".into()];
        tc.env.insert("RUST_LOG".into(), "debug".into());

        let spec = tc.dev_process().unwrap().unwrap();
        assert_eq!(spec.name, "host");
        assert_eq!(spec.depends_on, vec!["backend"]);
        assert_eq!(spec.command.cwd, dir.path());
        assert_eq!(spec.command.env["RUST_LOG"], "debug");
        assert_eq!(spec.command.display(), "npm run tauri dev");
    }

    #[test]
    fn cleans_use_their_own_path_sets() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("dist")).unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        let mut tc = scripted("frontend", dir.path());
        tc.build_artifacts = vec!["dist".into()];
        tc.caches = vec!["node_modules".into()];

        let cancel = CancellationToken::new();
        assert!(tc.clean_build_artifacts(&cancel).is_clean());
        assert!(!dir.path().join("dist").exists());
        assert!(dir.path().join("node_modules").exists());

        assert!(tc.clean_caches(&cancel).is_clean());
        assert!(!dir.path().join("node_modules").exists());
    }
}
