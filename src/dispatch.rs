//! Mode dispatch: runs one invocation against a loaded [`Workspace`].

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Workspace;
use crate::error::{Error, Result};
use crate::lock::{self, WorkspaceLock};
use crate::output::{self, RenderMode};
use crate::supervisor::{self, Supervisor, signal};
use crate::toolchain::{BuildOutcome, CleanReport, InstallOutcome, ToolchainDescriptor};
use crate::{history, inventory};

const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Init,
    Tree,
    Build,
    CleanBuild,
    CleanDeps,
    Dev,
    Stop,
}

impl Mode {
    pub fn name(self) -> &'static str {
        match self {
            Mode::Init => "init",
            Mode::Tree => "tree",
            Mode::Build => "build",
            Mode::CleanBuild => "clean-build",
            Mode::CleanDeps => "clean-deps",
            Mode::Dev => "dev",
            Mode::Stop => "stop",
        }
    }

    /// Modes that leave build and cache directories alone run without the
    /// workspace lock.
    pub fn needs_lock(self) -> bool {
        !matches!(self, Mode::Tree | Mode::Stop)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Reinstall even when the skip marker exists
    pub force: bool,
    /// Tree mode: also write the summary JSON here
    pub summary_out: Option<PathBuf>,
    /// Command line appended to the history once the run may proceed
    pub invocation: Option<String>,
}

pub async fn dispatch(
    workspace: &Workspace,
    mode: Mode,
    options: &DispatchOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let _lock = if mode.needs_lock() {
        Some(WorkspaceLock::acquire(&workspace.lock_path(), mode.name())?)
    } else {
        None
    };

    if workspace.history
        && let Some(command) = &options.invocation
        && let Err(err) = history::record(&workspace.history_path(), command)
    {
        warn!("could not record command history: {err}");
    }

    if workspace.toolchains.is_empty() && !matches!(mode, Mode::Tree | Mode::Stop) {
        warn!(root = %workspace.root.display(), "no toolchains detected or configured");
    }

    match mode {
        Mode::Tree => tree(workspace, options, cancel),
        Mode::Init => init(workspace, options.force, cancel).await,
        Mode::Build => build(workspace, cancel).await,
        Mode::CleanBuild => clean(workspace, ToolchainDescriptor::clean_build_artifacts, cancel),
        Mode::CleanDeps => clean(workspace, ToolchainDescriptor::clean_caches, cancel),
        Mode::Dev => dev(workspace, cancel).await,
        Mode::Stop => stop(workspace).await,
    }
}

fn tree(workspace: &Workspace, options: &DispatchOptions, cancel: &CancellationToken) -> Result<()> {
    let report = inventory::scan(&workspace.root, &workspace.scan, cancel)?;
    for skipped in &report.skipped {
        warn!(path = skipped.path.as_str(), "skipped: {}", skipped.reason);
    }

    println!("{}", output::render(&report, RenderMode::Summary)?);
    println!();
    print!("{}", output::render(&report, RenderMode::Tree)?);

    if let Some(path) = &options.summary_out {
        output::writer::write_json(&report.summary(), path)?;
        info!(path = %path.display(), "summary written");
    }
    Ok(())
}

async fn init(workspace: &Workspace, force: bool, cancel: &CancellationToken) -> Result<()> {
    let mut failures = Vec::new();
    for toolchain in &workspace.toolchains {
        match toolchain.install(force, cancel).await {
            Ok(InstallOutcome::Installed) => {
                info!(toolchain = toolchain.name.as_str(), "dependencies installed");
            }
            Ok(InstallOutcome::Skipped { .. }) => {}
            Ok(InstallOutcome::NotConfigured) => {
                info!(toolchain = toolchain.name.as_str(), "no install step");
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                warn!("{err}");
                failures.push(err);
            }
        }
    }
    into_result(failures)
}

async fn build(workspace: &Workspace, cancel: &CancellationToken) -> Result<()> {
    let nodes: Vec<(&str, &[String])> = workspace
        .toolchains
        .iter()
        .map(|t| (t.name.as_str(), t.depends_on.as_slice()))
        .collect();
    let (_, order) = supervisor::resolve_order(&nodes)?;

    for id in order {
        let toolchain = &workspace.toolchains[id];
        if toolchain.build(cancel).await? == BuildOutcome::Built {
            info!(toolchain = toolchain.name.as_str(), "build finished");
        }
    }
    Ok(())
}

fn clean(
    workspace: &Workspace,
    step: fn(&ToolchainDescriptor, &CancellationToken) -> CleanReport,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut failures = Vec::new();
    for toolchain in &workspace.toolchains {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let report = step(toolchain, cancel);
        if report.cancelled {
            return Err(Error::Cancelled);
        }
        if report.is_clean() {
            info!(
                toolchain = toolchain.name.as_str(),
                removed = report.removed.len(),
                "clean finished"
            );
        } else {
            warn!(
                toolchain = toolchain.name.as_str(),
                removed = report.removed.len(),
                failed = report.failures.len(),
                "clean finished with failures"
            );
        }
        failures.extend(report.failures);
    }
    into_result(failures)
}

async fn dev(workspace: &Workspace, cancel: &CancellationToken) -> Result<()> {
    let mut specs = Vec::new();
    for toolchain in &workspace.toolchains {
        if let Some(spec) = toolchain.dev_process()? {
            specs.push(spec);
        }
    }
    if specs.is_empty() {
        return Err(Error::Config("no dev processes to run".into()));
    }

    let mut session = Supervisor::new(specs, workspace.supervisor)?;
    let result = session.run(cancel).await;
    for process in session.processes() {
        info!(
            toolchain = process.name(),
            state = %process.state,
            attempts = process.attempts,
            last_exit = process.last_exit,
            "final state"
        );
    }
    result
}

/// Signal the process holding the workspace and wait for it to let go.
async fn stop(workspace: &Workspace) -> Result<()> {
    let marker = workspace.lock_path();
    let Some(held) = lock::holder(&marker) else {
        if marker.exists() {
            warn!(marker = %marker.display(), "session marker is unreadable; nothing signalled");
        } else {
            info!("no session running");
        }
        return Ok(());
    };
    if !signal::is_alive(held.pid) {
        info!(pid = held.pid, "session holder is already gone");
        return Ok(());
    }

    info!(pid = held.pid, mode = held.mode.as_str(), "stopping session");
    signal::request_stop(held.pid)?;

    // Teardown stops each toolchain in turn, each within the grace period.
    let processes = workspace.toolchains.len().max(1) as u32;
    let deadline = Instant::now() + workspace.supervisor.shutdown_grace * (processes + 1);
    while signal::is_alive(held.pid) && marker.exists() {
        if Instant::now() >= deadline {
            return Err(Error::StopTimedOut { pid: held.pid });
        }
        tokio::time::sleep(STOP_POLL).await;
    }
    debug!(pid = held.pid, "session released the workspace");
    Ok(())
}

fn into_result(mut failures: Vec<Error>) -> Result<()> {
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        _ => Err(Error::Failures(failures)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::toolchain::tests::{scripted, sh};
    use std::fs;
    use std::path::Path;

    fn workspace(root: &Path, toolchains: Vec<ToolchainDescriptor>) -> Workspace {
        let mut ws = Workspace::resolve(root.to_path_buf(), WorkspaceConfig::default()).unwrap();
        ws.toolchains = toolchains;
        ws
    }

    #[tokio::test]
    async fn init_aggregates_install_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut frontend = scripted("frontend", dir.path());
        frontend.install = sh("echo 'npm ERR!'; exit 1");
        let mut backend = scripted("backend", dir.path());
        backend.install = sh("echo ok > backend.installed");
        let mut host = scripted("host", dir.path());
        host.install = sh("exit 2");
        let ws = workspace(dir.path(), vec![frontend, backend, host]);

        let err = dispatch(&ws, Mode::Init, &DispatchOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            Error::Failures(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(matches!(&errors[0], Error::InstallFailed { toolchain, .. } if toolchain == "frontend"));
                assert!(matches!(&errors[1], Error::InstallFailed { toolchain, exit_code: Some(2), .. } if toolchain == "host"));
            }
            other => panic!("expected Failures, got {other:?}"),
        }
        assert_eq!(err.exit_code(), 1);
        assert!(dir.path().join("backend.installed").exists());
        assert!(!ws.lock_path().exists());
    }

    #[tokio::test]
    async fn build_stops_at_first_failure_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = scripted("host", dir.path());
        host.build = sh("touch host.built");
        host.depends_on = vec!["backend".into()];
        let mut backend = scripted("backend", dir.path());
        backend.build = sh("echo 'error[E0425]'; exit 101");
        let ws = workspace(dir.path(), vec![host, backend]);

        let err = dispatch(&ws, Mode::Build, &DispatchOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BuildFailed { ref toolchain, exit_code: Some(101), .. } if toolchain == "backend"));
        assert!(err.diagnostic().contains("error[E0425]"));
        assert!(!dir.path().join("host.built").exists());
    }

    #[tokio::test]
    async fn clean_build_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("target/release")).unwrap();
        fs::create_dir_all(dir.path().join("dist/assets")).unwrap();
        fs::write(dir.path().join("src.rs"), "fn main() {}").unwrap();
        let mut backend = scripted("backend", dir.path());
        backend.build_artifacts = vec!["target".into()];
        let mut frontend = scripted("frontend", dir.path());
        frontend.build_artifacts = vec!["dist".into(), ".svelte-kit".into()];
        let ws = workspace(dir.path(), vec![frontend, backend]);
        let cancel = CancellationToken::new();

        dispatch(&ws, Mode::CleanBuild, &DispatchOptions::default(), &cancel).await.unwrap();
        dispatch(&ws, Mode::CleanBuild, &DispatchOptions::default(), &cancel).await.unwrap();
        assert!(!dir.path().join("target").exists());
        assert!(!dir.path().join("dist").exists());
        assert!(dir.path().join("src.rs").exists());
    }

    #[tokio::test]
    async fn busy_workspace_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut frontend = scripted("frontend", dir.path());
        frontend.dev = sh("touch dev.started; sleep 30");
        let ws = workspace(dir.path(), vec![frontend]);

        let _held = WorkspaceLock::acquire(&ws.lock_path(), "dev").unwrap();
        let err = dispatch(&ws, Mode::Dev, &DispatchOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkspaceBusy { .. }));
        assert_eq!(err.exit_code(), 3);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!dir.path().join("dev.started").exists());
    }

    #[tokio::test]
    async fn tree_runs_while_the_workspace_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();
        let ws = workspace(dir.path(), vec![]);
        let summary = dir.path().join("out/summary.json");

        let _held = WorkspaceLock::acquire(&ws.lock_path(), "dev").unwrap();
        let options = DispatchOptions {
            summary_out: Some(summary.clone()),
            ..DispatchOptions::default()
        };
        dispatch(&ws, Mode::Tree, &options, &CancellationToken::new()).await.unwrap();

        let value: serde_json::Value = serde_json::from_slice(&fs::read(&summary).unwrap()).unwrap();
        assert_eq!(value["files"]["by_type"]["Python"]["lines"], 1);
        // The state directory holding the lock is not inventoried.
        assert_eq!(value["folders"], 0);
    }

    #[tokio::test]
    async fn dev_session_stops_cleanly_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mut frontend = scripted("frontend", dir.path());
        frontend.dev = sh("echo started; sleep 30");
        let ws = workspace(dir.path(), vec![frontend]);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(400)).await;
            stopper.cancel();
        });
        dispatch(&ws, Mode::Dev, &DispatchOptions::default(), &cancel).await.unwrap();
        assert!(!ws.lock_path().exists());
    }

    #[tokio::test]
    async fn cancelled_install_is_reported_as_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut frontend = scripted("frontend", dir.path());
        frontend.install = sh("sleep 30");
        let mut backend = scripted("backend", dir.path());
        backend.install = sh("touch backend.installed");
        let ws = workspace(dir.path(), vec![frontend, backend]);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            stopper.cancel();
        });
        let err = dispatch(&ws, Mode::Init, &DispatchOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 130);
        assert!(!dir.path().join("backend.installed").exists());
    }

    #[tokio::test]
    async fn stopped_clean_and_tree_exit_as_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("target/release")).unwrap();
        fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();
        let mut backend = scripted("backend", dir.path());
        backend.build_artifacts = vec!["target".into()];
        let ws = workspace(dir.path(), vec![backend]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = dispatch(&ws, Mode::CleanBuild, &DispatchOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 130);
        assert!(dir.path().join("target/release").exists());

        let err = dispatch(&ws, Mode::Tree, &DispatchOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn history_is_recorded_only_once_the_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path(), vec![]);
        let options = DispatchOptions {
            invocation: Some("devctl -c".into()),
            ..DispatchOptions::default()
        };

        let held = WorkspaceLock::acquire(&ws.lock_path(), "dev").unwrap();
        let err = dispatch(&ws, Mode::CleanBuild, &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkspaceBusy { .. }));
        assert!(history::load(&ws.history_path()).is_empty());

        drop(held);
        dispatch(&ws, Mode::CleanBuild, &options, &CancellationToken::new()).await.unwrap();
        let entries = history::load(&ws.history_path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].command, "devctl -c");
    }

    #[tokio::test]
    async fn stop_without_a_session_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path(), vec![]);
        dispatch(&ws, Mode::Stop, &DispatchOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_signals_the_session_holder() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path(), vec![]);
        fs::create_dir_all(&ws.state_dir).unwrap();

        let mut holder = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let info = lock::LockInfo {
            pid: holder.id(),
            mode: "dev".into(),
            acquired_at: chrono::Local::now(),
        };
        fs::write(ws.lock_path(), serde_json::to_vec(&info).unwrap()).unwrap();
        let reaper = std::thread::spawn(move || holder.wait().unwrap());

        dispatch(&ws, Mode::Stop, &DispatchOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        let status = reaper.join().unwrap();
        assert_eq!(status.code(), None);
    }
}
