use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::output::OutputTail;

// Lines of output kept per process for crash diagnostics
pub const TAIL_LINES: usize = 40;

/// A program invocation: argv, working directory and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl CommandLine {
    pub fn from_argv(
        argv: &[String],
        cwd: PathBuf,
        env: BTreeMap<String, String>,
    ) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd,
            env,
        })
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Piped, stdin-less command in its own process group.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(platform_program(&self.program));
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

fn platform_program(program: &str) -> String {
    if cfg!(windows) && matches!(program, "npm" | "npx") {
        format!("{program}.cmd")
    } else {
        program.to_string()
    }
}

/// When a starting process counts as usable by its dependents.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// A line of output matches.
    Marker(Regex),
    /// The process is still running after this long.
    After(Duration),
}

/// An unstarted process handed to the supervisor.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub command: CommandLine,
    pub depends_on: Vec<String>,
    pub readiness: Readiness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Pending,
    Starting,
    Ready,
    Crashed,
    Stopping,
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Pending => "pending",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Crashed => "crashed",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct ManagedProcess {
    pub spec: ProcessSpec,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub start_time: Option<Instant>,
    pub ready_at: Option<Instant>,
    /// Spawns made so far, the current one included.
    pub attempts: u32,
    pub restart_count: u32,
    pub last_exit: Option<i32>,
    pub tail: OutputTail,
    pub(super) kill: Option<CancellationToken>,
    pub(super) exited: bool,
    pub(super) hung: bool,
    pub(super) group: Option<u32>,
}

impl ManagedProcess {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            state: ProcessState::Pending,
            pid: None,
            start_time: None,
            ready_at: None,
            attempts: 0,
            restart_count: 0,
            last_exit: None,
            tail: OutputTail::new(TAIL_LINES),
            kill: None,
            exited: true,
            hung: false,
            group: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub(super) fn mark_ready(&mut self) {
        let now = Instant::now();
        self.state = ProcessState::Ready;
        self.ready_at = Some(now);
        let elapsed = self.start_time.map(|t| now - t).unwrap_or_default();
        tracing::info!(
            toolchain = self.name(),
            attempt = self.attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "process ready"
        );
    }

    /// Ask the waiter task to terminate the child.
    pub(super) fn request_stop(&mut self) {
        self.state = ProcessState::Stopping;
        if let Some(kill) = &self.kill {
            kill.cancel();
        }
    }

    pub(super) fn record_exit(&mut self, code: Option<i32>) {
        self.exited = true;
        self.last_exit = code;
        self.pid = None;
        self.kill = None;
    }
}
