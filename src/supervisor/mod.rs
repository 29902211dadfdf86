//! Dev-session process supervision.
//!
//! A [`Supervisor`] owns every child process of one dev session. A single
//! control loop multiplexes child output, child exits, readiness and startup
//! deadlines, and the session's cancellation token. Children start in
//! dependency order, hung starts are retried a bounded number of times, and
//! any unexpected exit tears the whole session down in reverse order.

pub mod output;
pub mod process;
pub mod signal;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub use process::{CommandLine, ManagedProcess, ProcessSpec, ProcessState, Readiness};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// How long a process may stay `Starting` before it counts as hung.
    pub startup_timeout: Duration,
    /// Spawns allowed per process before a hang becomes fatal.
    pub startup_attempts: u32,
    /// Time between SIGTERM and SIGKILL when stopping a process.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(120),
            startup_attempts: 3,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
enum Event {
    Line {
        id: usize,
        attempt: u32,
        line: String,
    },
    Exited {
        id: usize,
        attempt: u32,
        code: Option<i32>,
    },
}

enum Wake {
    Cancelled,
    Event(Option<Event>),
    Deadline,
}

pub struct Supervisor {
    processes: Vec<ManagedProcess>,
    deps: Vec<Vec<usize>>,
    order: Vec<usize>,
    settings: SupervisorSettings,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl Supervisor {
    pub fn new(specs: Vec<ProcessSpec>, settings: SupervisorSettings) -> Result<Self> {
        if settings.startup_attempts == 0 {
            return Err(Error::Config("startup_attempts must be at least 1".into()));
        }

        let nodes: Vec<(&str, &[String])> = specs
            .iter()
            .map(|spec| (spec.name.as_str(), spec.depends_on.as_slice()))
            .collect();
        let (deps, order) = resolve_order(&nodes)?;
        let processes = specs.into_iter().map(ManagedProcess::new).collect();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            processes,
            deps,
            order,
            settings,
            events_tx,
            events_rx,
        })
    }

    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    /// Run the session until it is cancelled or fails.
    ///
    /// Cancellation is a clean stop and returns `Ok`. Every process is
    /// `Stopped` when this returns, whatever the outcome.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let result = self.drive(cancel).await;
        if let Err(err) = &result {
            warn!("dev session failed: {err}");
        }
        self.shutdown_all().await;
        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            self.start_eligible()?;

            let deadline = self.next_deadline();
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                event = self.events_rx.recv() => Wake::Event(event),
                _ = sleep_until_opt(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Cancelled => {
                    info!("stop requested; shutting down dev session");
                    return Ok(());
                }
                Wake::Event(Some(event)) => self.handle_event(event)?,
                Wake::Event(None) => {
                    return Err(Error::Io(std::io::Error::other(
                        "supervisor event channel closed",
                    )));
                }
                Wake::Deadline => self.check_deadlines(),
            }
        }
    }

    fn start_eligible(&mut self) -> Result<()> {
        for position in 0..self.order.len() {
            let id = self.order[position];
            if self.processes[id].state != ProcessState::Pending {
                continue;
            }
            let deps_ready = self.deps[id]
                .iter()
                .all(|&dep| self.processes[dep].state == ProcessState::Ready);
            if deps_ready {
                self.spawn(id)?;
            }
        }
        Ok(())
    }

    fn spawn(&mut self, id: usize) -> Result<()> {
        let grace = self.settings.shutdown_grace;
        let tx = self.events_tx.clone();
        let process = &mut self.processes[id];
        let attempt = process.attempts + 1;
        let name = process.name().to_string();

        let mut child = process
            .spec
            .command
            .to_command()
            .spawn()
            .map_err(|source| Error::Spawn {
                toolchain: name.clone(),
                program: process.spec.command.program.clone(),
                source,
            })?;
        let pid = child.id();

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            pumps.push(output::pump_lines(name.clone(), stdout, move |line| {
                tx.send(Event::Line { id, attempt, line }).is_ok()
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            pumps.push(output::pump_lines(name.clone(), stderr, move |line| {
                tx.send(Event::Line { id, attempt, line }).is_ok()
            }));
        }

        let kill = CancellationToken::new();
        let watch = Watch {
            id,
            attempt,
            grace,
            kill: kill.clone(),
            pumps,
            tx,
        };
        tokio::spawn(watch_child(child, watch));

        process.state = ProcessState::Starting;
        process.attempts = attempt;
        process.restart_count = attempt - 1;
        process.start_time = Some(Instant::now());
        process.ready_at = None;
        process.pid = pid;
        process.group = pid;
        process.kill = Some(kill);
        process.exited = false;
        process.hung = false;
        process.tail.clear();

        info!(
            toolchain = name.as_str(),
            attempt,
            pid,
            command = %process.spec.command.display(),
            "process starting"
        );
        Ok(())
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Line { id, attempt, line } => {
                let process = &mut self.processes[id];
                output::emit_line(process.name(), &line);
                if attempt != process.attempts {
                    return Ok(());
                }
                let matched = process.state == ProcessState::Starting
                    && matches!(&process.spec.readiness, Readiness::Marker(re) if re.is_match(&line));
                process.tail.push(line);
                if matched {
                    process.mark_ready();
                }
                Ok(())
            }
            Event::Exited { id, attempt, code } => {
                let max_attempts = self.settings.startup_attempts;
                let process = &mut self.processes[id];
                if attempt != process.attempts {
                    return Ok(());
                }
                process.record_exit(code);

                match process.state {
                    ProcessState::Stopping if process.hung => {
                        process.state = ProcessState::Stopped;
                        if process.attempts >= max_attempts {
                            return Err(Error::ProcessHung {
                                toolchain: process.name().to_string(),
                                attempts: process.attempts,
                            });
                        }
                        warn!(
                            toolchain = process.name(),
                            attempt = process.attempts,
                            "hung process stopped; retrying"
                        );
                        process.state = ProcessState::Pending;
                        Ok(())
                    }
                    ProcessState::Stopping => {
                        process.state = ProcessState::Stopped;
                        Ok(())
                    }
                    ProcessState::Starting | ProcessState::Ready => {
                        process.state = ProcessState::Crashed;
                        warn!(toolchain = process.name(), exit_code = code, "process exited unexpectedly");
                        Err(Error::ProcessCrashed {
                            toolchain: process.name().to_string(),
                            exit_code: code,
                            last_lines: process.tail.lines(),
                        })
                    }
                    ProcessState::Pending | ProcessState::Crashed | ProcessState::Stopped => Ok(()),
                }
            }
        }
    }

    fn ready_deadline(&self, process: &ManagedProcess) -> Option<Instant> {
        let started = process.start_time?;
        match process.spec.readiness {
            Readiness::After(grace) => Some(started + grace),
            Readiness::Marker(_) => None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.processes
            .iter()
            .filter(|p| p.state == ProcessState::Starting)
            .filter_map(|p| {
                let hang = p.start_time? + self.settings.startup_timeout;
                Some(match self.ready_deadline(p) {
                    Some(ready) => ready.min(hang),
                    None => hang,
                })
            })
            .min()
    }

    fn check_deadlines(&mut self) {
        let now = Instant::now();
        let timeout = self.settings.startup_timeout;
        for id in 0..self.processes.len() {
            if self.processes[id].state != ProcessState::Starting {
                continue;
            }
            let ready_deadline = self.ready_deadline(&self.processes[id]);
            let process = &mut self.processes[id];
            let Some(started) = process.start_time else {
                continue;
            };

            if ready_deadline.is_some_and(|ready| now >= ready) {
                process.mark_ready();
            } else if now >= started + timeout {
                warn!(
                    toolchain = process.name(),
                    attempt = process.attempts,
                    "no readiness signal within {timeout:?}; treating as hung"
                );
                process.hung = true;
                process.request_stop();
            }
        }
    }

    /// Stop every live process in reverse dependency order.
    async fn shutdown_all(&mut self) {
        for position in (0..self.order.len()).rev() {
            let id = self.order[position];
            let process = &mut self.processes[id];
            if process.state == ProcessState::Stopped {
                continue;
            }
            if !process.exited {
                info!(toolchain = process.name(), "stopping");
                process.request_stop();
                self.await_exit(id).await;
            }

            let process = &mut self.processes[id];
            if let Some(group) = process.group.take() {
                signal::sweep_group(group);
            }
            process.state = ProcessState::Stopped;
        }
    }

    async fn await_exit(&mut self, id: usize) {
        while !self.processes[id].exited {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            match event {
                Event::Line { id, attempt, line } => {
                    let process = &mut self.processes[id];
                    output::emit_line(process.name(), &line);
                    if attempt == process.attempts {
                        process.tail.push(line);
                    }
                }
                Event::Exited { id, attempt, code } => {
                    let process = &mut self.processes[id];
                    if attempt == process.attempts {
                        process.record_exit(code);
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

struct Watch {
    id: usize,
    attempt: u32,
    grace: Duration,
    kill: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<Event>,
}

/// Own one child until it exits or its kill token fires.
///
/// The exit is reported only after the output pumps drain, so the last lines
/// a child printed are in its tail when the supervisor sees it exit.
async fn watch_child(mut child: Child, watch: Watch) {
    let Watch {
        id,
        attempt,
        grace,
        kill,
        pumps,
        tx,
    } = watch;

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };
    let status = match waited {
        Some(status) => status,
        None => signal::terminate(&mut child, grace).await,
    };
    output::drain(pumps).await;
    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!("waiting on child failed: {err}");
            None
        }
    };
    let _ = tx.send(Event::Exited { id, attempt, code });
}

/// Resolve `depends_on` names to indices and compute a start order.
///
/// The order is topological and otherwise follows declaration order.
/// Duplicate names, unknown dependencies and cycles are configuration errors.
pub(crate) fn resolve_order(nodes: &[(&str, &[String])]) -> Result<(Vec<Vec<usize>>, Vec<usize>)> {
    let mut index = HashMap::new();
    for (id, (name, _)) in nodes.iter().enumerate() {
        if index.insert(*name, id).is_some() {
            return Err(Error::Config(format!("duplicate name `{name}`")));
        }
    }

    let mut deps = Vec::with_capacity(nodes.len());
    for (name, depends_on) in nodes {
        let mut resolved = Vec::with_capacity(depends_on.len());
        for dep in depends_on.iter() {
            let Some(&dep_id) = index.get(dep.as_str()) else {
                return Err(Error::Config(format!("`{name}` depends on unknown `{dep}`")));
            };
            resolved.push(dep_id);
        }
        deps.push(resolved);
    }

    let mut placed = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    while order.len() < nodes.len() {
        let next = (0..nodes.len()).find(|&id| !placed[id] && deps[id].iter().all(|&dep| placed[dep]));
        let Some(id) = next else {
            let stuck: Vec<&str> = (0..nodes.len())
                .filter(|&id| !placed[id])
                .map(|id| nodes[id].0)
                .collect();
            return Err(Error::Config(format!(
                "dependency cycle between: {}",
                stuck.join(", ")
            )));
        };
        placed[id] = true;
        order.push(id);
    }
    Ok((deps, order))
}
