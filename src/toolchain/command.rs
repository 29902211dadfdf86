use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::supervisor::output::{self, OutputTail};
use crate::supervisor::process::{CommandLine, TAIL_LINES};
use crate::supervisor::signal;

/// Result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    /// Last lines of combined stdout/stderr
    pub tail: Vec<String>,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn output(&self) -> String {
        self.tail.join("\n")
    }
}

/// Run `command` to completion, echoing its output prefixed with `label`.
///
/// A non-zero exit is not an error here; callers decide what it means.
/// Cancellation terminates the child (and its group) and yields
/// [`Error::Cancelled`].
pub async fn run_captured(
    label: &str,
    command: &CommandLine,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<CommandOutcome> {
    debug!(toolchain = label, command = %command.display(), cwd = %command.cwd.display(), "running");
    let mut child = command.to_command().spawn().map_err(|source| Error::Spawn {
        toolchain: label.to_string(),
        program: command.program.clone(),
        source,
    })?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        pumps.push(output::pump_lines(label.to_string(), stdout, move |line| {
            tx.send(line).is_ok()
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        pumps.push(output::pump_lines(label.to_string(), stderr, move |line| {
            tx.send(line).is_ok()
        }));
    }
    drop(tx);

    let mut tail = OutputTail::new(TAIL_LINES);
    let status = loop {
        tokio::select! {
            Some(line) = rx.recv() => {
                output::emit_line(label, &line);
                tail.push(line);
            }
            status = child.wait() => break status?,
            _ = cancel.cancelled() => {
                signal::terminate(&mut child, grace).await?;
                return Err(Error::Cancelled);
            }
        }
    };

    output::drain(pumps).await;
    while let Ok(line) = rx.try_recv() {
        output::emit_line(label, &line);
        tail.push(line);
    }

    Ok(CommandOutcome {
        exit_code: status.code(),
        tail: tail.lines(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sh(script: &str, cwd: &std::path::Path) -> CommandLine {
        CommandLine::from_argv(
            &["sh".into(), "-c".into(), script.into()],
            cwd.to_path_buf(),
            BTreeMap::from([("DEVCTL_TEST_VAR".to_string(), "42".to_string())]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn captures_exit_code_and_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("echo out; echo err 1>&2; echo $DEVCTL_TEST_VAR; exit 3", dir.path());
        let outcome = run_captured("test", &cmd, &CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
        let mut lines = outcome.tail.clone();
        lines.sort();
        assert_eq!(lines, vec!["42", "err", "out"]);
    }

    #[tokio::test]
    async fn runs_in_the_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("touch here.txt", dir.path());
        let outcome = run_captured("test", &cmd, &CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.success());
        assert!(dir.path().join("here.txt").exists());
    }

    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("sleep 30", dir.path());
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });
        let started = std::time::Instant::now();
        let err = run_captured("test", &cmd, &cancel, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = CommandLine::from_argv(
            &["no-such-program-devctl".into()],
            dir.path().to_path_buf(),
            BTreeMap::new(),
        )
        .unwrap();
        let err = run_captured("frontend", &cmd, &CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { ref toolchain, .. } if toolchain == "frontend"));
    }
}
