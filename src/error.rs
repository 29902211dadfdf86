use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid root: {} is missing or not a directory", .0.display())]
    InvalidRoot(PathBuf),

    #[error("{toolchain}: install failed ({})", describe_exit(*exit_code))]
    InstallFailed {
        toolchain: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("{toolchain}: build failed ({})", describe_exit(*exit_code))]
    BuildFailed {
        toolchain: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("could not remove {}: {source}", path.display())]
    CleanFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{toolchain}: no readiness signal after {attempts} start attempt(s)")]
    ProcessHung { toolchain: String, attempts: u32 },

    #[error("{toolchain}: exited unexpectedly ({})", describe_exit(*exit_code))]
    ProcessCrashed {
        toolchain: String,
        exit_code: Option<i32>,
        last_lines: Vec<String>,
    },

    #[error("workspace busy: {} is held{}", marker.display(), pid.map(|p| format!(" by pid {p}")).unwrap_or_default())]
    WorkspaceBusy { marker: PathBuf, pid: Option<u32> },

    #[error("session pid {pid} is still running after the stop request")]
    StopTimedOut { pid: u32 },

    #[error("{toolchain}: failed to start `{program}`: {source}")]
    Spawn {
        toolchain: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{} operation(s) failed", .0.len())]
    Failures(Vec<Error>),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl Error {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::InvalidRoot(_) => 2,
            Error::WorkspaceBusy { .. } => 3,
            Error::ProcessHung { .. } => 4,
            Error::ProcessCrashed { .. } => 5,
            Error::Cancelled => 130,
            Error::InstallFailed { .. }
            | Error::BuildFailed { .. }
            | Error::CleanFailed { .. }
            | Error::Spawn { .. }
            | Error::StopTimedOut { .. }
            | Error::Config(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Failures(_) => 1,
        }
    }

    /// Multi-line diagnostic: the message plus any captured output.
    pub fn diagnostic(&self) -> String {
        match self {
            Error::InstallFailed { output, .. } | Error::BuildFailed { output, .. }
                if !output.is_empty() =>
            {
                format!("{self}\n--- captured output ---\n{output}")
            }
            Error::ProcessCrashed { last_lines, .. } if !last_lines.is_empty() => {
                format!("{self}\n--- last output ---\n{}", last_lines.join("\n"))
            }
            Error::Failures(errors) => {
                let mut out = self.to_string();
                for err in errors {
                    for (idx, line) in err.diagnostic().lines().enumerate() {
                        let bullet = if idx == 0 { "  - " } else { "    " };
                        out.push('\n');
                        out.push_str(bullet);
                        out.push_str(line);
                    }
                }
                out
            }
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
