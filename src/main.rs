mod config;
mod dispatch;
mod error;
mod history;
mod inventory;
mod lock;
mod logging;
mod output;
mod supervisor;
mod toolchain;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, CommandFactory, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::Workspace;
use dispatch::{DispatchOptions, Mode};
use error::Error;

#[derive(Parser, Debug)]
#[command(
    name = "devctl",
    version,
    about = "Workspace inventory and dev-session supervisor for desktop app projects"
)]
#[command(group(
    ArgGroup::new("mode")
        .args(["init", "tree", "build", "clean_build", "clean_deps", "dev", "stop"])
))]
struct Cli {
    /// Install dependencies for every toolchain
    #[arg(short, long)]
    init: bool,

    /// Print the workspace inventory: a JSON summary followed by the file tree
    #[arg(short, long)]
    tree: bool,

    /// Production build of every toolchain, in dependency order
    #[arg(short, long)]
    build: bool,

    /// Remove build artifacts
    #[arg(short = 'c', long)]
    clean_build: bool,

    /// Remove dependency caches
    #[arg(short = 'f', long)]
    clean_deps: bool,

    /// Run the development session until Ctrl+C or a failure
    #[arg(short, long)]
    dev: bool,

    /// Stop the dev session running in this workspace
    #[arg(short = 'x', long)]
    stop: bool,

    /// Workspace root
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Configuration file (default: <root>/devctl.toml, if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reinstall even when dependencies are already present
    #[arg(long)]
    force: bool,

    /// With --tree, also write the summary JSON to this file
    #[arg(long, value_name = "FILE")]
    summary_json: Option<PathBuf>,

    /// Log level; DEVCTL_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn mode(&self) -> Option<Mode> {
        [
            (self.init, Mode::Init),
            (self.tree, Mode::Tree),
            (self.build, Mode::Build),
            (self.clean_build, Mode::CleanBuild),
            (self.clean_deps, Mode::CleanDeps),
            (self.dev, Mode::Dev),
            (self.stop, Mode::Stop),
        ]
        .into_iter()
        .find_map(|(set, mode)| set.then_some(mode))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Some(mode) = cli.mode() else {
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    };

    match run(&cli, mode).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => ExitCode::from(report(&err)),
    }
}

async fn run(cli: &Cli, mode: Mode) -> anyhow::Result<()> {
    let workspace = Workspace::load(&cli.root, cli.config.as_deref())?;

    let log_path = workspace.output_log_path();
    let log_error = logging::init(&cli.log_level, log_path.as_deref())?;
    if let Some(err) = log_error {
        warn!("output log disabled: {err:#}");
    }

    let cancel = CancellationToken::new();
    spawn_stop_listener(cancel.clone());

    info!(
        mode = mode.name(),
        root = %workspace.root.display(),
        toolchains = workspace.toolchains.len(),
        "starting"
    );

    let options = DispatchOptions {
        force: cli.force,
        summary_out: cli.summary_json.clone(),
        invocation: Some(invocation()),
    };
    dispatch::dispatch(&workspace, mode, &options, &cancel).await?;
    Ok(())
}

/// Print the failure and pick the exit status.
fn report(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(typed) => {
            eprintln!("Error: {}", typed.diagnostic());
            typed.exit_code()
        }
        None => {
            eprintln!("Error: {err:#}");
            1
        }
    }
}

fn invocation() -> String {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        "devctl".to_string()
    } else {
        format!("devctl {}", args.join(" "))
    }
}

fn spawn_stop_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_stop().await;
        info!("stop requested");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_stop() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!("cannot listen for SIGTERM: {err}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop() {
    let _ = tokio::signal::ctrl_c().await;
}
