//! scriptbox worker entrypoint
//!
//! Usage: scriptbox-worker [OPTIONS] <PORT> <ENVIRONMENT_ID>
//!
//! Drops privileges, dials the harness on the loopback interface and serves
//! commands until the harness sends `stop` or closes the connection.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use scriptbox_worker::{FaultReporter, Worker, WorkerConfig, WorkerError};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scriptbox-worker")]
#[command(about = "Single-connection script execution worker", version)]
struct Cli {
    /// Harness port
    port: u16,

    /// Environment identifier echoed in the greeting
    environment_id: String,

    /// Harness host (default: 127.0.0.1)
    #[arg(long)]
    host: Option<IpAddr>,

    /// Path to a TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Directory holding the module slot
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Show every stack frame and debug logs
    #[arg(long, short)]
    verbose: bool,

    /// Skip the privilege drop (local development only)
    #[arg(long)]
    keep_privileges: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Last-resort logging for panics outside the dispatch boundary.
    std::panic::set_hook(Box::new(|info| {
        error!(panic = %info, "worker panicked");
    }));

    let config = match build_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let reporter = FaultReporter::stderr(config.toolchain.module_name.clone(), config.verbose);
    let mut worker = Worker::new(config, reporter);
    match worker.start() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, state = %worker.state(), "worker terminated");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(cli: Cli) -> Result<WorkerConfig, WorkerError> {
    let mut config = match &cli.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };

    config.port = cli.port;
    config.environment_id = cli.environment_id;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(workdir) = cli.workdir {
        config.toolchain.module_dir = workdir;
    }
    config.verbose |= cli.verbose;
    if cli.keep_privileges {
        config.privileges.enabled = false;
    }

    config.validate()?;
    Ok(config)
}
