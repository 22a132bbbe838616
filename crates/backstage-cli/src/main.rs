//! Backstage functions CLI.
//!
//! Runs sandboxed JavaScript functions locally and doubles as the worker
//! process behind `run --isolated`.
//!
//! # Examples
//!
//! ```bash
//! # Run a function with an environment variable
//! backstage run hello.js --env NAME=world
//!
//! # Check a function for syntax errors
//! backstage check hello.js
//! ```

use anyhow::Result;
use backstage_cli::commands;
use backstage_cli::{Cli, Commands, LogFormat};
use backstage_core::cli::{ExitCode, OutputFormat};
use clap::{CommandFactory, Parser};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let output_format = cli
        .format
        .parse::<OutputFormat>()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let exit_code = execute_command(cli.command, cli.config.as_deref(), output_format).await?;

    std::process::exit(exit_code.as_i32());
}

/// Initializes logging on stderr.
///
/// Stdout is reserved for command output and, in worker mode, for the
/// response line.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

/// Routes commands to their handlers and returns an exit code.
async fn execute_command(
    command: Commands,
    config: Option<&std::path::Path>,
    output_format: OutputFormat,
) -> Result<ExitCode> {
    match command {
        Commands::Run(args) => commands::run::run(args, config, output_format).await,
        Commands::Check { file } => commands::check::run(&file, config, output_format).await,
        Commands::Worker => Ok(commands::worker::run().await),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            Ok(commands::completions::run(shell, &mut cmd))
        }
    }
}
