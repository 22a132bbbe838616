//! Check command implementation.
//!
//! Runs the syntax check on a function file without invoking it.

use crate::config::{CliConfig, Overrides};
use crate::formatters::format_output;
use anyhow::{Context, Result};
use backstage_core::cli::{ExitCode, OutputFormat};
use backstage_sandbox::SandboxEngine;
use serde::Serialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Serialize)]
struct CheckPassed<'a> {
    file: &'a str,
    ok: bool,
}

/// Runs the check command.
///
/// Prints the syntax report and exits with [`ExitCode::SYNTAX_ERROR`] if the
/// file fails the check, or prints `ok` otherwise.
///
/// # Errors
///
/// Returns an error if the file or the configuration cannot be read.
pub async fn run(
    file: &Path,
    config_path: Option<&Path>,
    output_format: OutputFormat,
) -> Result<ExitCode> {
    info!(file = %file.display(), "checking function");

    let runtime = CliConfig::load(config_path)?.runtime_config(&Overrides::default())?;

    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let filename = file.to_string_lossy();
    let engine = SandboxEngine::new(runtime)?;

    match engine.check_syntax(&filename, &source).await? {
        Some(report) => {
            println!("{}", format_output(&report, output_format)?);
            Ok(ExitCode::SYNTAX_ERROR)
        }
        None if output_format == OutputFormat::Pretty => {
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }
        None => {
            let passed = CheckPassed {
                file: &filename,
                ok: true,
            };
            println!("{}", format_output(&passed, output_format)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
