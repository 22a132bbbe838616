//! Run command implementation.
//!
//! Runs a function file once, either in-process through
//! `SandboxEngine::run_from_source` or in a disposable worker process.

use crate::cli::RunArgs;
use crate::config::{CliConfig, Overrides};
use crate::formatters::format_output;
use anyhow::{Context, Result};
use backstage_core::cli::{ExitCode, OutputFormat};
use backstage_core::ipc::InvocationPayload;
use backstage_core::log::{LogSink, MemoryLog};
use backstage_core::{Error, RequestInput, ResponseOutcome, RuntimeConfig};
use backstage_sandbox::{ExecuteOptions, ProcessIsolatedRunner, SandboxEngine};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Bytes of console output kept by `--capture-logs`.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// Printed when the function produced a response.
#[derive(Debug, Serialize)]
struct SuccessReport {
    #[serde(flatten)]
    outcome: ResponseOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<String>,
}

/// Printed when the invocation failed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Error message
    pub error: String,
    /// Error family
    pub kind: &'static str,
    /// Status code, if the error carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Filtered stack trace of a user-code error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Captured console output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

impl ErrorReport {
    /// Describes `err`.
    #[must_use]
    pub fn new(err: &Error) -> Self {
        let stack = match err {
            Error::UserCode { stack, .. } => stack.clone().filter(|s| !s.is_empty()),
            Error::Syntax(report) if !report.stack.is_empty() => Some(report.stack.clone()),
            _ => None,
        };
        Self {
            error: err.to_string(),
            kind: err.kind_tag(),
            status_code: err.status_code(),
            stack,
            logs: None,
        }
    }
}

/// Runs the run command.
///
/// # Errors
///
/// Returns an error if the configuration, request file or source cannot be
/// read. Failures of the function itself are printed and mapped to an exit
/// code instead.
pub async fn run(
    args: RunArgs,
    config_path: Option<&Path>,
    output_format: OutputFormat,
) -> Result<ExitCode> {
    info!(file = %args.file.display(), isolated = args.isolated, "running function");

    let file_config = CliConfig::load(config_path)?;
    let overrides = Overrides {
        env: args.env.clone(),
        allow: args.allow.clone(),
        sync_timeout_ms: args.sync_timeout,
        async_timeout_ms: args.async_timeout,
    };
    let runtime = file_config.runtime_config(&overrides)?;
    let request = load_request(args.request.as_deref()).await?;

    // A worker's console goes to its own stderr.
    let log = (args.capture_logs && !args.isolated)
        .then(|| Arc::new(MemoryLog::new(CAPTURE_LIMIT)));

    let result = if args.isolated {
        let payload = isolated_payload(&args.file, &runtime, request).await?;
        let runner = ProcessIsolatedRunner::new()?;
        let id = uuid::Uuid::new_v4().to_string();
        runner.run(&id, payload).await
    } else {
        let engine = SandboxEngine::new(runtime)?;
        let mut options = ExecuteOptions::default();
        if let Some(log) = &log {
            options = options.with_log_sink(Arc::clone(log) as Arc<dyn LogSink>);
        }
        engine.run_from_source(&args.file, request, options).await
    };

    let logs = log.map(|log| log.contents());
    let (output, code) = match result {
        Ok(outcome) => (
            format_output(&SuccessReport { outcome, logs }, output_format)?,
            ExitCode::SUCCESS,
        ),
        Err(err) => {
            info!(error = %err, "function failed");
            let mut report = ErrorReport::new(&err);
            report.logs = logs;
            (format_output(&report, output_format)?, ExitCode::for_error(&err))
        }
    };
    println!("{output}");
    Ok(code)
}

async fn load_request(path: Option<&Path>) -> Result<RequestInput> {
    let Some(path) = path else {
        return Ok(RequestInput::default());
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read request file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse request file {}", path.display()))
}

/// Builds the worker payload for a file.
///
/// The namespace is the file's parent directory name (`local` when there is
/// none) and the function name its stem, so stack traces show
/// `<namespace>/<function>.js`.
async fn isolated_payload(
    file: &Path,
    runtime: &RuntimeConfig,
    request: RequestInput,
) -> Result<InvocationPayload> {
    let code = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let namespace = file
        .parent()
        .and_then(Path::file_name)
        .map_or_else(|| "local".to_string(), |name| name.to_string_lossy().into_owned());
    let function_name = file
        .file_stem()
        .map_or_else(|| "main".to_string(), |stem| stem.to_string_lossy().into_owned());

    let mut payload = InvocationPayload::new(namespace, function_name, code);
    payload.env = runtime.env().clone();
    payload.config = runtime.config().clone();
    payload.global_modules = runtime.global_modules().to_vec();
    payload.sync_timeout = Some(millis(runtime.sync_timeout()));
    payload.async_timeout = Some(millis(runtime.async_timeout()));
    payload.modules = runtime.virtual_modules().clone();
    payload.req = request;
    Ok(payload)
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
