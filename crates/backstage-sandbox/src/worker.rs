//! The worker side of process isolation.
//!
//! A worker process serves exactly one invocation: it reads one
//! [`WorkerRequest`] line, builds a [`SandboxEngine`] from the payload, runs
//! it and writes one [`WorkerResponse`] line before exiting. Nothing survives
//! into the next invocation because the process does not.

use crate::engine::{ExecuteOptions, SandboxEngine};
use async_trait::async_trait;
use backstage_core::cli::ExitCode;
use backstage_core::ipc::{InvocationPayload, WorkerRequest, WorkerResponse};
use backstage_core::traits::FunctionExecutor;
use backstage_core::{Error, RequestEnvelope, ResponseOutcome, Result, RuntimeConfig};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Compiles and runs one payload on a fresh engine.
///
/// # Errors
///
/// Returns whatever engine construction, compilation or execution returns.
pub async fn execute_payload(payload: InvocationPayload) -> Result<ResponseOutcome> {
    let engine = SandboxEngine::new(RuntimeConfig::from_payload(&payload))?;
    let unit = engine
        .compile(&payload.file_name(), &payload.pre_code.code)
        .await?;

    let options = ExecuteOptions {
        prefix: payload.options.prefix,
        env: payload.options.env,
        ..ExecuteOptions::default()
    };
    engine
        .execute(&unit, RequestEnvelope::new(payload.req), options)
        .await
}

/// Serves one invocation over a line-oriented stream pair.
///
/// Returns [`ExitCode::SUCCESS`] if the function produced an outcome and
/// [`ExitCode::ERROR`] otherwise, including protocol failures.
pub async fn serve<R, W>(reader: R, mut writer: W) -> ExitCode
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let line = match lines.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => {
            tracing::warn!("worker input closed before a request arrived");
            return ExitCode::ERROR;
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to read worker request");
            return ExitCode::ERROR;
        }
    };

    let (id, result) = match parse_request(&line) {
        Ok(request) => {
            tracing::debug!(id = %request.id, function = %request.data.file_name(), "worker request");
            let result = execute_payload(request.data).await;
            (request.id, result)
        }
        Err((id, err)) => (id, Err(err)),
    };

    let (response, code) = match result {
        Ok(outcome) => (WorkerResponse::success(id, outcome), ExitCode::SUCCESS),
        Err(err) => (WorkerResponse::failure(id, &err), ExitCode::ERROR),
    };

    if let Err(err) = write_line(&mut writer, &response).await {
        tracing::error!(error = %err, "failed to write worker response");
        return ExitCode::ERROR;
    }
    code
}

/// Keeps the correlation id of a malformed request when it can be read.
fn parse_request(line: &str) -> std::result::Result<WorkerRequest, (String, Error)> {
    let value: Value = serde_json::from_str(line).map_err(|err| (String::new(), err.into()))?;
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    serde_json::from_value(value).map_err(|err| (id, err.into()))
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, response: &WorkerResponse) -> Result<()> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Runs payloads on a fresh engine in the current process.
///
/// Context-level isolation only: cheaper than [`crate::ProcessIsolatedRunner`]
/// but shares the process with every other invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessExecutor;

impl InProcessExecutor {
    /// Creates an executor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FunctionExecutor for InProcessExecutor {
    async fn invoke(
        &self,
        invocation_id: &str,
        payload: InvocationPayload,
    ) -> Result<ResponseOutcome> {
        tracing::debug!(id = invocation_id, "in-process invocation");
        execute_payload(payload).await
    }
}
