//! Process-per-invocation isolation.
//!
//! [`ProcessIsolatedRunner`] spawns one disposable worker process per
//! invocation and talks to it over newline-delimited JSON on its stdio (see
//! [`backstage_core::ipc`]). Timers, module state and stray async errors of
//! one invocation die with its worker, at the cost of a process spawn per
//! call.
//!
//! # Examples
//!
//! ```no_run
//! use backstage_core::ipc::InvocationPayload;
//! use backstage_sandbox::ProcessIsolatedRunner;
//!
//! # async fn example() -> backstage_core::Result<()> {
//! let runner = ProcessIsolatedRunner::new()?;
//! let payload = InvocationPayload::new("acme", "hello", "function main() { return 'hi'; }");
//! let outcome = runner.run("inv-1", payload).await?;
//! assert_eq!(outcome.body, "hi");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use backstage_core::ipc::{InvocationPayload, WorkerRequest, WorkerResponse};
use backstage_core::traits::FunctionExecutor;
use backstage_core::{Error, ResponseOutcome, Result, RuntimeConfig};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};

/// Extra time a worker gets past the completion deadline to report it.
pub const DEFAULT_WORKER_GRACE: Duration = Duration::from_secs(1);

type InFlight = Arc<Mutex<HashMap<String, Option<u32>>>>;

/// Runs each invocation in its own worker process.
///
/// The worker is `current_exe worker` unless another command is configured.
/// It must speak the protocol of [`crate::worker::serve`].
#[derive(Debug, Clone)]
pub struct ProcessIsolatedRunner {
    program: PathBuf,
    args: Vec<OsString>,
    worker_grace: Duration,
    in_flight: InFlight,
}

impl ProcessIsolatedRunner {
    /// Creates a runner that re-executes the current binary as `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the current executable cannot be located.
    pub fn new() -> Result<Self> {
        Ok(Self::with_command(std::env::current_exe()?, ["worker"]))
    }

    /// Creates a runner that spawns `program` with `args` for every worker.
    #[must_use]
    pub fn with_command<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            worker_grace: DEFAULT_WORKER_GRACE,
            in_flight: Arc::default(),
        }
    }

    /// Sets how long past the completion deadline a worker may take.
    #[must_use]
    pub const fn worker_grace(mut self, grace: Duration) -> Self {
        self.worker_grace = grace;
        self
    }

    /// Ids of invocations whose worker is still running.
    #[must_use]
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Runs `payload` in a fresh worker and relays its single result.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the worker reports the completion deadline or
    ///   does not answer within it plus the worker grace
    /// - [`Error::Worker`] for any other failure the worker relays, or if it
    ///   exits without answering
    /// - [`Error::Io`] if the worker cannot be spawned or talked to
    pub async fn run(
        &self,
        invocation_id: &str,
        payload: InvocationPayload,
    ) -> Result<ResponseOutcome> {
        let async_timeout = RuntimeConfig::from_payload(&payload).async_timeout();
        let timeout_ms = u64::try_from(async_timeout.as_millis()).unwrap_or(u64::MAX);

        let request = WorkerRequest {
            id: invocation_id.to_string(),
            data: payload,
        };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let _registration = Registration::new(&self.in_flight, invocation_id, child.id());
        tracing::debug!(id = invocation_id, pid = child.id(), "worker spawned");

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::internal("worker stdio was not captured"));
        };

        let exchange = exchange(stdin, stdout, invocation_id, &line);
        match tokio::time::timeout(async_timeout + self.worker_grace, exchange).await {
            Ok(Ok(response)) => {
                let status = child.wait().await?;
                tracing::debug!(id = invocation_id, %status, "worker exited");
                if status.success() != response.is_success() {
                    tracing::warn!(
                        id = invocation_id,
                        %status,
                        "worker exit status disagrees with its response"
                    );
                }
                response.into_result(timeout_ms)
            }
            Ok(Err(err)) => {
                reap(&mut child, invocation_id).await;
                Err(err)
            }
            Err(_) => {
                tracing::warn!(id = invocation_id, timeout_ms, "worker did not answer in time");
                reap(&mut child, invocation_id).await;
                Err(Error::Timeout { timeout_ms })
            }
        }
    }
}

#[async_trait]
impl FunctionExecutor for ProcessIsolatedRunner {
    async fn invoke(
        &self,
        invocation_id: &str,
        payload: InvocationPayload,
    ) -> Result<ResponseOutcome> {
        self.run(invocation_id, payload).await
    }
}

/// Sends the request line, closes stdin and waits for the matching answer.
async fn exchange(
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    invocation_id: &str,
    request: &[u8],
) -> Result<WorkerResponse> {
    stdin.write_all(request).await?;
    stdin.shutdown().await?;
    drop(stdin);

    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerResponse>(&line) {
            Ok(response) if response.id == invocation_id => return Ok(response),
            Ok(response) => {
                tracing::warn!(expected = invocation_id, got = %response.id, "ignoring response for another invocation");
            }
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed worker output");
            }
        }
    }

    Err(Error::Worker {
        message: "worker exited without a response".to_string(),
        status_code: None,
    })
}

async fn reap(child: &mut tokio::process::Child, invocation_id: &str) {
    if let Err(err) = child.kill().await {
        tracing::debug!(id = invocation_id, error = %err, "worker already gone");
    }
}

/// Removes an invocation from the in-flight table when dropped.
struct Registration<'a> {
    table: &'a InFlight,
    id: String,
}

impl<'a> Registration<'a> {
    fn new(table: &'a InFlight, id: &str, pid: Option<u32>) -> Self {
        table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), pid);
        Self {
            table,
            id: id.to_string(),
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> ProcessIsolatedRunner {
        ProcessIsolatedRunner::with_command("sh", ["-c", script])
            .worker_grace(Duration::from_millis(200))
    }

    fn payload() -> InvocationPayload {
        let mut payload = InvocationPayload::new("ns", "fn", "function main() {}");
        payload.async_timeout = Some(100);
        payload
    }

    #[tokio::test]
    async fn test_relays_matching_response() {
        let runner = shell(
            r#"read line; echo '{"id":"other","data":{"status":500}}'; echo 'noise'; echo '{"id":"a1","data":{"status":201,"body":7,"headers":{}}}'"#,
        );
        let outcome = runner.run("a1", payload()).await.unwrap();
        assert_eq!(outcome.status, 201);
        assert_eq!(outcome.body, 7);
        assert!(runner.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_relayed_failure() {
        let runner = shell(r#"read line; echo '{"id":"a2","data":{"error":"An error"}}'; exit 1"#);
        let err = runner.run("a2", payload()).await.unwrap_err();
        assert_eq!(err.to_string(), "An error");
        assert!(matches!(err, Error::Worker { .. }));
    }

    #[tokio::test]
    async fn test_silent_worker_is_a_worker_error() {
        let runner = shell("read line; exit 1");
        let err = runner.run("a3", payload()).await.unwrap_err();
        assert!(err.to_string().contains("without a response"));
    }

    #[tokio::test]
    async fn test_hung_worker_times_out() {
        let runner = shell("read line; sleep 5");
        let err = runner.run("a4", payload()).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.status_code(), Some(408));
        assert!(runner.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_io() {
        let runner = ProcessIsolatedRunner::with_command("/nonexistent/backstage-worker", ["worker"]);
        let err = runner.run("a5", payload()).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
