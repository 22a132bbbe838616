//! Worker command implementation.
//!
//! Serves exactly one invocation over stdin/stdout for a parent running
//! functions with process isolation. Logs go to stderr; stdout carries only
//! the response line.

use backstage_core::cli::ExitCode;
use backstage_sandbox::worker;
use tokio::io::BufReader;
use tracing::debug;

/// Runs the worker command.
pub async fn run() -> ExitCode {
    debug!(pid = std::process::id(), "worker started");
    let code = worker::serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await;
    debug!(%code, "worker finished");
    code
}
