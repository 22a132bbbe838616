//! Execution backend abstraction.

use crate::Result;
use crate::ipc::InvocationPayload;
use crate::types::ResponseOutcome;
use async_trait::async_trait;

/// Runs one function invocation to a single outcome.
///
/// Implemented by the in-process engine and by the process-isolated runner,
/// so callers can choose the isolation level without changing their code.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use backstage_core::ipc::InvocationPayload;
/// use backstage_core::traits::FunctionExecutor;
/// use backstage_core::{ResponseOutcome, Result};
/// use serde_json::json;
///
/// #[derive(Debug)]
/// struct Echo;
///
/// #[async_trait]
/// impl FunctionExecutor for Echo {
///     async fn invoke(&self, _id: &str, payload: InvocationPayload) -> Result<ResponseOutcome> {
///         Ok(ResponseOutcome::ok(json!(payload.function_name)))
///     }
/// }
/// ```
#[async_trait]
pub trait FunctionExecutor: Send + Sync + std::fmt::Debug {
    /// Runs `payload` under the correlation id `invocation_id`.
    ///
    /// # Errors
    ///
    /// Returns the invocation's failure: user-code errors, timeouts, or
    /// infrastructure failures.
    async fn invoke(&self, invocation_id: &str, payload: InvocationPayload)
    -> Result<ResponseOutcome>;
}
