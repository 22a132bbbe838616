//! Worker wire protocol.
//!
//! The parent writes one [`WorkerRequest`] line to the worker's stdin; the
//! worker answers with one [`WorkerResponse`] line on stdout and exits with
//! status 0 on success or 1 on failure. Both lines are single-line JSON.
//!
//! # Examples
//!
//! ```
//! use backstage_core::ipc::{WorkerData, WorkerResponse};
//! use backstage_core::ResponseOutcome;
//! use serde_json::json;
//!
//! let line = r#"{"id":"42","data":{"status":200,"body":10,"headers":{}}}"#;
//! let response: WorkerResponse = serde_json::from_str(line)?;
//! assert_eq!(response.id, "42");
//! assert!(matches!(response.data, WorkerData::Success(ResponseOutcome { status: 200, .. })));
//! # Ok::<(), serde_json::Error>(())
//! ```

use crate::error::Error;
use crate::types::{RequestInput, ResponseOutcome};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Reads an explicit `null` as the type's default.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn object_or_empty<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?
        .filter(|value| !value.is_null())
        .unwrap_or_else(empty_object))
}

/// Everything a worker needs to run one function.
///
/// Collections and objects that are missing or `null` fall back to empty
/// values, and the timeouts treat 0 like a missing value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationPayload {
    /// Invocation id, when the caller embeds it in the payload too
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Function namespace
    pub namespace: String,
    /// Function name inside the namespace
    pub function_name: String,
    /// Environment visible as `Backstage.env`
    #[serde(default, deserialize_with = "null_as_default")]
    pub env: Map<String, Value>,
    /// Host modules the code may require
    #[serde(default, deserialize_with = "null_as_default")]
    pub global_modules: Vec<String>,
    /// Completion deadline in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_timeout: Option<u64>,
    /// Synchronous budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_timeout: Option<u64>,
    /// Configuration visible as `Backstage.config`
    #[serde(default = "empty_object", deserialize_with = "object_or_empty")]
    pub config: Value,
    /// Function source
    pub pre_code: PreCode,
    /// Request data
    #[serde(default, deserialize_with = "null_as_default")]
    pub req: RequestInput,
    /// Per-invocation options
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: InvocationOptions,
    /// Virtual module sources keyed by module key
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub modules: BTreeMap<String, String>,
}

impl InvocationPayload {
    /// Creates a payload with defaults for everything but the source.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        function_name: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            namespace: namespace.into(),
            function_name: function_name.into(),
            env: Map::new(),
            global_modules: Vec::new(),
            async_timeout: None,
            sync_timeout: None,
            config: empty_object(),
            pre_code: PreCode { code: code.into() },
            req: RequestInput::default(),
            options: InvocationOptions::default(),
            modules: BTreeMap::new(),
        }
    }

    /// File name the source is compiled under.
    #[must_use]
    pub fn file_name(&self) -> String {
        code_file_name(&self.namespace, &self.function_name)
    }
}

/// Function source wrapper, kept as an object on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCode {
    /// Source text
    pub code: String,
}

/// Options applied to one invocation only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationOptions {
    /// Console prefix; defaults to the file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Extra environment merged over the engine's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Map<String, Value>>,
}

/// On-disk naming convention for function code.
///
/// # Examples
///
/// ```
/// use backstage_core::ipc::code_file_name;
///
/// assert_eq!(code_file_name("acme", "hello"), "acme/hello.js");
/// ```
#[must_use]
pub fn code_file_name(namespace: &str, function_name: &str) -> String {
    format!("{namespace}/{function_name}.js")
}

/// Line sent from the parent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Correlation id
    pub id: String,
    /// Payload to run
    pub data: InvocationPayload,
}

/// Line sent from the worker back to the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Correlation id copied from the request
    pub id: String,
    /// Outcome
    pub data: WorkerData,
}

/// Success or failure body of a [`WorkerResponse`].
///
/// Failure is tried first: only failure bodies carry an `error` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerData {
    /// `{error, statusCode?, kind?}`
    Failure(WorkerFailure),
    /// A response outcome
    Success(ResponseOutcome),
}

/// Failure body relayed by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFailure {
    /// Error string
    pub error: String,
    /// Status code of the error, if it had one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Error family, see [`Error::kind_tag`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl WorkerFailure {
    /// Captures an error for the wire.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self {
            error: err.to_string(),
            status_code: err.status_code(),
            kind: Some(err.kind_tag().to_string()),
        }
    }

    /// Rebuilds a typed error on the parent side.
    ///
    /// `timeout_ms` is the completion deadline the parent asked for; the wire
    /// does not carry it back.
    #[must_use]
    pub fn into_error(self, timeout_ms: u64) -> Error {
        match self.kind.as_deref() {
            Some("timeout") => Error::Timeout { timeout_ms },
            _ => Error::Worker {
                message: self.error,
                status_code: self.status_code,
            },
        }
    }
}

impl WorkerResponse {
    /// Success line.
    #[must_use]
    pub fn success(id: impl Into<String>, outcome: ResponseOutcome) -> Self {
        Self {
            id: id.into(),
            data: WorkerData::Success(outcome),
        }
    }

    /// Failure line.
    #[must_use]
    pub fn failure(id: impl Into<String>, err: &Error) -> Self {
        Self {
            id: id.into(),
            data: WorkerData::Failure(WorkerFailure::from_error(err)),
        }
    }

    /// Returns `true` if the worker reported success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.data, WorkerData::Success(_))
    }

    /// Converts the line into the invocation's result.
    ///
    /// # Errors
    ///
    /// Returns the relayed failure as an [`Error`].
    pub fn into_result(self, timeout_ms: u64) -> crate::Result<ResponseOutcome> {
        match self.data {
            WorkerData::Success(outcome) => Ok(outcome),
            WorkerData::Failure(failure) => Err(failure.into_error(timeout_ms)),
        }
    }
}
