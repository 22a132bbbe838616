//! Per-invocation execution context.
//!
//! An [`ExecutionContext`] is built fresh for every execution and moved into
//! the isolate that runs it. Nothing in it is shared with another
//! invocation except the read-only module resolver.

use crate::compiler::CONTEXT_BINDINGS;
use crate::pending::PendingResources;
use crate::resolver::ModuleResolver;
use crate::response::ResponseSink;
use backstage_core::log::LogSink;
use backstage_core::{ErrorKind, RequestEnvelope};
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;

/// Caller-supplied parts of the `Backstage` namespace object.
#[derive(Debug, Default)]
pub struct BackstageOptions {
    /// Value of `Backstage.request`
    pub request: Option<RequestEnvelope>,
    /// Sink behind `Backstage.response`
    pub response: Option<ResponseSink>,
    /// Extra fields merged into the namespace, such as a `span` handle
    pub extra: Map<String, Value>,
}

impl BackstageOptions {
    /// Options for a real invocation.
    #[must_use]
    pub fn invocation(request: RequestEnvelope, response: ResponseSink) -> Self {
        Self {
            request: Some(request),
            response: Some(response),
            extra: Map::new(),
        }
    }

    /// Adds extra namespace fields.
    #[must_use]
    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra.extend(extra);
        self
    }
}

/// Bindings visible to sandboxed code during one invocation.
pub struct ExecutionContext {
    pub(crate) namespace: Map<String, Value>,
    pub(crate) response: Option<ResponseSink>,
    pub(crate) console: Arc<dyn LogSink>,
    pub(crate) pending: PendingResources,
    pub(crate) resolver: Arc<ModuleResolver>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("namespace", &self.namespace)
            .field("has_response", &self.response.is_some())
            .field("console", &self.console)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// Fields of `Backstage` other than `modules` and `response`.
    #[must_use]
    pub const fn namespace(&self) -> &Map<String, Value> {
        &self.namespace
    }

    /// Merged environment, `Backstage.env`.
    #[must_use]
    pub fn env(&self) -> Option<&Map<String, Value>> {
        self.namespace.get("env").and_then(Value::as_object)
    }

    /// Returns `true` if `Backstage.response` is bound.
    #[must_use]
    pub const fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Timers registered so far.
    #[must_use]
    pub const fn pending(&self) -> &PendingResources {
        &self.pending
    }

    /// Console sink.
    #[must_use]
    pub fn console(&self) -> &Arc<dyn LogSink> {
        &self.console
    }

    /// Description of the context consumed by the isolate bootstrap.
    #[must_use]
    pub fn descriptor(&self) -> Value {
        let errors: Vec<Value> = ErrorKind::ALL
            .iter()
            .map(|kind| json!({ "name": kind.name(), "statusCode": kind.status_code() }))
            .collect();
        json!({
            "namespace": self.namespace,
            "hasResponse": self.response.is_some(),
            "moduleKeys": self.resolver.virtual_keys().collect::<Vec<_>>(),
            "bindings": CONTEXT_BINDINGS,
            "errors": errors,
        })
    }

    pub(crate) fn into_parts(self) -> ContextParts {
        let descriptor = self.descriptor();
        ContextParts {
            descriptor,
            response: self.response,
            console: self.console,
            pending: self.pending,
            resolver: self.resolver,
        }
    }
}

/// Pieces an isolate takes ownership of.
pub(crate) struct ContextParts {
    pub descriptor: Value,
    pub response: Option<ResponseSink>,
    pub console: Arc<dyn LogSink>,
    pub pending: PendingResources,
    pub resolver: Arc<ModuleResolver>,
}
