//! V8 sandbox for Backstage functions.
//!
//! Compiles function source into reusable units and runs each execution in a
//! fresh V8 isolate with its own bindings, module gate, timers and deadline.
//! [`ProcessIsolatedRunner`] adds a process boundary on top by running every
//! invocation in a disposable worker.

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod cache;
pub mod compiler;
pub mod context;
pub mod engine;
pub mod pending;
pub mod resolver;
pub mod response;
pub mod runner;
pub mod timer;
pub mod worker;

mod isolate;

pub use compiler::CompiledUnit;
pub use context::{BackstageOptions, ExecutionContext};
pub use engine::{ExecuteOptions, SandboxEngine};
pub use pending::PendingResources;
pub use resolver::ModuleResolver;
pub use response::{CompletionCallback, ResponseSink};
pub use runner::ProcessIsolatedRunner;
pub use timer::CompletionTimer;
pub use worker::InProcessExecutor;
