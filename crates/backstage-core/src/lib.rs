//! Core types, traits, and errors for Backstage functions.
//!
//! This crate provides the foundational types shared by the sandbox engine,
//! the process-isolated runner, and the command-line front end.
//!
//! # Architecture
//!
//! The core consists of:
//! - The request/response boundary (`RequestEnvelope`, `ResponseOutcome`)
//! - The error taxonomy (`ErrorKind`) and the error hierarchy (`Error`)
//! - Engine configuration (`RuntimeConfig`)
//! - The worker wire protocol (`ipc`)
//! - The logging collaborator interface (`log::LogSink`)
//! - The `FunctionExecutor` trait implemented by every execution backend

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

mod config;
mod error;
mod taxonomy;
mod types;

pub mod cli;
pub mod ipc;
pub mod log;
pub mod stats;
pub mod traits;

pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use error::{Error, Result};
pub use taxonomy::{ErrorKind, TaggedError};
pub use types::{
    DEFAULT_STATUS, OMIT_LIST_HEADER, RequestEnvelope, RequestInput, ResponseOutcome,
    SyntaxReport,
};
