//! Backstage CLI library.
//!
//! Exposes the argument definitions, commands, configuration loading and
//! output formatters of the `backstage` binary so they can be tested.

#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod formatters;

pub use cli::{Cli, Commands, LogFormat, RunArgs};
