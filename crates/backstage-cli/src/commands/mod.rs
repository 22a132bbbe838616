//! Command implementations for the Backstage CLI.
//!
//! Each command module executes its operation and prints its report in the
//! requested output format.

pub mod check;
pub mod completions;
pub mod run;
pub mod worker;
