//! Error types for Backstage functions.
//!
//! One enum covers every failure an invocation can end with. The variants
//! fall into five families:
//!
//! - compile failures (`Compile`), raised before any code runs
//! - syntax/load-time failures found by a dry run (`Syntax`)
//! - failures raised by the sandboxed code itself (`UserCode`, `ScriptTimeout`)
//! - the whole-invocation deadline (`Timeout`, status 408)
//! - host-side failures that are not the user's fault (`Internal` and friends)
//!
//! # Examples
//!
//! ```
//! use backstage_core::{Error, Result};
//!
//! fn load(name: &str) -> Result<()> {
//!     Err(Error::ModuleNotFound {
//!         name: name.to_string(),
//!     })
//! }
//!
//! let err = load("crypto").unwrap_err();
//! assert_eq!(err.to_string(), "Cannot find module 'crypto'");
//! assert!(err.is_user_error());
//! ```

use crate::types::SyntaxReport;
use thiserror::Error;

/// Main error type for Backstage functions.
///
/// All errors in the workspace use this type, so an outcome produced inside a
/// worker process and one produced in-process are handled the same way.
#[derive(Error, Debug)]
pub enum Error {
    /// The source could not be wrapped or parsed into a compiled unit.
    ///
    /// Fatal to that compilation only; the engine instance stays usable.
    #[error("failed to compile {filename}: {message}")]
    Compile {
        /// File name the source was submitted under
        filename: String,
        /// Parser message
        message: String,
    },

    /// A dry run of the source failed before a real invocation was attempted.
    #[error("{}", .0.error)]
    Syntax(SyntaxReport),

    /// Sandboxed code threw or rejected.
    ///
    /// The display form is exactly the thrown message.
    #[error("{message}")]
    UserCode {
        /// Error name reported by the engine, such as `TypeError`
        name: Option<String>,
        /// Thrown message
        message: String,
        /// Status code attached by the thrower, if any
        status_code: Option<u16>,
        /// Raw stack trace, if one was available
        stack: Option<String>,
    },

    /// The synchronous portion of the code ran past its budget.
    #[error("Script execution timed out after {timeout_ms}ms")]
    ScriptTimeout {
        /// Synchronous budget in milliseconds
        timeout_ms: u64,
    },

    /// The invocation did not settle before the completion deadline.
    #[error("Function timeout")]
    Timeout {
        /// Completion deadline in milliseconds
        timeout_ms: u64,
    },

    /// A module name was neither a virtual module nor an allowed host module.
    #[error("Cannot find module '{name}'")]
    ModuleNotFound {
        /// Name exactly as requested
        name: String,
    },

    /// Unexpected host-side failure not attributable to user code.
    #[error("sandbox internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },

    /// A worker process reported a failure or broke the wire protocol.
    #[error("{message}")]
    Worker {
        /// Error string relayed by the worker
        message: String,
        /// Status code relayed by the worker, if any
        status_code: Option<u16>,
    },

    /// Configuration error.
    ///
    /// Raised when configuration is invalid or names something that does
    /// not exist, such as an allow-listed module the host cannot provide.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description of the configuration problem
        message: String,
    },

    /// I/O failure while reading sources or talking to a worker.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {message}")]
    SerializationError {
        /// Description of the serialization failure
        message: String,
        /// Underlying serde error
        #[source]
        source: Option<serde_json::Error>,
    },
}

impl Error {
    /// Shorthand for an [`Error::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for an untagged [`Error::UserCode`].
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_core::Error;
    ///
    /// let err = Error::user("An error");
    /// assert_eq!(err.to_string(), "An error");
    /// assert_eq!(err.status_code(), None);
    /// ```
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::UserCode {
            name: None,
            message: message.into(),
            status_code: None,
            stack: None,
        }
    }

    /// Returns `true` for the completion deadline (status 408).
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_core::Error;
    ///
    /// let err = Error::Timeout { timeout_ms: 5000 };
    /// assert!(err.is_timeout());
    /// assert_eq!(err.to_string(), "Function timeout");
    /// ```
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if the failure is attributable to the submitted code.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::UserCode { .. }
                | Self::ScriptTimeout { .. }
                | Self::Syntax(_)
                | Self::ModuleNotFound { .. }
        )
    }

    /// Returns `true` for infrastructure failures.
    ///
    /// Compile failures count as internal: they happen before the user's code
    /// gets to run and the caller should not retry them as a user error.
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_core::Error;
    ///
    /// assert!(Error::internal("isolate crashed").is_internal());
    /// assert!(!Error::user("boom").is_internal());
    /// ```
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Compile { .. }
                | Self::Internal { .. }
                | Self::Io(_)
                | Self::SerializationError { .. }
        )
    }

    /// Returns `true` if this is a configuration error.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError { .. })
    }

    /// Status code carried by the error, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_core::Error;
    ///
    /// assert_eq!(Error::Timeout { timeout_ms: 10 }.status_code(), Some(408));
    /// assert_eq!(Error::internal("x").status_code(), None);
    /// ```
    #[must_use]
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::Timeout { .. } => Some(408),
            Self::UserCode { status_code, .. } | Self::Worker { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// Short, stable name of the error family, used on the worker wire.
    #[must_use]
    pub const fn kind_tag(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "compile",
            Self::Syntax(_) => "syntax",
            Self::UserCode { .. } | Self::ModuleNotFound { .. } => "user",
            Self::ScriptTimeout { .. } => "script_timeout",
            Self::Timeout { .. } => "timeout",
            Self::Worker { .. } => "worker",
            Self::ConfigError { .. } => "config",
            Self::Internal { .. } | Self::Io(_) | Self::SerializationError { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Result type alias using the workspace error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_displays_thrown_message() {
        let err = Error::UserCode {
            name: Some("Error".into()),
            message: "foo is not defined".into(),
            status_code: None,
            stack: None,
        };
        assert_eq!(err.to_string(), "foo is not defined");
        assert!(err.is_user_error());
        assert!(!err.is_internal());
    }

    #[test]
    fn test_script_timeout_message() {
        let err = Error::ScriptTimeout { timeout_ms: 100 };
        assert_eq!(
            err.to_string(),
            "Script execution timed out after 100ms"
        );
        assert_eq!(err.kind_tag(), "script_timeout");
    }

    #[test]
    fn test_compile_is_internal() {
        let err = Error::Compile {
            filename: "fn.js".into(),
            message: "Unexpected token".into(),
        };
        assert!(err.is_internal());
        assert!(err.to_string().contains("fn.js"));
    }

    #[test]
    fn test_syntax_displays_report_error() {
        let err = Error::Syntax(SyntaxReport {
            error: "SyntaxError: Unexpected token '}'".into(),
            stack: String::new(),
        });
        assert!(err.to_string().starts_with("SyntaxError"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::SerializationError { .. }));
    }
}
