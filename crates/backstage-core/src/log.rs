//! Logging collaborator interface.
//!
//! The sandboxed `console` forwards every call to a [`LogSink`]. The engine
//! never assumes a transport: the default sink emits `tracing` events, tests
//! collect into a [`MemoryLog`], and [`PrefixLog`] tags lines with the
//! function they came from.
//!
//! # Examples
//!
//! ```
//! use backstage_core::log::{LogSink, MemoryLog, PrefixLog};
//! use std::sync::Arc;
//!
//! let memory = Arc::new(MemoryLog::new(1024));
//! let sink = PrefixLog::new("test", Arc::clone(&memory));
//! sink.log("is info 123");
//!
//! assert_eq!(memory.contents(), "info: [test] is info 123\n");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

/// Console level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.debug`
    Debug,
    /// `console.log`
    Log,
    /// `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

impl LogLevel {
    /// Lowercase name of the level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "log" => Ok(Self::Log),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(crate::Error::ConfigError {
                message: format!("unknown log level '{other}'"),
            }),
        }
    }
}

/// Sink for console output produced by sandboxed code.
pub trait LogSink: Send + Sync + fmt::Debug {
    /// Writes one already formatted line.
    fn write(&self, level: LogLevel, message: &str);

    /// `console.info`
    fn info(&self, message: &str) {
        self.write(LogLevel::Info, message);
    }

    /// `console.log`
    fn log(&self, message: &str) {
        self.write(LogLevel::Log, message);
    }

    /// `console.warn`
    fn warn(&self, message: &str) {
        self.write(LogLevel::Warn, message);
    }

    /// `console.error`
    fn error(&self, message: &str) {
        self.write(LogLevel::Error, message);
    }

    /// `console.debug`
    fn debug(&self, message: &str) {
        self.write(LogLevel::Debug, message);
    }
}

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn write(&self, level: LogLevel, message: &str) {
        (**self).write(level, message);
    }
}

/// Emits console lines as `tracing` events under `backstage::console`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "backstage::console", "{message}"),
            LogLevel::Log | LogLevel::Info => {
                tracing::info!(target: "backstage::console", "{message}");
            }
            LogLevel::Warn => tracing::warn!(target: "backstage::console", "{message}"),
            LogLevel::Error => tracing::error!(target: "backstage::console", "{message}"),
        }
    }
}

/// Prefixes every line with `[name]` and folds `log` into `info`.
#[derive(Debug, Clone)]
pub struct PrefixLog<S> {
    prefix: String,
    inner: S,
}

impl<S: LogSink> PrefixLog<S> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(prefix: impl Into<String>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// The prefix without brackets.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl<S: LogSink> LogSink for PrefixLog<S> {
    fn write(&self, level: LogLevel, message: &str) {
        let level = match level {
            LogLevel::Log => LogLevel::Info,
            other => other,
        };
        self.inner
            .write(level, &format!("[{}] {message}", self.prefix));
    }
}

/// Bounded in-memory collector.
///
/// Lines are stored as `<level>: <message>\n`. Once `max_size` bytes have
/// been written further output is dropped and [`MemoryLog::is_truncated`]
/// turns true.
#[derive(Debug)]
pub struct MemoryLog {
    max_size: usize,
    state: Mutex<MemoryLogState>,
}

#[derive(Debug, Default)]
struct MemoryLogState {
    buffer: String,
    truncated: bool,
}

impl MemoryLog {
    /// Creates an empty collector holding at most `max_size` bytes.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            state: Mutex::new(MemoryLogState::default()),
        }
    }

    /// Everything collected so far.
    #[must_use]
    pub fn contents(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buffer
            .clone()
    }

    /// Collected size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buffer
            .len()
    }

    /// Returns `true` if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once output has been dropped for size.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .truncated
    }

    /// Configured capacity in bytes.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl LogSink for MemoryLog {
    fn write(&self, level: LogLevel, message: &str) {
        let line = format!("{level}: {message}\n");
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let room = self.max_size.saturating_sub(state.buffer.len());
        if line.len() <= room {
            state.buffer.push_str(&line);
            return;
        }
        let mut cut = room;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        state.buffer.push_str(&line[..cut]);
        state.truncated = true;
    }
}
