//! Statistics snapshots.
//!
//! Engines count executions with atomics and hand out a [`RuntimeStats`]
//! snapshot on request. Snapshots are plain data and serialize to JSON for
//! monitoring.
//!
//! # Examples
//!
//! ```rust
//! use backstage_core::stats::RuntimeStats;
//!
//! let stats = RuntimeStats::new(50, 45, 2, 1, 15000);
//! assert_eq!(stats.successes(), 45);
//! assert!((stats.failure_rate() - 0.06).abs() < 1e-9);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Execution metrics for one engine instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    /// Total number of `execute` calls
    pub total_executions: u32,
    /// Executions that ended with a response
    pub successes: u32,
    /// Executions that ended with an error other than a timeout
    pub failures: u32,
    /// Executions that hit the completion deadline
    pub timeouts: u32,
    /// Sum of execution wall time in microseconds
    pub total_execution_time_us: u64,
    /// Sources that failed to compile
    pub compilation_failures: u32,
    /// Compiled-unit cache hits
    pub cache_hits: u32,
    /// Compiled-unit cache misses
    pub cache_misses: u32,
    /// Timers and intervals still pending when their invocation ended
    #[serde(default)]
    pub released_timers: u32,
}

impl RuntimeStats {
    /// Creates a snapshot from execution counters.
    #[must_use]
    pub const fn new(
        total_executions: u32,
        successes: u32,
        failures: u32,
        timeouts: u32,
        total_execution_time_us: u64,
    ) -> Self {
        Self {
            total_executions,
            successes,
            failures,
            timeouts,
            total_execution_time_us,
            compilation_failures: 0,
            cache_hits: 0,
            cache_misses: 0,
            released_timers: 0,
        }
    }

    /// Adds compile-side counters.
    #[must_use]
    pub const fn with_compilation(
        mut self,
        compilation_failures: u32,
        cache_hits: u32,
        cache_misses: u32,
    ) -> Self {
        self.compilation_failures = compilation_failures;
        self.cache_hits = cache_hits;
        self.cache_misses = cache_misses;
        self
    }

    /// Adds the count of timers released at teardown.
    #[must_use]
    pub const fn with_released_timers(mut self, released_timers: u32) -> Self {
        self.released_timers = released_timers;
        self
    }

    /// Executions that ended with a response.
    #[must_use]
    pub const fn successes(&self) -> u32 {
        self.successes
    }

    /// Share of executions that failed or timed out.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        f64::from(self.failures + self.timeouts) / f64::from(self.total_executions)
    }

    /// Mean wall time per execution.
    #[must_use]
    pub fn avg_execution_time(&self) -> Duration {
        if self.total_executions == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_execution_time_us / u64::from(self.total_executions))
    }
}
