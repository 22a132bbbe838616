//! Whole-invocation deadline.
//!
//! A [`CompletionTimer`] holds any number of pending expiry callbacks that all
//! share one timeout. Clearing it cancels every callback that has not fired
//! yet; dropping it clears it.

use std::time::Duration;
use tokio::task::JoinHandle;

/// Clearable set of deadline callbacks sharing one timeout.
///
/// Callbacks run on the tokio runtime that was current when they were added.
///
/// # Examples
///
/// ```
/// use backstage_sandbox::timer::CompletionTimer;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&fired);
///
/// let mut timer = CompletionTimer::new(Duration::from_millis(10));
/// timer.add(move || flag.store(true, Ordering::SeqCst));
/// timer.clear();
///
/// tokio::time::sleep(Duration::from_millis(30)).await;
/// assert!(!fired.load(Ordering::SeqCst));
/// # }
/// ```
#[derive(Debug)]
pub struct CompletionTimer {
    timeout: Duration,
    timeouts: Vec<JoinHandle<()>>,
}

impl CompletionTimer {
    /// Creates an empty timer.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timeouts: Vec::new(),
        }
    }

    /// Arms `callback` to run once the timeout elapses.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn add<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce() + Send + 'static,
    {
        let timeout = self.timeout;
        self.timeouts.push(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            callback();
        }));
        self
    }

    /// Cancels every callback that has not fired.
    pub fn clear(&mut self) -> &mut Self {
        for handle in self.timeouts.drain(..) {
            handle.abort();
        }
        self
    }

    /// Number of callbacks armed since the last clear.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timeouts.len()
    }

    /// Returns `true` if nothing is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }

    /// The shared timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for CompletionTimer {
    fn drop(&mut self) {
        self.clear();
    }
}
