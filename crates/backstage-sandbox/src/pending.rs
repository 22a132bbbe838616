//! Timers and intervals created by sandboxed code.
//!
//! Each invocation owns one [`PendingResources`]. `setTimeout`/`setInterval`
//! register a handle here before returning its id; `clearTimeout` cancels
//! one; [`PendingResources::release_all`] cancels whatever is left when the
//! invocation ends, whichever way it ends.

use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct PendingTimer {
    delay: Duration,
    repeat: bool,
    cancel: CancellationToken,
}

/// Registry of live timers for one invocation.
///
/// # Examples
///
/// ```
/// use backstage_sandbox::pending::PendingResources;
/// use std::time::Duration;
///
/// let mut pending = PendingResources::new();
/// let id = pending.register(Duration::from_millis(10), false);
/// assert_eq!(pending.len(), 1);
///
/// assert!(pending.clear(id));
/// assert!(pending.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct PendingResources {
    next_id: u32,
    timers: HashMap<u32, PendingTimer>,
}

impl PendingResources {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a timer and returns its id. Ids start at 1.
    pub fn register(&mut self, delay: Duration, repeat: bool) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = self.next_id;
        self.timers.insert(
            id,
            PendingTimer {
                delay,
                repeat,
                cancel: CancellationToken::new(),
            },
        );
        id
    }

    /// Handle for waiting on one period of timer `id`.
    #[must_use]
    pub fn wait_handle(&self, id: u32) -> Option<TimerWait> {
        self.timers.get(&id).map(|timer| TimerWait {
            delay: timer.delay,
            cancel: timer.cancel.clone(),
        })
    }

    /// Records that timer `id` fired; one-shot timers are forgotten.
    pub fn fired(&mut self, id: u32) {
        if self.timers.get(&id).is_some_and(|timer| !timer.repeat) {
            self.timers.remove(&id);
        }
    }

    /// Cancels timer `id`. Returns `false` if it was unknown.
    pub fn clear(&mut self, id: u32) -> bool {
        self.timers.remove(&id).is_some_and(|timer| {
            timer.cancel.cancel();
            true
        })
    }

    /// Cancels every remaining timer and returns how many there were.
    pub fn release_all(&mut self) -> usize {
        let released = self.timers.len();
        for (_, timer) in self.timers.drain() {
            timer.cancel.cancel();
        }
        released
    }

    /// Number of live timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Returns `true` if no timer is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

/// One period of a registered timer.
#[derive(Debug, Clone)]
pub struct TimerWait {
    delay: Duration,
    cancel: CancellationToken,
}

impl TimerWait {
    /// Waits for the delay. Resolves `false` early if the timer is cleared.
    pub async fn wait(self) -> bool {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => !self.cancel.is_cancelled(),
            () = self.cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_fires_after_delay() {
        let mut pending = PendingResources::new();
        let id = pending.register(Duration::from_millis(20), false);
        let wait = pending.wait_handle(id).unwrap();

        assert!(wait.wait().await);
        pending.fired(id);
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_wakes_waiter_with_false() {
        let mut pending = PendingResources::new();
        let id = pending.register(Duration::from_secs(60), false);
        let wait = tokio::spawn(pending.wait_handle(id).unwrap().wait());

        tokio::task::yield_now().await;
        assert!(pending.clear(id));
        assert!(!wait.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_all_cancels_intervals_too() {
        let mut pending = PendingResources::new();
        let interval = pending.register(Duration::from_millis(5), true);
        pending.register(Duration::from_millis(5), false);

        let waiter = pending.wait_handle(interval).unwrap();
        pending.fired(interval);
        assert_eq!(pending.len(), 2);

        assert_eq!(pending.release_all(), 2);
        assert!(pending.is_empty());
        assert!(!waiter.wait().await);
    }

    #[test]
    fn test_ids_are_distinct_and_unknown_clear_is_false() {
        let mut pending = PendingResources::new();
        let a = pending.register(Duration::ZERO, false);
        let b = pending.register(Duration::ZERO, false);
        assert_ne!(a, b);
        assert!(!pending.clear(999));
        assert!(pending.wait_handle(999).is_none());
    }
}
