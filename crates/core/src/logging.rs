//! Rate-limited logging.
//!
//! Wraps [`tracing`] the way the rest of the crate does — this module adds
//! no new logging backend, only a guard that decides whether *this* call
//! should actually emit.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Gate that allows at most one log emission per `window`.
pub struct RateLimiter {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    /// Run `f` only if the window has elapsed since the last successful
    /// run; otherwise the call is silently dropped.
    pub fn run(&self, f: impl FnOnce()) {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        let should_run = match *last {
            Some(prev) => now.duration_since(prev) >= self.window,
            None => true,
        };
        if should_run {
            *last = Some(now);
            drop(last);
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn suppresses_within_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let count = AtomicUsize::new(0);
        for _ in 0..5 {
            limiter.run(|| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn allows_after_window_elapses() {
        let limiter = RateLimiter::new(Duration::from_millis(10));
        let count = AtomicUsize::new(0);
        limiter.run(|| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(20));
        limiter.run(|| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
