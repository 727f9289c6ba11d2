//! Time source and scheduler abstraction
//!
//! Every component reads the current instant and suspends through a [`Clock`],
//! so tests can drive time explicitly instead of sleeping.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Supplies monotonic time and cancellable delays
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current monotonic instant
    fn now(&self) -> Instant;

    /// Suspend for `duration`. Dropping the future cancels the wait.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by the tokio timer
///
/// Reads `tokio::time::Instant`, so a runtime started with paused time
/// (`#[tokio::test(start_paused = true)]`) controls it as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually advanced clock for deterministic tests
///
/// Time only moves when [`ManualClock::advance`] is called. Pending sleeps
/// complete once the clock has been advanced past their deadline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    start: Instant,
    elapsed: Arc<watch::Sender<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let (elapsed, _) = watch::channel(Duration::ZERO);
        Self {
            start: Instant::now(),
            elapsed: Arc::new(elapsed),
        }
    }

    /// Move time forward, waking every sleep whose deadline has passed
    pub fn advance(&self, duration: Duration) {
        self.elapsed.send_modify(|elapsed| *elapsed += duration);
    }

    /// Convenience for `advance(Duration::from_millis(millis))`
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Total time advanced since creation
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.borrow()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let deadline = self.elapsed().saturating_add(duration);
        let mut rx = self.elapsed.subscribe();

        Box::pin(async move {
            loop {
                let reached = *rx.borrow_and_update() >= deadline;
                if reached || rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let t0 = clock.now();

        clock.advance_millis(250);
        clock.advance(Duration::from_secs(1));

        assert_eq!(clock.now() - t0, Duration::from_millis(1250));
        assert_eq!(clock.elapsed(), Duration::from_millis(1250));
    }

    #[test]
    fn test_manual_sleep_waits_for_advance() {
        let clock = ManualClock::new();
        let mut sleep = clock.sleep(Duration::from_millis(100));

        assert!((&mut sleep).now_or_never().is_none());

        clock.advance_millis(99);
        assert!((&mut sleep).now_or_never().is_none());

        clock.advance_millis(1);
        assert!(sleep.now_or_never().is_some());
    }

    #[test]
    fn test_manual_sleep_saturates_huge_durations() {
        let clock = ManualClock::new();
        clock.advance_millis(1);
        let mut sleep = clock.sleep(Duration::MAX);

        clock.advance(Duration::from_secs(86_400));
        assert!((&mut sleep).now_or_never().is_none());
    }

    #[test]
    fn test_manual_zero_sleep_is_ready() {
        let clock = ManualClock::new();
        assert!(clock.sleep(Duration::ZERO).now_or_never().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock;
        let t0 = clock.now();

        clock.sleep(Duration::from_secs(5)).await;

        assert!(clock.now() - t0 >= Duration::from_secs(5));
    }
}
