//! Sliding windows for call outcome aggregation
//!
//! This module provides the two window flavours a circuit breaker evaluates:
//! - `CountWindow`: ring buffer over the last N calls
//! - `TimeWindow`: per-bucket counters over the last N time buckets
//!
//! Both keep running totals so rate queries are O(1).

use crate::clock::Clock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A single completed call
///
/// `ignored` samples only feed the slow-call axis; they never enter the
/// failure-rate denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub failed: bool,
    pub slow: bool,
    pub ignored: bool,
}

impl Sample {
    pub fn success() -> Self {
        Self {
            failed: false,
            slow: false,
            ignored: false,
        }
    }

    pub fn failure() -> Self {
        Self {
            failed: true,
            slow: false,
            ignored: false,
        }
    }

    /// An error the classifier chose not to record
    pub fn ignored() -> Self {
        Self {
            failed: false,
            slow: false,
            ignored: true,
        }
    }

    pub fn slow(mut self) -> Self {
        self.slow = true;
        self
    }
}

/// Aggregated counts of a window
///
/// `total`/`failed` cover recorded calls only. `measured`/`slow` cover every
/// completed call, ignored errors included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    pub total: usize,
    pub failed: usize,
    pub measured: usize,
    pub slow: usize,
}

impl WindowCounts {
    fn add(&mut self, sample: Sample) {
        if !sample.ignored {
            self.total += 1;
            self.failed += sample.failed as usize;
        }
        self.measured += 1;
        self.slow += sample.slow as usize;
    }

    fn subtract(&mut self, other: &WindowCounts) {
        self.total -= other.total;
        self.failed -= other.failed;
        self.measured -= other.measured;
        self.slow -= other.slow;
    }

    /// Failure percentage of recorded calls, or `None` below `minimum_calls`
    pub fn failure_rate(&self, minimum_calls: usize) -> Option<f64> {
        rate(self.failed, self.total, minimum_calls)
    }

    /// Slow-call percentage of all completed calls, or `None` below `minimum_calls`
    pub fn slow_call_rate(&self, minimum_calls: usize) -> Option<f64> {
        rate(self.slow, self.measured, minimum_calls)
    }
}

fn rate(count: usize, denominator: usize, minimum_calls: usize) -> Option<f64> {
    if denominator == 0 || denominator < minimum_calls {
        return None;
    }
    Some(count as f64 * 100.0 / denominator as f64)
}

/// Count-based window holding the last `capacity` samples
///
/// The two axes keep separate rings so an ignored call can push out an old
/// slowness sample without evicting a recorded outcome.
#[derive(Debug, Clone, Default)]
pub struct CountWindow {
    capacity: usize,
    minimum_calls: usize,
    /// `failed` flag of each recorded call
    recorded: VecDeque<bool>,
    /// `slow` flag of each completed call
    measured: VecDeque<bool>,
    counts: WindowCounts,
}

impl CountWindow {
    /// `minimum_calls` is clamped to `capacity`
    pub fn new(capacity: usize, minimum_calls: usize) -> Self {
        Self {
            capacity,
            minimum_calls: minimum_calls.min(capacity),
            recorded: VecDeque::with_capacity(capacity),
            measured: VecDeque::with_capacity(capacity),
            counts: WindowCounts::default(),
        }
    }

    pub fn record(&mut self, sample: Sample) {
        if self.capacity == 0 {
            return;
        }
        if self.measured.len() == self.capacity
            && let Some(slow) = self.measured.pop_front()
        {
            self.counts.measured -= 1;
            self.counts.slow -= slow as usize;
        }
        self.measured.push_back(sample.slow);
        self.counts.measured += 1;
        self.counts.slow += sample.slow as usize;

        if sample.ignored {
            return;
        }
        if self.recorded.len() == self.capacity
            && let Some(failed) = self.recorded.pop_front()
        {
            self.counts.total -= 1;
            self.counts.failed -= failed as usize;
        }
        self.recorded.push_back(sample.failed);
        self.counts.total += 1;
        self.counts.failed += sample.failed as usize;
    }

    pub fn counts(&self) -> WindowCounts {
        self.counts
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn minimum_calls(&self) -> usize {
        self.minimum_calls
    }

    pub fn reset(&mut self) {
        self.recorded.clear();
        self.measured.clear();
        self.counts = WindowCounts::default();
    }
}

/// Time-based window of `bucket_count` buckets of `bucket_duration` each
#[derive(Debug, Clone)]
pub struct TimeWindow {
    bucket_duration: Duration,
    minimum_calls: usize,
    buckets: Vec<WindowCounts>,
    head: usize,
    head_started_at: Instant,
    counts: WindowCounts,
    clock: Arc<dyn Clock>,
}

impl TimeWindow {
    pub fn new(
        bucket_duration: Duration,
        bucket_count: usize,
        minimum_calls: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bucket_count = bucket_count.max(1);
        Self {
            bucket_duration: bucket_duration.max(Duration::from_nanos(1)),
            minimum_calls,
            buckets: vec![WindowCounts::default(); bucket_count],
            head: 0,
            head_started_at: clock.now(),
            counts: WindowCounts::default(),
            clock,
        }
    }

    /// Rotate the ring forward to the bucket containing `now`, clearing
    /// every bucket that fell out of the window on the way
    fn advance(&mut self) {
        let now = self.clock.now();
        let bucket_nanos = self.bucket_duration.as_nanos();
        let elapsed = now.saturating_duration_since(self.head_started_at).as_nanos();
        let steps = elapsed / bucket_nanos;
        if steps == 0 {
            return;
        }

        let len = self.buckets.len();
        if steps >= len as u128 {
            self.buckets.iter_mut().for_each(|b| *b = WindowCounts::default());
            self.counts = WindowCounts::default();
        } else {
            for _ in 0..steps {
                self.head = (self.head + 1) % len;
                let stale = std::mem::take(&mut self.buckets[self.head]);
                self.counts.subtract(&stale);
            }
        }

        let skipped = u64::try_from(steps * bucket_nanos).unwrap_or(u64::MAX);
        self.head_started_at += Duration::from_nanos(skipped);
    }

    pub fn record(&mut self, sample: Sample) {
        self.advance();
        self.buckets[self.head].add(sample);
        self.counts.add(sample);
    }

    pub fn counts(&mut self) -> WindowCounts {
        self.advance();
        self.counts
    }

    pub fn minimum_calls(&self) -> usize {
        self.minimum_calls
    }

    pub fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = WindowCounts::default());
        self.counts = WindowCounts::default();
        self.head_started_at = self.clock.now();
    }
}

/// Sliding window used by a circuit breaker
#[derive(Debug, Clone)]
pub enum SlidingWindow {
    CountBased(CountWindow),
    TimeBased(TimeWindow),
}

impl SlidingWindow {
    pub fn count_based(capacity: usize, minimum_calls: usize) -> Self {
        SlidingWindow::CountBased(CountWindow::new(capacity, minimum_calls))
    }

    pub fn time_based(
        bucket_duration: Duration,
        bucket_count: usize,
        minimum_calls: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        SlidingWindow::TimeBased(TimeWindow::new(
            bucket_duration,
            bucket_count,
            minimum_calls,
            clock,
        ))
    }

    pub fn record(&mut self, sample: Sample) {
        match self {
            SlidingWindow::CountBased(w) => w.record(sample),
            SlidingWindow::TimeBased(w) => w.record(sample),
        }
    }

    pub fn snapshot(&mut self) -> WindowCounts {
        match self {
            SlidingWindow::CountBased(w) => w.counts(),
            SlidingWindow::TimeBased(w) => w.counts(),
        }
    }

    pub fn minimum_calls(&self) -> usize {
        match self {
            SlidingWindow::CountBased(w) => w.minimum_calls(),
            SlidingWindow::TimeBased(w) => w.minimum_calls(),
        }
    }

    pub fn total_calls(&mut self) -> usize {
        self.snapshot().total
    }

    pub fn failure_rate(&mut self) -> Option<f64> {
        let minimum = self.minimum_calls();
        self.snapshot().failure_rate(minimum)
    }

    pub fn slow_call_rate(&mut self) -> Option<f64> {
        let minimum = self.minimum_calls();
        self.snapshot().slow_call_rate(minimum)
    }

    pub fn reset(&mut self) {
        match self {
            SlidingWindow::CountBased(w) => w.reset(),
            SlidingWindow::TimeBased(w) => w.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_count_window_record_and_count() {
        let mut window = SlidingWindow::count_based(10, 1);

        window.record(Sample::success());
        window.record(Sample::success());
        window.record(Sample::failure());

        let counts = window.snapshot();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.slow, 0);
    }

    #[test]
    fn test_count_window_evicts_oldest() {
        let capacity = 5;
        let mut window = SlidingWindow::count_based(capacity, capacity);

        // Five failures followed by seven successes: only the last five remain
        for _ in 0..5 {
            window.record(Sample::failure());
        }
        for k in 0..7 {
            window.record(Sample::success());
            assert_eq!(window.total_calls(), capacity, "after {} extra records", k + 1);
        }

        assert_eq!(window.failure_rate(), Some(0.0));
    }

    #[test]
    fn test_count_window_rate_undefined_below_minimum() {
        let mut window = SlidingWindow::count_based(10, 4);

        window.record(Sample::failure());
        window.record(Sample::failure());
        window.record(Sample::failure());
        assert_eq!(window.failure_rate(), None);
        assert_eq!(window.slow_call_rate(), None);

        window.record(Sample::success());
        assert_eq!(window.failure_rate(), Some(75.0));
    }

    #[test]
    fn test_count_window_minimum_clamped_to_capacity() {
        let window = CountWindow::new(5, 100);
        assert_eq!(window.minimum_calls(), 5);
    }

    #[test]
    fn test_slow_calls_are_independent_of_failures() {
        let mut window = SlidingWindow::count_based(4, 4);

        window.record(Sample::success().slow());
        window.record(Sample::failure().slow());
        window.record(Sample::success());
        window.record(Sample::success());

        assert_eq!(window.failure_rate(), Some(25.0));
        assert_eq!(window.slow_call_rate(), Some(50.0));
    }

    #[test]
    fn test_ignored_samples_only_feed_slow_axis() {
        let mut window = SlidingWindow::count_based(4, 2);

        window.record(Sample::failure());
        window.record(Sample::success());
        for _ in 0..4 {
            window.record(Sample::ignored().slow());
        }

        // Recorded outcomes survive; slowness ring holds the last four calls
        let counts = window.snapshot();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.measured, 4);
        assert_eq!(window.failure_rate(), Some(50.0));
        assert_eq!(window.slow_call_rate(), Some(100.0));
    }

    #[test]
    fn test_time_window_counts_ignored_slowness() {
        let clock = Arc::new(ManualClock::new());
        let mut window = SlidingWindow::time_based(Duration::from_secs(1), 2, 2, clock.clone());

        window.record(Sample::ignored().slow());
        window.record(Sample::success());
        assert_eq!(window.failure_rate(), None);
        assert_eq!(window.slow_call_rate(), Some(50.0));

        clock.advance_millis(2000);
        assert_eq!(window.snapshot(), WindowCounts::default());
    }

    #[test]
    fn test_count_window_reset() {
        let mut window = SlidingWindow::count_based(3, 1);
        window.record(Sample::failure());
        window.reset();
        assert_eq!(window.total_calls(), 0);
        assert_eq!(window.failure_rate(), None);
    }

    #[test]
    fn test_zero_capacity_window_records_nothing() {
        let mut window = CountWindow::new(0, 0);
        window.record(Sample::failure());
        assert_eq!(window.counts().total, 0);
    }

    #[test]
    fn test_time_window_evicts_stale_buckets() {
        let clock = Arc::new(ManualClock::new());
        let mut window =
            SlidingWindow::time_based(Duration::from_secs(1), 3, 1, clock.clone());

        window.record(Sample::failure());
        clock.advance_millis(1000);
        window.record(Sample::success());
        clock.advance_millis(1000);
        window.record(Sample::success());
        assert_eq!(window.total_calls(), 3);

        // First bucket (the failure) rotates out
        clock.advance_millis(1000);
        let counts = window.snapshot();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.failed, 0);
    }

    #[test]
    fn test_time_window_same_bucket_accumulates() {
        let clock = Arc::new(ManualClock::new());
        let mut window =
            SlidingWindow::time_based(Duration::from_secs(1), 2, 1, clock.clone());

        window.record(Sample::failure());
        clock.advance_millis(400);
        window.record(Sample::failure());
        clock.advance_millis(400);
        window.record(Sample::success());

        assert_eq!(window.snapshot().failed, 2);
        assert_eq!(window.total_calls(), 3);
    }

    #[test]
    fn test_time_window_long_idle_clears_everything() {
        let clock = Arc::new(ManualClock::new());
        let mut window =
            SlidingWindow::time_based(Duration::from_millis(100), 10, 1, clock.clone());

        for _ in 0..20 {
            window.record(Sample::failure());
        }
        clock.advance(Duration::from_secs(3600));

        assert_eq!(window.total_calls(), 0);
        assert_eq!(window.failure_rate(), None);

        window.record(Sample::success());
        assert_eq!(window.failure_rate(), Some(0.0));
    }
}
