//! Per-instance event streams
//!
//! Every protection owns one broadcast channel. Monitoring code subscribes to
//! it; publishing never blocks and is a no-op without subscribers.

use crate::CircuitState;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber before lagging
pub const DEFAULT_EVENT_BUFFER: usize = 128;

/// An event emitted by a named protection instance
#[derive(Debug, Clone, PartialEq)]
pub struct Event<K> {
    pub instance: String,
    pub created_at: Instant,
    pub kind: K,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerEventKind {
    Success { duration: Duration },
    Error { duration: Duration },
    IgnoredError { duration: Duration },
    NotPermitted { state: CircuitState },
    StateTransition { from: CircuitState, to: CircuitState },
    FailureRateExceeded { failure_rate: f64 },
    SlowCallRateExceeded { slow_call_rate: f64 },
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryEventKind {
    /// Attempt `attempt` failed and the next one starts after `wait`
    Retry { attempt: u32, wait: Duration },
    /// Succeeded after at least one retry
    Success { attempts: u32 },
    /// Gave up after `attempts` with a retryable error
    Error { attempts: u32 },
    /// Stopped on a non-retryable error
    IgnoredError { attempt: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkheadEventKind {
    CallPermitted,
    CallRejected,
    CallFinished,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeLimiterEventKind {
    Success,
    Error,
    Timeout,
}

pub(crate) struct EventPublisher<K> {
    instance: String,
    sender: broadcast::Sender<Event<K>>,
}

impl<K: Clone> EventPublisher<K> {
    pub(crate) fn new(instance: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            instance: instance.to_string(),
            sender,
        }
    }

    pub(crate) fn publish(&self, created_at: Instant, kind: K) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        let _ = self.sender.send(Event {
            instance: self.instance.clone(),
            created_at,
            kind,
        });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event<K>> {
        self.sender.subscribe()
    }
}

impl<K> std::fmt::Debug for EventPublisher<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("instance", &self.instance)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let publisher = EventPublisher::<BulkheadEventKind>::new("db", 4);
        publisher.publish(Instant::now(), BulkheadEventKind::CallPermitted);
    }

    #[test]
    fn test_subscribers_receive_in_order() {
        let publisher = EventPublisher::new("db", 4);
        let mut rx = publisher.subscribe();

        publisher.publish(Instant::now(), BulkheadEventKind::CallPermitted);
        publisher.publish(Instant::now(), BulkheadEventKind::CallFinished);

        let first = rx.try_recv().expect("first event");
        assert_eq!(first.instance, "db");
        assert_eq!(first.kind, BulkheadEventKind::CallPermitted);
        assert_eq!(
            rx.try_recv().expect("second event").kind,
            BulkheadEventKind::CallFinished
        );
    }
}
