use resilience_machines::{
    BulkheadConfig, CircuitBreakerConfig, CircuitState, Decorators, GuardError, ManualClock,
    Registry, RetryConfig, TimeLimiterConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("upstream failed with {0}")]
struct Upstream(u16);

fn breaker_config(window: usize) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        sliding_window_size: window,
        minimum_number_of_calls: window,
        failure_rate_threshold: 50.0,
        wait_duration_in_open_state: Duration::from_secs(10),
        permitted_number_of_calls_in_half_open_state: 2,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_trip_exactly_once() {
    let opened = Arc::new(AtomicU32::new(0));
    let counter = opened.clone();
    let breaker = resilience_machines::CircuitBreaker::builder("shared")
        .config(breaker_config(20))
        .clock(Arc::new(ManualClock::new()))
        .on_open(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let breaker = breaker.clone();
        tasks.push(tokio::spawn(async move {
            breaker
                .call(|| async { Err::<(), _>(Upstream(503)) })
                .await
        }));
    }

    let mut rejected = 0;
    for task in tasks {
        if task.await.unwrap().unwrap_err().is_call_not_permitted() {
            rejected += 1;
        }
    }

    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.metrics().not_permitted_calls, rejected);
    assert!(rejected <= 64 - 20);
}

#[tokio::test]
async fn registry_instances_compose_into_a_stack() {
    let clock = Arc::new(ManualClock::new());
    let registry = Registry::with_clock(clock.clone())
        .circuit_breaker_defaults(breaker_config(4))
        .retry_defaults(RetryConfig {
            max_attempts: 1,
            ..Default::default()
        })
        .bulkhead_defaults(BulkheadConfig {
            max_concurrent_calls: 2,
            max_wait_duration: Duration::ZERO,
        });

    let breaker = registry.circuit_breaker("orders").unwrap();
    let failing = Arc::new(AtomicU32::new(1));
    let flag = failing.clone();

    let call = Decorators::of(move || {
        let fail = flag.load(Ordering::SeqCst) == 1;
        async move { if fail { Err(Upstream(500)) } else { Ok("order") } }
    })
    .with_retry(&registry.retry("orders").unwrap())
    .with_circuit_breaker(&breaker)
    .with_bulkhead(&registry.bulkhead("orders").unwrap())
    .with_fallback(GuardError::is_call_not_permitted, |_| async { Ok("cached order") })
    .decorate();

    for _ in 0..4 {
        assert!(matches!(call.call().await, Err(GuardError::Execution(Upstream(500)))));
    }
    assert_eq!(registry.circuit_breaker("orders").unwrap().state(), CircuitState::Open);
    assert_eq!(call.call().await.unwrap(), "cached order");

    // Recover through half-open
    failing.store(0, Ordering::SeqCst);
    clock.advance(Duration::from_secs(10));
    assert_eq!(call.call().await.unwrap(), "order");
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_eq!(call.call().await.unwrap(), "order");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn timeout_inside_breaker_counts_and_releases_bulkhead() {
    let registry = Registry::new()
        .circuit_breaker_defaults(breaker_config(2))
        .time_limiter_defaults(TimeLimiterConfig {
            timeout_duration: Duration::from_millis(50),
            cancel_running_future: true,
        })
        .bulkhead_defaults(BulkheadConfig {
            max_concurrent_calls: 1,
            max_wait_duration: Duration::ZERO,
        });
    let breaker = registry.circuit_breaker("slow").unwrap();
    let bulkhead = registry.bulkhead("slow").unwrap();

    let call = Decorators::of(|| async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok::<_, Upstream>(())
    })
    .with_time_limiter(&registry.time_limiter("slow").unwrap())
    .with_circuit_breaker(&breaker)
    .with_bulkhead(&bulkhead)
    .decorate();

    for _ in 0..2 {
        let err = call.call().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(bulkhead.available(), 1);
    }

    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(call.call().await.unwrap_err().is_call_not_permitted());
}
