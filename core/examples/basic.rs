//! Basic decorator stack example
//!
//! Run with `RUST_LOG=debug` to see the protections' logs.

use resilience_machines::{
    Bulkhead, CircuitBreaker, Decorators, GuardError, Retry, TimeLimiter,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
#[error("payment gateway returned {0}")]
struct GatewayError(u16);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Decorator Stack Example ===\n");

    let breaker = CircuitBreaker::builder("payment_api")
        .sliding_window_size(4)
        .minimum_number_of_calls(4)
        .failure_rate_threshold(50.0)
        .wait_duration_in_open_state(Duration::from_millis(200))
        .permitted_number_of_calls_in_half_open_state(1)
        // Client errors are the caller's fault, not the gateway's
        .record_if(|ctx| {
            ctx.error
                .downcast_ref::<GatewayError>()
                .is_none_or(|e| e.0 >= 500)
        })
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build()?;
    let retry = Retry::builder("payment_api")
        .max_attempts(2)
        .wait_duration(Duration::from_millis(20))
        .retry_if(|ctx| ctx.error.downcast_ref::<GatewayError>().is_some_and(|e| e.0 >= 500))
        .build()?;
    let limiter = TimeLimiter::builder("payment_api")
        .timeout_duration(Duration::from_millis(100))
        .build()?;
    let bulkhead = Bulkhead::builder("payment_api")
        .max_concurrent_calls(4)
        .build()?;

    let healthy = Arc::new(AtomicU32::new(1));
    let gateway = healthy.clone();
    let call = Decorators::of(move || {
        let up = gateway.load(Ordering::SeqCst) == 1;
        async move {
            if up {
                Ok("payment accepted")
            } else {
                Err(GatewayError(503))
            }
        }
    })
    .with_retry(&retry)
    .with_circuit_breaker(&breaker)
    .with_time_limiter(&limiter)
    .with_bulkhead(&bulkhead)
    .with_fallback(GuardError::is_call_not_permitted, |_| async {
        Ok("payment queued for later")
    })
    .decorate();

    println!("Layers: {:?}\n", call.layers());

    println!("--- Healthy gateway ---");
    println!("✓ {}", call.call().await?);
    println!("State: {}\n", breaker.state());

    println!("--- Gateway down ---");
    healthy.store(0, Ordering::SeqCst);
    for _ in 0..4 {
        match call.call().await {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {}\n", breaker.state());

    println!("--- Gateway recovers ---");
    healthy.store(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    println!("✓ {}", call.call().await?);
    println!("State: {}", breaker.state());

    let metrics = breaker.metrics();
    println!(
        "\nRejected while open: {}, retries that recovered: {}",
        metrics.not_permitted_calls,
        retry.metrics().successful_calls_with_retry
    );

    Ok(())
}
