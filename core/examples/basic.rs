//! Two breaker instances sharing one store, as two processes would
//!
//! Run with `RUST_LOG=shared_breaker=debug` to see every decision.

use shared_breaker::{
    CallOptions, CircuitBreaker, ExecutionPipeline, MemoryStore, StateChange,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn announce(change: &StateChange<'_>) {
    println!("Circuit '{}': {} -> {}", change.circuit, change.from, change.to);
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Shared Circuit Breaker Example ===\n");

    let store = Arc::new(MemoryStore::new());
    let build = |worker: &str| {
        CircuitBreaker::builder("payment_api")
            .failure_threshold(3)
            .open_duration(Duration::from_secs(2))
            .per_attempt_timeout(Duration::from_millis(500))
            .max_retries(1)
            .backoff(Duration::from_millis(50), Duration::from_millis(200))
            .store(store.clone())
            .fail_closed()
            .on_open(announce)
            .on_half_open(announce)
            .on_close(announce)
            .build()
            .map(|circuit| (worker.to_string(), ExecutionPipeline::new(circuit)))
    };

    let (name_a, worker_a) = match build("worker-a") {
        Ok(pair) => pair,
        Err(e) => return eprintln!("invalid configuration: {}", e),
    };
    let (name_b, worker_b) = match build("worker-b") {
        Ok(pair) => pair,
        Err(e) => return eprintln!("invalid configuration: {}", e),
    };

    println!("--- {} sees failures ---", name_a);
    for i in 1..=2 {
        match worker_a
            .run(move || async move { Err::<String, _>(format!("Payment failed {}", i)) })
            .await
        {
            Ok(_) => println!("Success"),
            Err(e) => println!("{}", e),
        }
    }
    println!();

    println!("--- {} calls the same dependency ---", name_b);
    match worker_b
        .run_with_options(
            || async { Ok::<_, String>("Payment accepted".to_string()) },
            CallOptions::new().with_fallback(|ctx| {
                Ok(format!("Queued for later ({:?})", ctx.state))
            }),
        )
        .await
    {
        Ok(result) => println!("{}", result),
        Err(e) => println!("{}", e),
    }
    println!();

    println!("--- waiting for the open period to pass ---");
    tokio::time::sleep(Duration::from_millis(2_100)).await;

    match worker_a
        .run(|| async { Ok::<_, String>("Payment accepted after recovery") })
        .await
    {
        Ok(result) => println!("{}", result),
        Err(e) => println!("{}", e),
    }

    match worker_b.breaker().state().await {
        Ok(state) => println!("State seen by {}: {}", name_b, state),
        Err(e) => println!("Store error: {}", e),
    }
}
