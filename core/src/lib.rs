//! SharedBreaker - circuit breakers whose state lives in a shared store
//!
//! Every process that protects the same dependency points its breaker at the
//! same key in a `StateStore`, so they all trip and recover together:
//! - Versioned records with compare-and-swap as the only coordination point
//! - Pluggable trip strategies (consecutive failures, error rate, volume drop)
//! - Failure classification deciding which outcomes count
//! - A single half-open probe across all processes
//! - Timeout, retry with jittered backoff, and fallback around each call
//!
//! # Example
//!
//! ```rust
//! use shared_breaker::{CircuitBreaker, ExecutionPipeline};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let circuit = CircuitBreaker::builder("payments")
//!     .failure_threshold(5)
//!     .open_duration(Duration::from_secs(30))
//!     .per_attempt_timeout(Duration::from_secs(2))
//!     .max_retries(2)
//!     .fail_closed()
//!     .on_open(|change| println!("Circuit {} opened!", change.circuit))
//!     .build()
//!     .expect("valid configuration");
//!
//! let pipeline = ExecutionPipeline::new(circuit.clone());
//! let result = pipeline
//!     .run(|| async {
//!         // Your service call here
//!         Ok::<_, String>("charged")
//!     })
//!     .await;
//! assert_eq!(result.unwrap(), "charged");
//!
//! if circuit.is_open().await.unwrap_or(false) {
//!     println!("Circuit is open, skipping call");
//! }
//! # }
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod policy;
pub mod record;
pub mod retry;
pub mod storage;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use builder::CircuitBuilder;
pub use callbacks::{Callbacks, StateChange};
pub use circuit::{CallOptions, CircuitBreaker, FallbackContext, FallbackFn};
pub use classifier::{
    DefaultClassifier, FailureClassifier, FailureContext, Outcome, PredicateClassifier,
    SlowCallClassifier, Verdict,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BreakerConfig, StoreUnavailablePolicy};
pub use errors::{CircuitError, ConfigError, StoreError};
pub use pipeline::ExecutionPipeline;
pub use policy::{BreakerPolicy, Transition};
pub use record::{CircuitRecord, CircuitState, Version, Versioned};
pub use retry::RetryPolicy;
pub use storage::{CasOutcome, MemoryStore, StateStore};

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
