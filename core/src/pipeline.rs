//! Timeout, retry and fallback around a breaker
//!
//! Every attempt, the first and each retry, goes through breaker admission
//! and carries its own `per_attempt_timeout`, so a breaker that opens
//! mid-retry stops the loop at the next attempt. The fallback is consulted
//! once, after the loop has given up.

use crate::{
    circuit::{CallOptions, CircuitBreaker},
    errors::CircuitError,
    retry::RetryPolicy,
};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ExecutionPipeline {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ExecutionPipeline {
    /// Retry settings come from the breaker's configuration
    pub fn new(breaker: CircuitBreaker) -> Self {
        let retry = RetryPolicy::from_config(breaker.config());
        Self { breaker, retry }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn run<T, E, F, Fut>(&self, action: F) -> Result<T, CircuitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        self.run_with_options(action, CallOptions::default()).await
    }

    /// Run with a fallback that replaces whatever error the retry loop ends
    /// on, if eligible
    #[tracing::instrument(skip_all, fields(circuit = %self.breaker.name()))]
    pub async fn run_with_options<T, E, F, Fut>(
        &self,
        action: F,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let result = self.attempts(action).await;
        self.settle(result, options)
    }

    /// Like `run_with_options`, but stops as soon as `token` is cancelled,
    /// whether an attempt or a backoff sleep is in progress
    ///
    /// A cancelled attempt is not recorded. If it held the half-open probe,
    /// the slot frees up once its lease runs out.
    pub async fn run_with_cancellation<T, E, F, Fut>(
        &self,
        token: &CancellationToken,
        action: F,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(circuit = %self.breaker.name(), "call cancelled");
                Err(CircuitError::Cancelled {
                    circuit: self.breaker.name().to_string(),
                })
            }
            result = self.attempts(action) => result,
        };
        self.settle(result, options)
    }

    fn settle<T, E>(
        &self,
        result: Result<T, CircuitError<E>>,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>> {
        match (result, options.fallback) {
            (Err(reason), Some(fallback)) if reason.is_fallback_eligible() => {
                self.breaker.fall_back(reason, fallback)
            }
            (result, _) => result,
        }
    }

    async fn attempts<T, E, F, Fut>(&self, mut action: F) -> Result<T, CircuitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;

        loop {
            let err = match self.breaker.call(|| action()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_retryable() && attempt < max_attempts {
                let delay = self.retry.delay(attempt);
                debug!(
                    circuit = %self.breaker.name(),
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            // Only a run of failures that used up every attempt is
            // exhaustion; rejections and store errors keep their own shape
            if attempt == 1 || !err.is_retryable() {
                if attempt > 1 {
                    debug!(circuit = %self.breaker.name(), attempt, error_kind = kind(&err), "retry loop stopped");
                }
                return Err(err);
            }

            warn!(circuit = %self.breaker.name(), attempts = attempt, error_kind = kind(&err), "giving up");
            return Err(CircuitError::RetriesExhausted {
                circuit: self.breaker.name().to_string(),
                attempts: attempt,
                last: Box::new(err),
            });
        }
    }
}

fn kind<E>(err: &CircuitError<E>) -> &'static str {
    match err {
        CircuitError::Failure { .. } => "failure",
        CircuitError::Open { .. } => "open",
        CircuitError::ProbeInFlight { .. } => "probe_in_flight",
        CircuitError::Timeout { .. } => "timeout",
        CircuitError::RetriesExhausted { .. } => "retries_exhausted",
        CircuitError::Store { .. } => "store",
        CircuitError::Cancelled { .. } => "cancelled",
        CircuitError::Execution(_) => "execution",
    }
}
