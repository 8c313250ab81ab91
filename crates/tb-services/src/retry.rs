//! Exponential-backoff retry for transient service failures.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::capabilities::{ServiceResponse, ServiceResult};

/// How often, and how patiently, to repeat a service call that answered with
/// a transient failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of calls, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Call once, never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Run `call` until it answers with anything other than a transient
    /// failure, or the attempt budget is spent.
    ///
    /// Errors are returned immediately: they signal misuse, not flakiness.
    pub async fn run<F, Fut>(&self, operation: &str, mut call: F) -> ServiceResult<ServiceResponse>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ServiceResult<ServiceResponse>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let response = call().await?;
            if !response.transient || response.status.is_good() {
                return Ok(response);
            }
            if attempt >= attempts {
                warn!(operation, attempts, "Giving up after transient failures");
                return Ok(response);
            }
            let delay = self.backoff(attempt - 1);
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = response.error().unwrap_or(""),
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ServiceError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tb_types::Status;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            max_attempts: 4,
            ..RetryPolicy::default()
        };
        let response = policy
            .run("provision", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ServiceResponse::transient_failure("throttled"))
            })
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(response.status, Status::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let response = RetryPolicy::default()
            .run("start", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Ok(ServiceResponse::transient_failure("busy"))
                } else {
                    Ok(ServiceResponse::succeeded())
                }
            })
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_and_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let response = RetryPolicy::default()
            .run("stop", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ServiceResponse::failed("no such host"))
            })
            .await
            .unwrap();
        assert_eq!(response.status, Status::Failed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let err = RetryPolicy::default()
            .run("stop", || async {
                Err(ServiceError::MissingParameter {
                    name: "vm_name".into(),
                })
            })
            .await;
        assert!(err.is_err());
    }
}
