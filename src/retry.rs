//! Bounded exponential retry for the publish path.
//!
//! Only broker-unreachable failures are retried; anything else propagates
//! on first occurrence. The schedule is `base * 2^attempt`, so with the
//! default one-second base the waits run 2s, 4s, 8s, 16s, 32s.

use std::future::Future;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::bus::{BusError, Result};

/// Retry schedule for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub retry_count: u32,
    /// Unit the exponential schedule is scaled by.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(retry_count: u32) -> Self {
        Self {
            retry_count,
            ..Default::default()
        }
    }

    /// Delay before retry `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// The full backoff schedule, strictly increasing.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.retry_count).map(|attempt| self.delay_for(attempt))
    }
}

/// Drive `send` under the bounded retry policy.
pub(crate) async fn publish_with_retry<F, Fut>(
    policy: &RetryPolicy,
    event_id: Uuid,
    mut send: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut last_error = match send().await {
        Ok(()) => return Ok(()),
        Err(error) if !error.is_retryable() => return Err(error),
        Err(error) => error,
    };

    let mut waited = Duration::ZERO;
    for (retry, delay) in policy.delays().enumerate() {
        waited += delay;
        warn!(
            event_id = %event_id,
            retry = retry + 1,
            backoff_secs = delay.as_secs_f64(),
            waited_secs = waited.as_secs_f64(),
            error = %last_error,
            "Could not publish event, retrying after backoff"
        );
        tokio::time::sleep(delay).await;

        match send().await {
            Ok(()) => return Ok(()),
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => last_error = error,
        }
    }

    Err(BusError::PublishExhausted {
        attempts: policy.retry_count + 1,
        source: Box::new(last_error),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(retry_count: u32) -> RetryPolicy {
        RetryPolicy {
            retry_count,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_schedule_is_strictly_increasing_powers_of_two() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = policy.delays().collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(32),
            ]
        );
        assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn test_always_failing_transport_exhausts_retries() {
        let attempts = AtomicU32::new(0);
        let policy = fast_policy(5);

        let result = publish_with_retry(&policy, Uuid::new_v4(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(BusError::Connection("broker unreachable".to_string())) }
        })
        .await;

        // Initial attempt plus exactly five retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        match result {
            Err(BusError::PublishExhausted { attempts, .. }) => assert_eq!(attempts, 6),
            other => panic!("expected PublishExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_failure_propagates_immediately() {
        let attempts = AtomicU32::new(0);
        let policy = fast_policy(5);

        let result = publish_with_retry(&policy, Uuid::new_v4(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(BusError::Serialization(
                    serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
                ))
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(BusError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let attempts = AtomicU32::new(0);
        let policy = fast_policy(5);

        let result = publish_with_retry(&policy, Uuid::new_v4(), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(BusError::Connection("broker unreachable".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
