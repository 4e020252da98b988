//! Retry policies for control-plane calls.
//!
//! The shard fetch loop has its own bespoke backoff (the protocol specifies
//! its jitter window and attempt cap exactly, see [`reader`](crate::reader)).
//! Everything else that talks to the lease store or the stream's describe
//! endpoint uses the standardized `backon` policies here, so transient
//! transport blips during startup or heartbeats do not bubble up as fatal
//! errors.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------------------|-----------|-----------|---------|------------------------------|
//! | `store_policy`     | 50ms      | 2s        | 5       | Lease store reads/writes     |
//! | `describe_policy`  | 100ms     | 5s        | 5       | Stream describe calls        |
//!
//! Precondition failures are never retried through these policies; they are
//! protocol signals, not faults.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Policy for lease store transport retries (topology sync, registration,
/// instance listing). Jittered to avoid synchronized retry storms when many
/// workers start together.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for stream describe calls during topology sync.
pub fn describe_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::Retryable;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::StoreError;

    #[tokio::test]
    async fn store_policy_retries_transport_errors() {
        let attempts = AtomicU32::new(0);

        let result = (|| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(StoreError::Transport("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .retry(store_policy())
        .when(StoreError::is_transient)
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn store_policy_never_retries_preconditions() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), StoreError> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Precondition)
        })
        .retry(store_policy())
        .when(StoreError::is_transient)
        .await;

        assert!(matches!(result, Err(StoreError::Precondition)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
