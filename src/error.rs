//! Error types for the lease-coordinated consumer.
//!
//! # Error Handling Patterns
//!
//! Three tiers, from routine to fatal:
//!
//! - **Expected races**: [`StoreError::Precondition`] means we lost a
//!   conditional-write race (or ownership was reclaimed). Never fatal; the
//!   surrounding operation retries or gives the shard up.
//! - **Transient transport**: throttling, service unavailability, networking
//!   failures and aborted requests. Retried with backoff up to an attempt cap.
//! - **Fatal**: configuration errors (before any I/O), zombie detection,
//!   retry exhaustion, and errors returned by caller-supplied processing
//!   logic. The process is expected to exit and be restarted by its
//!   supervisor; recovery in place risks dual ownership or double processing.

use thiserror::Error;

/// Result type for consumer operations.
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors surfaced by the lease store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The expected-value predicate did not hold at write time. Expected and
    /// non-fatal: another instance won the race or reclaimed the lease.
    #[error("conditional write precondition failed")]
    Precondition,

    /// The store could not be reached or the call failed in transit.
    #[error("lease store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// Transport failures are worth retrying; precondition failures are a
    /// signal to the state machine, not a retry candidate.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

/// Errors surfaced by the stream service.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Read throughput limit exceeded for the shard.
    #[error("throughput exceeded")]
    Throttled,

    /// The service reported itself unavailable.
    #[error("service unavailable")]
    Unavailable,

    /// The service reported an internal failure.
    #[error("internal service failure")]
    InternalFailure,

    /// Connection-level failure.
    #[error("networking error: {0}")]
    Network(String),

    /// The response could not be parsed, or an expected field was absent.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The request was force-aborted after returning neither data nor error
    /// within the request timeout.
    #[error("request aborted after timeout")]
    Aborted,

    /// Stream or shard does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The iterator token has expired and a new one must be obtained.
    #[error("iterator expired")]
    ExpiredIterator,
}

impl StreamError {
    /// Whether a fetch hitting this error should be retried at all.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamError::Throttled
                | StreamError::Unavailable
                | StreamError::InternalFailure
                | StreamError::Network(_)
                | StreamError::Malformed(_)
                | StreamError::Aborted
        )
    }

    /// Whether the retry uses the fixed short delay instead of jittered
    /// backoff. Malformed payloads and aborted requests are not load-related,
    /// so backing off buys nothing; both still count against the attempt cap.
    pub fn uses_fixed_retry(&self) -> bool {
        matches!(self, StreamError::Malformed(_) | StreamError::Aborted)
    }

    /// Label for retry metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            StreamError::Throttled => "throttled",
            StreamError::Unavailable => "unavailable",
            StreamError::InternalFailure => "internal_failure",
            StreamError::Network(_) => "network",
            StreamError::Malformed(_) => "malformed",
            StreamError::Aborted => "aborted",
            StreamError::NotFound(_) => "not_found",
            StreamError::ExpiredIterator => "expired_iterator",
        }
    }
}

/// Top-level consumer error.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Invalid configuration, detected at construction before any I/O.
    #[error("configuration error: {0}")]
    Config(String),

    /// Lease store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Stream service failure that was not retryable (or not retried).
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A reader stopped making fetch progress for longer than
    /// `max_process_time_ms` while still holding its lease. Renewing the
    /// lease would keep the shard unreclaimable, so this is fatal.
    #[error("zombie reader on shard {shard_id}: no progress for {stalled_ms}ms")]
    ZombieDetected { shard_id: String, stalled_ms: i64 },

    /// The fetch attempt cap was reached on a shard.
    #[error("exhausted {attempts} fetch attempts on shard {shard_id}")]
    ExhaustedRetries { shard_id: String, attempts: u32 },

    /// Caller-supplied processing logic failed. Deliberately not retried:
    /// without an idempotence guarantee a silent retry risks double
    /// processing.
    #[error("processor error on shard {shard_id}: {source}")]
    Processor {
        shard_id: String,
        #[source]
        source: BoxError,
    },

    /// An out-of-band operation was attempted on a shard this instance does
    /// not currently hold.
    #[error("shard {0} is not held by this instance")]
    NotHeld(String),
}

/// Boxed error type for caller-supplied processing logic.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_is_not_transient() {
        assert!(!StoreError::Precondition.is_transient());
        assert!(StoreError::Transport("conn reset".into()).is_transient());
    }

    #[test]
    fn transient_stream_errors() {
        assert!(StreamError::Throttled.is_transient());
        assert!(StreamError::Unavailable.is_transient());
        assert!(StreamError::InternalFailure.is_transient());
        assert!(StreamError::Network("refused".into()).is_transient());
        assert!(StreamError::Aborted.is_transient());
        assert!(StreamError::Malformed("no records field".into()).is_transient());
        assert!(!StreamError::NotFound("stream".into()).is_transient());
        assert!(!StreamError::ExpiredIterator.is_transient());
    }

    #[test]
    fn fixed_retry_classification() {
        assert!(StreamError::Malformed("bad json".into()).uses_fixed_retry());
        assert!(StreamError::Aborted.uses_fixed_retry());
        assert!(!StreamError::Throttled.uses_fixed_retry());
        assert!(!StreamError::Network("refused".into()).uses_fixed_retry());
    }

    #[test]
    fn error_display() {
        let err = ConsumerError::ZombieDetected {
            shard_id: "shard-0001".into(),
            stalled_ms: 301_000,
        };
        let text = err.to_string();
        assert!(text.contains("shard-0001"));
        assert!(text.contains("301000"));
    }
}
