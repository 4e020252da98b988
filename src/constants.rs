//! Protocol defaults and tuning constants.
//!
//! Everything here can be overridden through [`ConsumerConfig`](crate::config::ConsumerConfig)
//! unless noted otherwise. Durations are milliseconds to match the epoch-ms
//! timestamps stored in lease records.

/// Default lease duration. A lease that has not been renewed within this
/// window is eligible for reclamation by any other instance.
pub const DEFAULT_LEASE_TIMEOUT_MS: i64 = 120_000;

/// Default upper bound on the number of shards one instance will lease,
/// regardless of fair-share arithmetic.
pub const DEFAULT_MAX_SHARDS_PER_INSTANCE: usize = 10;

/// Default maximum records requested per fetch. The stream service may return
/// fewer.
pub const DEFAULT_RECORD_LIMIT: usize = 10_000;

/// Default minimum time between two fetches on the same shard. Prevents read
/// amplification when processing is cheap.
pub const DEFAULT_MIN_PROCESS_TIME_MS: u64 = 1_000;

/// Default zombie threshold: a reader that has not made fetch progress within
/// this window is considered stuck and the process fails fatally.
pub const DEFAULT_MAX_PROCESS_TIME_MS: i64 = 300_000;

/// Default delay between lease acquisition attempts when a scan found no
/// eligible shard or we lost a conditional-write race.
pub const DEFAULT_ACQUIRE_RETRY_DELAY_MS: u64 = 5_000;

/// Default timeout that force-aborts a single `get_records` call. Guards
/// against hung requests that return neither data nor an error.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default heartbeat tick: lease renewals, instance self-renewal, peer reaping
/// and zombie checks all run on this cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Rescan delay once the fair-share quota is met. Longer than the acquire
/// retry delay; absorbs topology and membership changes without hammering the
/// store. Not configurable.
pub const QUOTA_RESCAN_DELAY_MS: u64 = 30_000;

/// Delay before re-fetching a live shard that returned an empty batch.
pub const EMPTY_SHARD_IDLE_DELAY_MS: u64 = 2_500;

/// Fixed retry delay for malformed responses and aborted requests.
pub const MALFORMED_RETRY_DELAY_MS: u64 = 500;

/// Fetch attempt ceiling. Reaching it is fatal; the process is expected to be
/// restarted by its supervisor.
pub const MAX_FETCH_ATTEMPTS: u32 = 10;

/// Jitter window for fetch backoff: `rand[JITTER_MIN, JITTER_MAX] +
/// BACKOFF_STEP_MS * attempt`.
pub const BACKOFF_JITTER_MIN_MS: u64 = 500;
pub const BACKOFF_JITTER_MAX_MS: u64 = 5_000;
pub const BACKOFF_STEP_MS: u64 = 1_000;
