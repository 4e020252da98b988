//! Consumer configuration.
//!
//! Construction is fallible before any I/O: [`ConsumerConfig::validate`] runs
//! inside [`ShardConsumer::new`](crate::consumer::ShardConsumer::new), so a
//! missing stream name or nonsensical timeout never reaches the store.
//!
//! # Clock Synchronization Requirements
//!
//! Lease expiry and instance TTLs are compared against wall-clock epoch
//! milliseconds written by *other* processes. Run NTP (or equivalent) on every
//! worker host; clock skew approaching `lease_timeout_ms` can produce dual
//! ownership windows.

use std::time::Duration;

use crate::constants::{
    DEFAULT_ACQUIRE_RETRY_DELAY_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LEASE_TIMEOUT_MS,
    DEFAULT_MAX_PROCESS_TIME_MS, DEFAULT_MAX_SHARDS_PER_INSTANCE, DEFAULT_MIN_PROCESS_TIME_MS,
    DEFAULT_RECORD_LIMIT, DEFAULT_REQUEST_TIMEOUT_MS,
};
use crate::error::ConsumerError;
use crate::stream::IteratorPosition;

/// Configuration for a [`ShardConsumer`](crate::consumer::ShardConsumer).
///
/// `stream_name` is the only required field; everything else has defaults
/// matching the protocol constants in [`constants`](crate::constants).
///
/// ```
/// use shardflow::config::ConsumerConfig;
/// use shardflow::stream::IteratorPosition;
///
/// let config = ConsumerConfig {
///     stream_name: "orders".into(),
///     iterator_position: IteratorPosition::TrimHorizon,
///     ..ConsumerConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name of the stream to consume. Required.
    pub stream_name: String,

    /// Where a reader starts on a shard with no checkpoint.
    pub iterator_position: IteratorPosition,

    /// Unique id of this worker process. Defaults to `host-pid-startms`;
    /// override for deterministic tests.
    pub instance_id: String,

    /// Lease duration in ms. Also used as the instance-record TTL.
    pub lease_timeout_ms: i64,

    /// Hard cap on shards held by one instance, on top of fair-share math.
    pub max_shards_per_instance: usize,

    /// Max records per fetch request.
    pub record_limit: usize,

    /// Minimum time between fetches on one shard.
    pub min_process_time_ms: u64,

    /// Zombie threshold: max time a reader may go without fetch progress.
    pub max_process_time_ms: i64,

    /// Delay between acquisition attempts while under quota.
    pub acquire_retry_delay_ms: u64,

    /// Per-request timeout that force-aborts a hung fetch.
    pub request_timeout_ms: u64,

    /// Heartbeat tick driving renewals, reaping and zombie checks.
    pub heartbeat_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            iterator_position: IteratorPosition::Latest,
            instance_id: default_instance_id(),
            lease_timeout_ms: DEFAULT_LEASE_TIMEOUT_MS,
            max_shards_per_instance: DEFAULT_MAX_SHARDS_PER_INSTANCE,
            record_limit: DEFAULT_RECORD_LIMIT,
            min_process_time_ms: DEFAULT_MIN_PROCESS_TIME_MS,
            max_process_time_ms: DEFAULT_MAX_PROCESS_TIME_MS,
            acquire_retry_delay_ms: DEFAULT_ACQUIRE_RETRY_DELAY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

/// `host-pid-startms`, the same shape operators see in lease owner columns.
fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}-{}-{}", std::process::id(), crate::lease::now_ms())
}

impl ConsumerConfig {
    /// Minimal config for `stream_name` with all defaults.
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Self::default()
        }
    }

    /// Build from `SHARDFLOW_*` environment variables.
    ///
    /// Recognized: `SHARDFLOW_STREAM_NAME`, `SHARDFLOW_ITERATOR_POSITION`
    /// (`latest` | `trim_horizon` | `at_timestamp:<epoch_ms>`),
    /// `SHARDFLOW_LEASE_TIMEOUT_MS`, `SHARDFLOW_MAX_SHARDS_PER_INSTANCE`,
    /// `SHARDFLOW_RECORD_LIMIT`, `SHARDFLOW_MIN_PROCESS_TIME_MS`,
    /// `SHARDFLOW_MAX_PROCESS_TIME_MS`, `SHARDFLOW_ACQUIRE_RETRY_DELAY_MS`,
    /// `SHARDFLOW_REQUEST_TIMEOUT_MS`, `SHARDFLOW_HEARTBEAT_INTERVAL_MS`.
    pub fn from_env() -> Result<Self, ConsumerError> {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("SHARDFLOW_STREAM_NAME") {
            config.stream_name = name;
        }
        if let Ok(position) = std::env::var("SHARDFLOW_ITERATOR_POSITION") {
            config.iterator_position = parse_position(&position)?;
        }
        read_env("SHARDFLOW_LEASE_TIMEOUT_MS", &mut config.lease_timeout_ms)?;
        read_env(
            "SHARDFLOW_MAX_SHARDS_PER_INSTANCE",
            &mut config.max_shards_per_instance,
        )?;
        read_env("SHARDFLOW_RECORD_LIMIT", &mut config.record_limit)?;
        read_env("SHARDFLOW_MIN_PROCESS_TIME_MS", &mut config.min_process_time_ms)?;
        read_env("SHARDFLOW_MAX_PROCESS_TIME_MS", &mut config.max_process_time_ms)?;
        read_env(
            "SHARDFLOW_ACQUIRE_RETRY_DELAY_MS",
            &mut config.acquire_retry_delay_ms,
        )?;
        read_env("SHARDFLOW_REQUEST_TIMEOUT_MS", &mut config.request_timeout_ms)?;
        read_env(
            "SHARDFLOW_HEARTBEAT_INTERVAL_MS",
            &mut config.heartbeat_interval_ms,
        )?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency. Called by the orchestrator before any I/O.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.stream_name.is_empty() {
            return Err(ConsumerError::Config("stream_name must be configured".into()));
        }
        if self.instance_id.is_empty() {
            return Err(ConsumerError::Config("instance_id must not be empty".into()));
        }
        if self.lease_timeout_ms <= 0 {
            return Err(ConsumerError::Config("lease_timeout_ms must be positive".into()));
        }
        if self.max_shards_per_instance == 0 {
            return Err(ConsumerError::Config(
                "max_shards_per_instance must be at least 1".into(),
            ));
        }
        if self.record_limit == 0 {
            return Err(ConsumerError::Config("record_limit must be at least 1".into()));
        }
        if self.max_process_time_ms <= 0 {
            return Err(ConsumerError::Config(
                "max_process_time_ms must be positive".into(),
            ));
        }
        if (self.heartbeat_interval_ms as i64) >= self.max_process_time_ms {
            return Err(ConsumerError::Config(
                "heartbeat_interval_ms must be below max_process_time_ms, \
                 or every tick would trip the zombie check"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms.max(0) as u64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn acquire_retry_delay(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_delay_ms)
    }
}

fn parse_position(raw: &str) -> Result<IteratorPosition, ConsumerError> {
    let lowered = raw.to_lowercase();
    match lowered.as_str() {
        "latest" => Ok(IteratorPosition::Latest),
        "trim_horizon" => Ok(IteratorPosition::TrimHorizon),
        other => match other.strip_prefix("at_timestamp:") {
            Some(ts) => ts
                .parse()
                .map(IteratorPosition::AtTimestamp)
                .map_err(|_| ConsumerError::Config(format!("bad AT_TIMESTAMP value: {raw}"))),
            None => Err(ConsumerError::Config(format!(
                "unknown iterator position '{raw}' \
                 (expected latest, trim_horizon or at_timestamp:<epoch_ms>)"
            ))),
        },
    }
}

fn read_env<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<(), ConsumerError> {
    if let Ok(raw) = std::env::var(name) {
        *target = raw
            .parse()
            .map_err(|_| ConsumerError::Config(format!("invalid value for {name}: {raw}")))?;
    }
    Ok(())
}
