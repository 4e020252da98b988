//! Prometheus metrics for lease coordination and shard reading.
//!
//! Counters are registered against the default registry; embedders that
//! expose `/metrics` elsewhere in the process pick them up automatically.
//! Recording helpers never fail: a metrics problem must not take down the
//! consumer.

use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGaugeVec, register_int_counter_vec, register_int_gauge_vec};

/// Lease lifecycle transitions observed by this instance.
/// Labels: outcome ∈ {acquired, lost_race, renewed, revoked, completed}.
pub static LEASE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shardflow_lease_transitions_total",
        "Lease lifecycle transitions observed by this instance",
        &["outcome"]
    )
    .expect("register shardflow_lease_transitions_total")
});

/// Fetch retries by error class.
pub static FETCH_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shardflow_fetch_retries_total",
        "Shard fetch retries by error class",
        &["class"]
    )
    .expect("register shardflow_fetch_retries_total")
});

/// Checkpoints persisted, by trigger (batch or external).
pub static CHECKPOINTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shardflow_checkpoints_total",
        "Checkpoints persisted to the lease store",
        &["trigger"]
    )
    .expect("register shardflow_checkpoints_total")
});

/// Shards currently held, per stream.
pub static HELD_SHARDS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "shardflow_held_shards",
        "Shards currently held by this instance",
        &["stream"]
    )
    .expect("register shardflow_held_shards")
});

pub fn record_lease_transition(outcome: &str) {
    LEASE_TRANSITIONS.with_label_values(&[outcome]).inc();
}

pub fn record_fetch_retry(class: &str) {
    FETCH_RETRIES.with_label_values(&[class]).inc();
}

pub fn record_checkpoint(trigger: &str) {
    CHECKPOINTS.with_label_values(&[trigger]).inc();
}

pub fn set_held_shards(stream: &str, count: usize) {
    HELD_SHARDS.with_label_values(&[stream]).set(count as i64);
}
