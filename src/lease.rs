//! Durable lease and instance records, and the conditional-write vocabulary.
//!
//! A [`ShardLease`] is the single durable record per shard. It is created once
//! by topology sync and then mutated only through conditional writes: the
//! caller describes the change as a [`LeaseUpdate`] and the state it expects
//! as an [`Expected`] predicate, and the store evaluates both atomically.
//! That predicate evaluation is the system's sole mutual-exclusion mechanism;
//! there is no in-process locking between instances.

use serde::{Deserialize, Serialize};

/// Current epoch time in milliseconds. All durable timestamps use this base.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Lifecycle state of a shard lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    /// Never leased, or explicitly released. Eligible for acquisition.
    Available,
    /// Held by `owner` until `expires_at`. Eligible again once expired.
    Leased,
    /// The shard was read to the end. Terminal; never re-leased.
    Complete,
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseStatus::Available => write!(f, "available"),
            LeaseStatus::Leased => write!(f, "leased"),
            LeaseStatus::Complete => write!(f, "complete"),
        }
    }
}

/// One durable record per shard, keyed by shard id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardLease {
    pub shard_id: String,
    pub status: LeaseStatus,
    /// Instance currently (or last) holding the lease.
    pub owner: Option<String>,
    /// Epoch ms after which the lease may be reclaimed. 0 for fresh records.
    pub expires_at: i64,
    /// Epoch ms of the last successful mutation.
    pub updated_at: i64,
    /// Incremented on every renewal; useful for operator inspection.
    pub heartbeat_counter: u64,
    /// Opaque ordered resume token; `None` until the first checkpoint.
    pub checkpoint: Option<String>,
    pub hash_key_start: String,
    pub hash_key_end: String,
    pub parent_shard_id: Option<String>,
}

impl ShardLease {
    /// A fresh, never-leased record as written by topology sync.
    pub fn new_available(
        shard_id: impl Into<String>,
        hash_key_start: impl Into<String>,
        hash_key_end: impl Into<String>,
        parent_shard_id: Option<String>,
    ) -> Self {
        Self {
            shard_id: shard_id.into(),
            status: LeaseStatus::Available,
            owner: None,
            expires_at: 0,
            updated_at: now_ms(),
            heartbeat_counter: 0,
            checkpoint: None,
            hash_key_start: hash_key_start.into(),
            hash_key_end: hash_key_end.into(),
            parent_shard_id,
        }
    }

    /// Whether this lease can be taken at `now`: available, or leased but
    /// expired. Complete shards are never eligible.
    pub fn is_eligible(&self, now: i64) -> bool {
        match self.status {
            LeaseStatus::Available => true,
            LeaseStatus::Leased => self.expires_at <= now,
            LeaseStatus::Complete => false,
        }
    }

    pub fn is_owned_by(&self, instance_id: &str) -> bool {
        self.owner.as_deref() == Some(instance_id)
    }
}

/// One record per live worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    /// Epoch ms after which any worker may garbage-collect this record.
    pub expires_at: i64,
    pub heartbeat_counter: u64,
}

impl InstanceRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at < now
    }
}

/// Attribute mutation applied by a conditional update. Fields left `None` are
/// untouched; the store stamps `updated_at` on every successful write.
#[derive(Debug, Clone, Default)]
pub struct LeaseUpdate {
    pub status: Option<LeaseStatus>,
    pub owner: Option<String>,
    pub expires_at: Option<i64>,
    pub checkpoint: Option<String>,
    pub bump_heartbeat: bool,
}

impl LeaseUpdate {
    /// Take the lease: `status=leased, owner=self, expires_at=now+timeout`.
    pub fn acquire(instance_id: &str, expires_at: i64) -> Self {
        Self {
            status: Some(LeaseStatus::Leased),
            owner: Some(instance_id.to_string()),
            expires_at: Some(expires_at),
            ..Default::default()
        }
    }

    /// Renew the lease: push the expiry forward and bump the counter.
    pub fn renew(expires_at: i64) -> Self {
        Self {
            expires_at: Some(expires_at),
            bump_heartbeat: true,
            ..Default::default()
        }
    }

    /// Persist a checkpoint. Also extends the lease; a checkpoint is proof of
    /// progress, so treating it as a renewal saves a round trip.
    pub fn checkpoint(sequence: &str, expires_at: i64) -> Self {
        Self {
            checkpoint: Some(sequence.to_string()),
            expires_at: Some(expires_at),
            ..Default::default()
        }
    }

    /// Terminal transition once the shard is exhausted.
    pub fn complete() -> Self {
        Self {
            status: Some(LeaseStatus::Complete),
            ..Default::default()
        }
    }
}

/// Expected-value predicate evaluated atomically with a conditional write.
///
/// This is a deliberately small expression tree: it covers exactly the
/// comparisons the protocol needs and maps directly onto the condition
/// expressions of stores like DynamoDB.
#[derive(Debug, Clone)]
pub enum Expected {
    /// Every clause must hold.
    All(Vec<Expected>),
    /// At least one clause must hold.
    Any(Vec<Expected>),
    StatusIs(LeaseStatus),
    StatusIsNot(LeaseStatus),
    OwnerIs(String),
    /// `expires_at <= t`: the lease has lapsed.
    ExpiresAtOrBefore(i64),
    /// `expires_at >= t`: the lease is still live.
    ExpiresAtOrAfter(i64),
}

impl Expected {
    /// Evaluate against the current record state.
    pub fn holds(&self, lease: &ShardLease) -> bool {
        match self {
            Expected::All(clauses) => clauses.iter().all(|c| c.holds(lease)),
            Expected::Any(clauses) => clauses.iter().any(|c| c.holds(lease)),
            Expected::StatusIs(status) => lease.status == *status,
            Expected::StatusIsNot(status) => lease.status != *status,
            Expected::OwnerIs(id) => lease.owner.as_deref() == Some(id.as_str()),
            Expected::ExpiresAtOrBefore(t) => lease.expires_at <= *t,
            Expected::ExpiresAtOrAfter(t) => lease.expires_at >= *t,
        }
    }

    /// Acquisition predicate: `(available OR expired) AND NOT complete`.
    ///
    /// The scan already filters complete shards, but restating the exclusion
    /// here makes re-leasing a complete shard impossible at the store level
    /// even if the scan raced a completion.
    pub fn acquirable(now: i64) -> Self {
        Expected::All(vec![
            Expected::StatusIsNot(LeaseStatus::Complete),
            Expected::Any(vec![
                Expected::StatusIs(LeaseStatus::Available),
                Expected::ExpiresAtOrBefore(now),
            ]),
        ])
    }

    /// Renewal predicate: we still own a live lease.
    pub fn renewable_by(instance_id: &str, now: i64) -> Self {
        Expected::All(vec![
            Expected::OwnerIs(instance_id.to_string()),
            Expected::StatusIs(LeaseStatus::Leased),
            Expected::ExpiresAtOrAfter(now),
        ])
    }

    /// Checkpoint predicate: ownership and a live lease, status-agnostic.
    pub fn checkpointable_by(instance_id: &str, now: i64) -> Self {
        Expected::All(vec![
            Expected::OwnerIs(instance_id.to_string()),
            Expected::ExpiresAtOrAfter(now),
        ])
    }

    /// Completion predicate: only the current holder may finalize.
    pub fn completable_by(instance_id: &str) -> Self {
        Expected::All(vec![
            Expected::OwnerIs(instance_id.to_string()),
            Expected::StatusIs(LeaseStatus::Leased),
        ])
    }
}
