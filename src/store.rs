//! Lease store abstraction.
//!
//! A thin conditional-write layer over a durable key-value table, keyed by
//! `(type, id)` where `type` is `shard` or `instance`. Every mutating call is
//! optimistic: the caller supplies an [`Expected`] predicate that the store
//! evaluates atomically with the write. Implementations back onto stores with
//! native conditional writes (DynamoDB-style condition expressions, CAS
//! batches, transactional KV); the in-memory implementation in
//! [`store_memory`](crate::store_memory) serializes evaluation behind one
//! lock, which gives the same atomicity for tests.
//!
//! Ownership caching upstream is an optimization only; correctness always
//! comes from the predicate evaluated here, at write time.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::lease::{Expected, InstanceRecord, LeaseUpdate, ShardLease};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Conditional-write store for shard leases and instance records.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the backing table if it does not exist. Idempotent; called once
    /// at startup before any other operation.
    async fn create_table_if_missing(&self) -> StoreResult<()>;

    /// Insert a fresh lease record only if none exists for this shard id.
    ///
    /// Returns `false` when the record was already present. Concurrent
    /// creators racing on the same shard is expected during topology sync and
    /// is not an error.
    async fn put_lease_if_absent(&self, lease: &ShardLease) -> StoreResult<bool>;

    /// Apply `update` to the lease for `shard_id` iff `expected` holds at
    /// write time, returning the updated record.
    ///
    /// Fails with [`StoreError::Precondition`] when the predicate does not
    /// hold or no record exists. The store stamps `updated_at` on success.
    async fn update_lease(
        &self,
        shard_id: &str,
        update: LeaseUpdate,
        expected: Expected,
    ) -> StoreResult<ShardLease>;

    /// All lease records, in stable store order.
    async fn list_leases(&self) -> StoreResult<Vec<ShardLease>>;

    /// Upsert the instance record for `id`: increment its heartbeat counter
    /// and push `expires_at` to `now + ttl_ms`. Returns the stored record.
    async fn put_instance(&self, id: &str, ttl_ms: i64) -> StoreResult<InstanceRecord>;

    /// All instance records, including expired ones not yet reaped.
    async fn list_instances(&self) -> StoreResult<Vec<InstanceRecord>>;

    /// Delete an instance record. Idempotent; used for best-effort garbage
    /// collection of expired peers, so deleting a record another worker
    /// already removed is fine.
    async fn delete_instance(&self, id: &str) -> StoreResult<()>;
}
