//! In-memory lease store for testing.
//!
//! A full-featured implementation of [`LeaseStore`] that evaluates every
//! expected-value predicate under a single lock, giving the same
//! read-evaluate-write atomicity a conditional-write store provides. Shared
//! freely between simulated instances via `Clone`.
//!
//! Available during unit tests or with the `test-utilities` feature:
//!
//! ```toml
//! [dev-dependencies]
//! shardflow = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::lease::{Expected, InstanceRecord, LeaseUpdate, ShardLease, now_ms};
use crate::store::{LeaseStore, StoreResult};

#[derive(Debug, Default)]
struct Inner {
    table_created: bool,
    /// BTreeMap keeps listing order stable across calls, matching the
    /// store-returned-order assumption of the acquisition scan.
    leases: BTreeMap<String, ShardLease>,
    instances: BTreeMap<String, InstanceRecord>,
    /// Errors to inject, one per subsequent mutating call.
    fault_queue: VecDeque<StoreError>,
}

/// Shared in-memory [`LeaseStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error to be returned by the next mutating call. Queued
    /// faults are consumed in order, one per call.
    pub async fn inject_fault(&self, error: StoreError) {
        self.inner.lock().await.fault_queue.push_back(error);
    }

    /// Direct read of a lease record for test assertions.
    pub async fn lease(&self, shard_id: &str) -> Option<ShardLease> {
        self.inner.lock().await.leases.get(shard_id).cloned()
    }

    /// Overwrite a lease record unconditionally, for scenario setup.
    pub async fn seed_lease(&self, lease: ShardLease) {
        self.inner
            .lock()
            .await
            .leases
            .insert(lease.shard_id.clone(), lease);
    }

    pub async fn instance_count(&self) -> usize {
        self.inner.lock().await.instances.len()
    }
}

fn apply(lease: &mut ShardLease, update: LeaseUpdate) {
    if let Some(status) = update.status {
        lease.status = status;
    }
    if let Some(owner) = update.owner {
        lease.owner = Some(owner);
    }
    if let Some(expires_at) = update.expires_at {
        lease.expires_at = expires_at;
    }
    if let Some(checkpoint) = update.checkpoint {
        lease.checkpoint = Some(checkpoint);
    }
    if update.bump_heartbeat {
        lease.heartbeat_counter += 1;
    }
    lease.updated_at = now_ms();
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn create_table_if_missing(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.table_created = true;
        Ok(())
    }

    async fn put_lease_if_absent(&self, lease: &ShardLease) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner.fault_queue.pop_front() {
            return Err(fault);
        }
        if inner.leases.contains_key(&lease.shard_id) {
            return Ok(false);
        }
        inner.leases.insert(lease.shard_id.clone(), lease.clone());
        Ok(true)
    }

    async fn update_lease(
        &self,
        shard_id: &str,
        update: LeaseUpdate,
        expected: Expected,
    ) -> StoreResult<ShardLease> {
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner.fault_queue.pop_front() {
            return Err(fault);
        }
        let lease = inner
            .leases
            .get_mut(shard_id)
            .ok_or(StoreError::Precondition)?;
        if !expected.holds(lease) {
            return Err(StoreError::Precondition);
        }
        apply(lease, update);
        Ok(lease.clone())
    }

    async fn list_leases(&self) -> StoreResult<Vec<ShardLease>> {
        Ok(self.inner.lock().await.leases.values().cloned().collect())
    }

    async fn put_instance(&self, id: &str, ttl_ms: i64) -> StoreResult<InstanceRecord> {
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner.fault_queue.pop_front() {
            return Err(fault);
        }
        let record = inner
            .instances
            .entry(id.to_string())
            .or_insert_with(|| InstanceRecord {
                id: id.to_string(),
                expires_at: 0,
                heartbeat_counter: 0,
            });
        record.heartbeat_counter += 1;
        record.expires_at = now_ms() + ttl_ms;
        Ok(record.clone())
    }

    async fn list_instances(&self) -> StoreResult<Vec<InstanceRecord>> {
        Ok(self.inner.lock().await.instances.values().cloned().collect())
    }

    async fn delete_instance(&self, id: &str) -> StoreResult<()> {
        self.inner.lock().await.instances.remove(id);
        Ok(())
    }
}
