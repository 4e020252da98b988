//! Worker instance registry.
//!
//! Every worker upserts a presence row keyed by its instance id, refreshed on
//! the heartbeat cadence. The live instance count divides the shard total to
//! produce each worker's fair-share quota, so a stale count only skews quotas
//! until the next refresh rather than breaking mutual exclusion.

use std::sync::Arc;

use backon::Retryable;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::lease::{InstanceRecord, now_ms};
use crate::retry;
use crate::store::LeaseStore;

/// Tracks which worker instances are alive.
pub struct InstanceRegistry<S> {
    instance_id: String,
    ttl_ms: i64,
    store: Arc<S>,
}

impl<S: LeaseStore> InstanceRegistry<S> {
    pub fn new(instance_id: &str, ttl_ms: i64, store: Arc<S>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            ttl_ms,
            store,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Upsert this worker's presence row, extending its expiry by the TTL.
    /// Called once at startup and again on every heartbeat.
    pub async fn register(&self) -> Result<InstanceRecord, StoreError> {
        let record = (|| async { self.store.put_instance(&self.instance_id, self.ttl_ms).await })
            .retry(retry::store_policy())
            .when(StoreError::is_transient)
            .await?;
        debug!(instance_id = %self.instance_id, expires_at = record.expires_at, "Instance registered");
        Ok(record)
    }

    /// Remove this worker's presence row. Best effort during shutdown; an
    /// unremoved row simply ages out after the TTL.
    pub async fn deregister(&self) {
        if let Err(error) = self.store.delete_instance(&self.instance_id).await {
            warn!(instance_id = %self.instance_id, %error, "Failed to deregister instance");
        }
    }

    /// Count live instances, reaping expired rows along the way.
    ///
    /// This worker always counts itself even if its own row is missing or
    /// expired, so the quota denominator is never zero. Reaping is best
    /// effort: a failed delete leaves the row for the next scan.
    pub async fn live_instances(&self) -> Result<usize, StoreError> {
        let now = now_ms();
        let instances = (|| async { self.store.list_instances().await })
            .retry(retry::store_policy())
            .when(StoreError::is_transient)
            .await?;

        let mut live = 0usize;
        let mut saw_self = false;
        for instance in instances {
            if instance.id == self.instance_id {
                saw_self = true;
                live += 1;
                continue;
            }
            if instance.is_expired(now) {
                if let Err(error) = self.store.delete_instance(&instance.id).await {
                    warn!(instance_id = %instance.id, %error, "Failed to reap expired instance");
                }
            } else {
                live += 1;
            }
        }
        if !saw_self {
            live += 1;
        }
        Ok(live)
    }
}
