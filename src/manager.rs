//! Lease acquisition, renewal, checkpointing and completion.
//!
//! All mutual exclusion rests on the store's conditional writes. The manager
//! never trusts its own picture of a lease: every mutation ships the expected
//! prior state, and a precondition failure means some other worker got there
//! first. Losing a race is a normal outcome here, not an error.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::lease::{Expected, LeaseUpdate, ShardLease, now_ms};
use crate::metrics;
use crate::store::LeaseStore;

/// Outcome of one acquisition attempt.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// This worker now holds the lease.
    Acquired(ShardLease),
    /// A candidate existed but another worker won the conditional write.
    LostRace,
    /// No lease in the table is currently eligible.
    NoneEligible,
}

/// Drives lease state transitions through the store's conditional writes.
pub struct LeaseManager<S> {
    instance_id: String,
    lease_timeout_ms: i64,
    max_shards_per_instance: usize,
    store: Arc<S>,
}

impl<S: LeaseStore> LeaseManager<S> {
    pub fn new(
        instance_id: &str,
        lease_timeout_ms: i64,
        max_shards_per_instance: usize,
        store: Arc<S>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            lease_timeout_ms,
            max_shards_per_instance,
            store,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Fair-share shard quota for this worker: an even split of the shard
    /// total across live instances, rounded up, capped by the per-instance
    /// maximum.
    pub fn desired_shards(&self, total_shards: usize, live_instances: usize) -> usize {
        let live = live_instances.max(1);
        let share = total_shards.div_ceil(live);
        share.min(self.max_shards_per_instance)
    }

    /// Scan the lease table in store order and try to take the first eligible
    /// lease not already held by this worker.
    ///
    /// Exactly one candidate is attempted per scan. Every worker scans in the
    /// same order so contention focuses on the same lease; the loser backs
    /// off for the acquisition retry delay and rescans.
    pub async fn try_acquire_next<F>(&self, already_held: F) -> Result<AcquireOutcome, StoreError>
    where
        F: Fn(&str) -> bool,
    {
        let now = now_ms();
        let leases = self.store.list_leases().await?;
        let candidate = leases
            .iter()
            .find(|lease| lease.is_eligible(now) && !already_held(&lease.shard_id));

        let Some(candidate) = candidate else {
            return Ok(AcquireOutcome::NoneEligible);
        };

        let update = LeaseUpdate::acquire(&self.instance_id, now + self.lease_timeout_ms);
        match self
            .store
            .update_lease(&candidate.shard_id, update, Expected::acquirable(now))
            .await
        {
            Ok(lease) => {
                info!(
                    shard_id = %lease.shard_id,
                    instance_id = %self.instance_id,
                    expires_at = lease.expires_at,
                    checkpoint = ?lease.checkpoint,
                    "Acquired shard lease"
                );
                metrics::record_lease_transition("acquired");
                Ok(AcquireOutcome::Acquired(lease))
            }
            Err(StoreError::Precondition) => {
                debug!(shard_id = %candidate.shard_id, "Lost acquisition race");
                metrics::record_lease_transition("lost_race");
                Ok(AcquireOutcome::LostRace)
            }
            Err(e) => Err(e),
        }
    }

    /// Extend a held lease by one lease timeout. A precondition failure means
    /// ownership was lost (expiry or takeover) and the caller must stop
    /// processing the shard.
    pub async fn renew(&self, shard_id: &str) -> Result<ShardLease, StoreError> {
        let now = now_ms();
        let update = LeaseUpdate::renew(now + self.lease_timeout_ms);
        let lease = self
            .store
            .update_lease(shard_id, update, Expected::renewable_by(&self.instance_id, now))
            .await?;
        metrics::record_lease_transition("renewed");
        Ok(lease)
    }

    /// Persist a checkpoint for a held shard. Checkpointing also extends the
    /// lease, so a steadily progressing reader rarely depends on the
    /// heartbeat for renewal.
    pub async fn checkpoint(
        &self,
        shard_id: &str,
        sequence: &str,
        trigger: &str,
    ) -> Result<ShardLease, StoreError> {
        let now = now_ms();
        let update = LeaseUpdate::checkpoint(sequence, now + self.lease_timeout_ms);
        let lease = self
            .store
            .update_lease(
                shard_id,
                update,
                Expected::checkpointable_by(&self.instance_id, now),
            )
            .await?;
        debug!(shard_id, sequence, trigger, "Checkpoint persisted");
        metrics::record_checkpoint(trigger);
        Ok(lease)
    }

    /// Mark a shard complete. Terminal: a completed lease is never acquired
    /// again by any worker.
    pub async fn complete(&self, shard_id: &str) -> Result<ShardLease, StoreError> {
        let update = LeaseUpdate::complete();
        let lease = self
            .store
            .update_lease(shard_id, update, Expected::completable_by(&self.instance_id))
            .await?;
        info!(shard_id, "Shard marked complete");
        metrics::record_lease_transition("completed");
        Ok(lease)
    }

    /// Record a lease revocation (lost ownership) for observability. The
    /// store state is already correct; only local bookkeeping remains.
    pub fn note_revoked(&self, shard_id: &str) {
        warn!(shard_id, instance_id = %self.instance_id, "Lease ownership lost");
        metrics::record_lease_transition("revoked");
    }
}
