//! Shard topology reconciliation.
//!
//! On every sync, the stream's current shard set is folded into the lease
//! store: one create-if-absent per shard, seeding a fresh `available` lease
//! with `expires_at = 0`. Already-known shards are silently skipped, so any
//! number of workers can run the sync concurrently. Leases for shards the
//! stream no longer reports are left in place; reclaiming them is an
//! operator/garbage-collection policy, not part of the protocol.

use std::sync::Arc;

use backon::Retryable;
use tracing::{debug, info};

use crate::error::{StoreError, StreamError};
use crate::lease::ShardLease;
use crate::retry;
use crate::store::LeaseStore;
use crate::stream::{ShardDescription, StreamService};

/// Reconciles the stream's shard set into the lease store.
pub struct TopologyFetcher<S, K> {
    stream_name: String,
    store: Arc<S>,
    stream: Arc<K>,
}

impl<S: LeaseStore, K: StreamService> TopologyFetcher<S, K> {
    pub fn new(stream_name: &str, store: Arc<S>, stream: Arc<K>) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            store,
            stream,
        }
    }

    /// Describe the stream and seed a lease row per shard. Returns the full
    /// current shard list, which sizes the fair-share quota.
    pub async fn sync(&self) -> Result<Vec<ShardDescription>, crate::error::ConsumerError> {
        let shards = (|| async { self.stream.describe_stream(&self.stream_name).await })
            .retry(retry::describe_policy())
            .when(StreamError::is_transient)
            .await?;

        let mut created = 0usize;
        for shard in &shards {
            let lease = ShardLease::new_available(
                &shard.shard_id,
                &shard.hash_key_start,
                &shard.hash_key_end,
                shard.parent_shard_id.clone(),
            );
            let fresh = (|| async { self.store.put_lease_if_absent(&lease).await })
                .retry(retry::store_policy())
                .when(StoreError::is_transient)
                .await?;
            if fresh {
                created += 1;
                debug!(shard_id = %shard.shard_id, "Seeded lease for new shard");
            }
        }

        info!(
            stream = %self.stream_name,
            shard_count = shards.len(),
            created,
            "Topology sync complete"
        );
        Ok(shards)
    }
}

/// Hash-key routing table built from synced shard descriptions.
///
/// Maps a record's 128-bit hash key to the shard whose range contains it.
/// Closed parents and their children can coexist in a description list; the
/// table prefers childless shards (the current generation) for routing.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// `(start, end, shard_id)`, sorted by range start.
    ranges: Vec<(u128, u128, String)>,
}

impl RoutingTable {
    pub fn new(shards: &[ShardDescription]) -> Self {
        let parents: std::collections::HashSet<&str> = shards
            .iter()
            .filter_map(|s| s.parent_shard_id.as_deref())
            .collect();
        let mut ranges: Vec<(u128, u128, String)> = shards
            .iter()
            .filter(|s| !parents.contains(s.shard_id.as_str()))
            .filter_map(|s| {
                let start = s.hash_key_start.parse().ok()?;
                let end = s.hash_key_end.parse().ok()?;
                Some((start, end, s.shard_id.clone()))
            })
            .collect();
        ranges.sort_by_key(|(start, _, _)| *start);
        Self { ranges }
    }

    /// Shard owning `hash_key`, if any range covers it.
    pub fn route(&self, hash_key: u128) -> Option<&str> {
        self.ranges
            .iter()
            .find(|(start, end, _)| *start <= hash_key && hash_key <= *end)
            .map(|(_, _, shard_id)| shard_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
